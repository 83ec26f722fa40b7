//! ESP32 bring-up: peripherals, heap, WiFi and IP stack, socket workers,
//! then the startup sequence and the scheduling loop on the embassy
//! executor.

mod board;
mod sntp;
mod transport;
mod wifi;

use alloc::{boxed::Box, string::String, vec, vec::Vec};
use core::cell::RefCell;

use embassy_time::{Delay, Duration, Instant, Timer};
use esp_hal::{
    analog::adc::{Adc, AdcConfig, Attenuation},
    clock::CpuClock as HalCpuClock,
    gpio::{Level, Output, OutputConfig},
    timer::timg::TimerGroup,
};
use esp_radio::wifi::WifiController;
use esp_rtos::embassy::Executor;
use static_cell::StaticCell;

use self::{
    board::{Adc1, AdcInput, EspBoard, EspClock, EspHeap, MeterPin, HEAP_PROBE},
    sntp::SntpClient,
    transport::{EspTransport, CLIENT_SLOTS},
    wifi::{EspRadio, SupplySense},
};
use crate::firmware::{
    config::{BuildSettings, NetPolicy, RadioPolicy, SchedulerPolicy, VERSION},
    meter::{AdcMeter, NoControlPin, SelfMonitorMeter, SupplyCell},
    net::Registry,
    power::ClockSpeedController,
    radio::{RadioController, TimeSource, TimeSync},
    sched::{assign_channels, PlannedSource, Platform, Scheduler, SourcePlan},
    types::FirmwareError,
    upload::Uploader,
};

const HEAP_SIZE: usize = 72 * 1024;
const ADC_METER_INTERVAL: Duration = Duration::from_secs(60);
const ADC_METER_FACTOR: f64 = 1.0;
const SELF_MONITOR_INTERVAL: Duration = Duration::from_secs(300);
const FATAL_FLUSH_MS: u64 = 200;

static SUPPLY: SupplyCell = SupplyCell::new();

const ADC_METRICS: &[Option<&str>] = &[None];
const SELF_MONITOR_METRICS: &[Option<&str>] = &[
    Some("MemFree"),
    Some("MemTotal"),
    Some("Voltage"),
    Some("OnBattery"),
];

type MeterAdcPin = esp_hal::analog::adc::AdcPin<MeterPin, esp_hal::peripherals::ADC1<'static>>;

/// Hardware handed from bring-up to the startup task.
struct BootParts {
    settings: BuildSettings,
    controller: WifiController<'static>,
    stack: embassy_net::Stack<'static>,
    led: Output<'static>,
    adc: &'static RefCell<Adc1>,
    meter_pin: MeterAdcPin,
    supply: SupplySense,
}

pub fn run() -> ! {
    let config = esp_hal::Config::default().with_cpu_clock(HalCpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: HEAP_SIZE);
    esp_println::logger::init_logger(log::LevelFilter::Info);
    esp_println::println!("meterlink {} starting", VERSION);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let settings = BuildSettings::from_env();
    let led = Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default());

    let mut adc_config = AdcConfig::new();
    let meter_pin = adc_config.enable_pin(peripherals.GPIO34, Attenuation::_11dB);
    let supply_pin = adc_config.enable_pin(peripherals.GPIO35, Attenuation::_11dB);
    static ADC1_UNIT: StaticCell<RefCell<Adc1>> = StaticCell::new();
    let adc: &'static RefCell<Adc1> =
        ADC1_UNIT.init(RefCell::new(Adc::new(peripherals.ADC1, adc_config)));
    let supply = SupplySense::new(AdcInput::new(adc, supply_pin));

    let net = match wifi::setup(peripherals.WIFI, settings.hostname) {
        Ok(net) => net,
        Err(reason) => reset_now(reason),
    };
    let stack = net.stack;
    let parts = BootParts {
        settings,
        controller: net.controller,
        stack,
        led,
        adc,
        meter_pin,
        supply,
    };

    static EXECUTOR: StaticCell<Executor> = StaticCell::new();
    let executor = EXECUTOR.init(Executor::new());
    executor.run(move |spawner| {
        spawner.must_spawn(wifi::net_task(net.runner));
        spawner.must_spawn(transport::dns_task(stack));
        spawner.must_spawn(transport::listener_task(stack));
        for slot in 0..CLIENT_SLOTS {
            spawner.must_spawn(transport::client_socket_task(stack, slot));
        }
        spawner.must_spawn(boot_task(parts));
    });
}

#[embassy_executor::task]
async fn boot_task(parts: BootParts) {
    match start(parts).await {
        Ok(scheduler) => scheduler.run().await,
        Err(err) => fatal(err).await,
    }
}

fn source_plans(adc: &'static RefCell<Adc1>, meter_pin: MeterAdcPin) -> Vec<SourcePlan> {
    let analog = AdcMeter::new(
        AdcInput::new(adc, meter_pin),
        None::<NoControlPin>,
        Delay,
        ADC_METER_FACTOR,
        ADC_METER_INTERVAL,
    );
    let monitor = SelfMonitorMeter::new(EspHeap, &SUPPLY, SELF_MONITOR_INTERVAL);
    vec![
        SourcePlan {
            source: Box::new(analog),
            identifiers: ADC_METRICS,
        },
        SourcePlan {
            source: Box::new(monitor),
            identifiers: SELF_MONITOR_METRICS,
        },
    ]
}

async fn start(parts: BootParts) -> Result<Scheduler<EspBoard>, FirmwareError> {
    let BootParts {
        settings,
        controller,
        stack,
        led,
        adc,
        meter_pin,
        supply,
    } = parts;

    let planned: Vec<PlannedSource> = assign_channels(source_plans(adc, meter_pin), |index| {
        settings.channel_uuid(index)
    });
    if planned.is_empty() {
        return Err(FirmwareError::NoSources);
    }
    for source in planned.iter() {
        log::info!(
            "boot: source protocol={} channels={}",
            source.protocol(),
            source.channels().len()
        );
    }

    let Some(ssid) = settings.wifi_ssid else {
        log::error!("boot: no wifi ssid configured");
        return Err(FirmwareError::RadioUnavailable);
    };
    let driver = EspRadio::new(controller, stack, led, supply, ssid, settings.wifi_password);
    let mut radio = RadioController::new(driver, Delay, RadioPolicy::defaults());
    if !radio.enable(0).await {
        return Err(FirmwareError::RadioUnavailable);
    }
    if let Some(config) = stack.config_v4() {
        log::info!("boot: address={}", config.address.address());
    }

    let mut sntp = SntpClient::new(stack, settings.ntp_server);
    let time = TimeSync::initial(sntp.query_utc().await, Instant::now())
        .ok_or(FirmwareError::NoTimeReference)?;

    let mut transport = EspTransport::default();
    let net_policy = NetPolicy::defaults();
    let mut registry = Registry::new(net_policy);
    let conn = registry.get_or_create(&mut transport, settings.middleware)?;
    let base_path = match registry.get_mut(conn) {
        Some(collector) => {
            Uploader::install_headers(collector);
            collector
                .endpoint()
                .map(|endpoint| String::from(endpoint.path()))
                .unwrap_or_default()
        }
        None => String::new(),
    };
    registry.start_server(&mut transport, net_policy.httpd_port)?;

    let entries = planned
        .into_iter()
        .map(|source| source.into_entry(conn, &base_path))
        .collect();
    let platform = Platform::<EspBoard> {
        transport,
        radio,
        clock: ClockSpeedController::new(EspClock, Instant::now()),
        time_source: sntp,
        delay: Delay,
    };
    let mut scheduler = Scheduler::new(
        entries,
        registry,
        platform,
        time,
        &SUPPLY,
        SchedulerPolicy::defaults(),
    )
    .with_heap_probe(&HEAP_PROBE)
    .with_tz_offset(settings.tz_offset_min);
    scheduler.start()?;
    Ok(scheduler)
}

async fn fatal(err: FirmwareError) -> ! {
    log::error!("boot: fatal err={} resetting", err.as_str());
    Timer::after(Duration::from_millis(FATAL_FLUSH_MS)).await;
    esp_hal::system::software_reset()
}

fn reset_now(reason: &str) -> ! {
    esp_println::println!("meterlink: fatal {} resetting", reason);
    esp_hal::delay::Delay::new().delay_millis(FATAL_FLUSH_MS as u32);
    esp_hal::system::software_reset()
}
