use embassy_net::{Runner, Stack, StackResources};
use embassy_time::{with_timeout, Duration};
use esp_hal::{gpio::Output, rng::Rng};
use esp_radio::wifi::{
    AuthMethod, ClientConfig, Config as WifiRuntimeConfig, ModeConfig, ScanMethod,
    WifiController, WifiDevice,
};
use static_cell::StaticCell;

use super::board::{AdcInput, SupplyPin};
use crate::firmware::{
    meter::{AnalogInput, ADC_FULL_SCALE_COUNTS},
    radio::{LinkStatus, RadioDriver, RadioError, SupplyLevel},
};

const WIFI_RX_QUEUE_SIZE: usize = 3;
const WIFI_TX_QUEUE_SIZE: usize = 2;
const WIFI_STATIC_RX_BUF_NUM: u8 = 4;
const WIFI_DYNAMIC_RX_BUF_NUM: u16 = 8;
const WIFI_DYNAMIC_TX_BUF_NUM: u16 = 8;
const WIFI_RX_BA_WIN: u8 = 3;
// TCP workers, listener, DNS and SNTP.
const STACK_SOCKETS: usize = 7;

// Board divides the supply by two ahead of the ADC pin.
const SUPPLY_DIVIDER: f32 = 2.0;
const SUPPLY_REFERENCE_VOLTS: f32 = 3.3;
// Anything below this is not USB power.
const USB_SUPPLY_MIN_VOLTS: f32 = 4.5;

pub struct NetParts {
    pub(super) controller: WifiController<'static>,
    pub(super) runner: Runner<'static, WifiDevice<'static>>,
    pub(super) stack: Stack<'static>,
}

fn wifi_runtime_config() -> WifiRuntimeConfig {
    WifiRuntimeConfig::default()
        .with_rx_queue_size(WIFI_RX_QUEUE_SIZE)
        .with_tx_queue_size(WIFI_TX_QUEUE_SIZE)
        .with_static_rx_buf_num(WIFI_STATIC_RX_BUF_NUM)
        .with_dynamic_rx_buf_num(WIFI_DYNAMIC_RX_BUF_NUM)
        .with_dynamic_tx_buf_num(WIFI_DYNAMIC_TX_BUF_NUM)
        .with_ampdu_rx_enable(false)
        .with_ampdu_tx_enable(false)
        .with_rx_ba_win(WIFI_RX_BA_WIN)
}

/// Radio driver and IP stack. The station is configured but not started.
pub(super) fn setup(
    wifi: esp_hal::peripherals::WIFI<'static>,
    hostname: &'static str,
) -> Result<NetParts, &'static str> {
    static RADIO_CTRL: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
    static STACK_RESOURCES: StaticCell<StackResources<STACK_SOCKETS>> = StaticCell::new();

    let radio_ctrl = esp_radio::init().map_err(|_| "esp_radio::init failed")?;
    let radio_ctrl = RADIO_CTRL.init(radio_ctrl);
    let (controller, ifaces) = esp_radio::wifi::new(radio_ctrl, wifi, wifi_runtime_config())
        .map_err(|_| "wifi init failed")?;

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let mut dhcp = embassy_net::DhcpConfig::default();
    let mut name = heapless::String::new();
    if name.push_str(hostname).is_ok() {
        dhcp.hostname = Some(name);
    }
    let (stack, runner) = embassy_net::new(
        ifaces.sta,
        embassy_net::Config::dhcpv4(dhcp),
        STACK_RESOURCES.init(StackResources::<STACK_SOCKETS>::new()),
        seed,
    );

    Ok(NetParts {
        controller,
        runner,
        stack,
    })
}

#[embassy_executor::task]
pub(super) async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) {
    runner.run().await
}

fn client_mode(ssid: &str, password: &str) -> ModeConfig {
    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::Wpa2Personal
    };
    ModeConfig::Client(
        ClientConfig::default()
            .with_ssid(ssid.into())
            .with_password(password.into())
            .with_auth_method(auth_method)
            .with_scan_method(ScanMethod::AllChannels),
    )
}

/// Supply voltage through a divider on an ADC1 pin.
pub struct SupplySense {
    input: AdcInput<SupplyPin>,
}

impl SupplySense {
    pub(super) fn new(input: AdcInput<SupplyPin>) -> Self {
        Self { input }
    }

    fn read(&mut self) -> Option<SupplyLevel> {
        let raw = self.input.read_raw().ok()?;
        let volts = f32::from(raw) * SUPPLY_REFERENCE_VOLTS / ADC_FULL_SCALE_COUNTS as f32
            * SUPPLY_DIVIDER;
        Some(SupplyLevel {
            volts,
            on_battery: volts < USB_SUPPLY_MIN_VOLTS,
        })
    }
}

/// esp-radio station with the status LED and supply sense that share its
/// power domain.
pub struct EspRadio {
    controller: WifiController<'static>,
    stack: Stack<'static>,
    led: Output<'static>,
    supply: SupplySense,
    ssid: &'static str,
    password: &'static str,
    configured: bool,
    bus_held: bool,
}

impl EspRadio {
    pub(super) fn new(
        controller: WifiController<'static>,
        stack: Stack<'static>,
        led: Output<'static>,
        supply: SupplySense,
        ssid: &'static str,
        password: &'static str,
    ) -> Self {
        Self {
            controller,
            stack,
            led,
            supply,
            ssid,
            password,
            configured: false,
            bus_held: false,
        }
    }
}

impl RadioDriver for EspRadio {
    async fn power_up(&mut self) -> Result<(), RadioError> {
        if !self.configured {
            let mode = client_mode(self.ssid, self.password);
            if let Err(err) = self.controller.set_config(&mode) {
                log::error!("wifi: station config err={:?}", err);
                return Err(RadioError::Init);
            }
            self.configured = true;
        }
        match self.controller.is_started() {
            Ok(true) => Ok(()),
            Ok(false) => self.controller.start_async().await.map_err(|err| {
                log::error!("wifi: start err={:?}", err);
                RadioError::Init
            }),
            Err(err) => {
                log::error!("wifi: status err={:?}", err);
                Err(RadioError::Init)
            }
        }
    }

    async fn power_down(&mut self) {
        let _ = self.controller.disconnect_async().await;
        let _ = self.controller.stop_async().await;
        self.led.set_low();
    }

    async fn join(&mut self, timeout: Duration) -> Result<(), RadioError> {
        let stack = self.stack;
        let controller = &mut self.controller;
        let joined = with_timeout(timeout, async {
            if let Err(err) = controller.connect_async().await {
                log::warn!("wifi: connect err={:?}", err);
                return Err(RadioError::Join(LinkStatus::Failed));
            }
            stack.wait_config_up().await;
            Ok(())
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(_) => {
                let _ = self.controller.disconnect_async().await;
                Err(RadioError::Timeout)
            }
        }
    }

    fn link_status(&mut self) -> LinkStatus {
        match self.controller.is_connected() {
            Ok(true) if self.stack.is_config_up() => LinkStatus::Up,
            Ok(true) => LinkStatus::NoIp,
            Ok(false) => LinkStatus::Down,
            Err(_) => LinkStatus::Failed,
        }
    }

    fn set_led(&mut self, on: bool) {
        if on {
            self.led.set_high();
        } else {
            self.led.set_low();
        }
    }

    fn read_supply(&mut self) -> Option<SupplyLevel> {
        self.supply.read()
    }

    fn bus_acquire(&mut self) {
        if self.bus_held {
            log::debug!("wifi: bus already held");
        }
        self.bus_held = true;
    }

    fn bus_release(&mut self) {
        self.bus_held = false;
    }
}
