use core::cell::RefCell;

use esp_hal::{
    analog::adc::{Adc, AdcChannel, AdcPin},
    peripherals::{ADC1, GPIO34, GPIO35},
    Blocking,
};

use super::{sntp::SntpClient, transport::EspTransport, wifi::EspRadio};
use crate::firmware::{
    meter::{AnalogInput, MeterError, SystemProbe},
    power::CpuClock,
    sched::Board,
};

pub type Adc1 = Adc<'static, ADC1<'static>, Blocking>;
pub type MeterPin = GPIO34<'static>;
pub type SupplyPin = GPIO35<'static>;

/// The concrete ESP32 board the scheduler runs on.
pub struct EspBoard;

impl Board for EspBoard {
    type Transport = EspTransport;
    type Radio = EspRadio;
    type RadioDelay = embassy_time::Delay;
    type Cpu = EspClock;
    type Time = SntpClient;
    type Delay = embassy_time::Delay;
}

/// One pin of the shared ADC1 unit.
pub struct AdcInput<P> {
    adc: &'static RefCell<Adc1>,
    pin: AdcPin<P, ADC1<'static>>,
}

impl<P> AdcInput<P> {
    pub(super) fn new(adc: &'static RefCell<Adc1>, pin: AdcPin<P, ADC1<'static>>) -> Self {
        Self { adc, pin }
    }
}

impl<P: AdcChannel> AnalogInput for AdcInput<P> {
    fn read_raw(&mut self) -> Result<u16, MeterError> {
        let mut adc = self.adc.try_borrow_mut().map_err(|_| MeterError::Bus)?;
        nb::block!(adc.read_oneshot(&mut self.pin)).map_err(|_| MeterError::Read)
    }
}

#[derive(Clone, Copy)]
pub struct EspHeap;

impl SystemProbe for EspHeap {
    fn heap_free(&self) -> usize {
        esp_alloc::HEAP.free()
    }

    fn heap_total(&self) -> usize {
        esp_alloc::HEAP.used() + esp_alloc::HEAP.free()
    }
}

pub(super) static HEAP_PROBE: EspHeap = EspHeap;

// CPUPERIOD_SEL steps with the PLL as clock source.
const CPU_STEPS_MHZ: [u32; 3] = [80, 160, 240];
const LOW_STEPS_MHZ: &[u32] = &[160, 80];

/// CPU frequency through the DPORT period selector. APB stays at 80 MHz,
/// so timers keep their rate across switches.
pub struct EspClock;

impl EspClock {
    fn selector() -> u8 {
        unsafe { (*esp32::DPORT::PTR).cpu_per_conf().read().cpuperiod_sel().bits() }
    }
}

impl CpuClock for EspClock {
    fn current_mhz(&self) -> u32 {
        CPU_STEPS_MHZ
            .get(usize::from(Self::selector()))
            .copied()
            .unwrap_or(240)
    }

    fn low_steps(&self) -> &'static [u32] {
        LOW_STEPS_MHZ
    }

    fn set_mhz(&mut self, mhz: u32) -> bool {
        let Some(selector) = CPU_STEPS_MHZ.iter().position(|step| *step == mhz) else {
            return false;
        };
        unsafe {
            (*esp32::DPORT::PTR)
                .cpu_per_conf()
                .modify(|_, w| w.cpuperiod_sel().bits(selector as u8));
        }
        true
    }
}
