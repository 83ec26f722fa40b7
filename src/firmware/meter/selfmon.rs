use alloc::vec::Vec;
use core::cell::Cell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::Duration;

use super::{DataSource, MeterError, Reading};

const ID_MEM_FREE: &str = "MemFree";
const ID_MEM_TOTAL: &str = "MemTotal";
const ID_VOLTAGE: &str = "Voltage";
const ID_ON_BATTERY: &str = "OnBattery";

/// Supply measurement taken while the radio was up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SupplyReading {
    pub volts: f32,
    pub on_battery: bool,
    pub utc_ms: u64,
}

/// Last supply measurement, written by the loop and read by the self monitor.
pub struct SupplyCell(Mutex<CriticalSectionRawMutex, Cell<Option<SupplyReading>>>);

impl SupplyCell {
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(None)))
    }

    pub fn store(&self, reading: SupplyReading) {
        self.0.lock(|cell| cell.set(Some(reading)));
    }

    pub fn latest(&self) -> Option<SupplyReading> {
        self.0.lock(Cell::get)
    }
}

impl Default for SupplyCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Heap figures of the running firmware.
pub trait SystemProbe {
    fn heap_free(&self) -> usize;
    fn heap_total(&self) -> usize;
}

/// Publishes the logger's own health as readings.
pub struct SelfMonitorMeter<S> {
    probe: S,
    supply: &'static SupplyCell,
    interval: Duration,
}

impl<S: SystemProbe> SelfMonitorMeter<S> {
    pub fn new(probe: S, supply: &'static SupplyCell, interval: Duration) -> Self {
        Self {
            probe,
            supply,
            interval,
        }
    }
}

impl<S: SystemProbe> DataSource for SelfMonitorMeter<S> {
    fn protocol(&self) -> &'static str {
        "selfmon"
    }

    fn open(&mut self) -> Result<(), MeterError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), MeterError> {
        Ok(())
    }

    fn read(
        &mut self,
        out: &mut Vec<Reading>,
        max: usize,
        utc_ms: u64,
    ) -> Result<usize, MeterError> {
        let mut metrics: [Option<Reading>; 4] = [
            Some(Reading::new(Some(ID_MEM_FREE), utc_ms, self.probe.heap_free() as f64)),
            Some(Reading::new(Some(ID_MEM_TOTAL), utc_ms, self.probe.heap_total() as f64)),
            None,
            None,
        ];
        if let Some(supply) = self.supply.latest() {
            metrics[2] = Some(Reading::new(
                Some(ID_VOLTAGE),
                supply.utc_ms,
                f64::from(supply.volts),
            ));
            metrics[3] = Some(Reading::new(
                Some(ID_ON_BATTERY),
                supply.utc_ms,
                if supply.on_battery { 1.0 } else { 0.0 },
            ));
        }

        let before = out.len();
        out.extend(metrics.into_iter().flatten().take(max));
        Ok(out.len() - before)
    }

    fn read_interval(&self) -> Duration {
        self.interval
    }
}
