mod adc;
mod channel;
mod selfmon;

use alloc::vec::Vec;

use embassy_time::Duration;

pub use adc::{AdcMeter, AnalogInput, NoControlPin, ADC_FULL_SCALE_COUNTS, ADC_SAMPLES_PER_READ};
pub use channel::{MeterChannel, Sample};
pub use selfmon::{SelfMonitorMeter, SupplyCell, SupplyReading, SystemProbe};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeterError {
    Open,
    Read,
    NotOpen,
    Bus,
}

impl MeterError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "meter open failed",
            Self::Read => "meter read failed",
            Self::NotOpen => "meter not open",
            Self::Bus => "meter bus busy",
        }
    }
}

/// One value produced by a source. `identifier` selects the channel it
/// belongs to when a source publishes several metrics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub identifier: Option<&'static str>,
    pub ts_ms: u64,
    pub value: f64,
}

impl Reading {
    pub const fn new(identifier: Option<&'static str>, ts_ms: u64, value: f64) -> Self {
        Self {
            identifier,
            ts_ms,
            value,
        }
    }
}

/// Capability every meter variant implements; picked at configuration time.
pub trait DataSource {
    fn protocol(&self) -> &'static str;

    fn open(&mut self) -> Result<(), MeterError>;

    fn close(&mut self) -> Result<(), MeterError>;

    /// Appends at most `max` readings stamped with `utc_ms` and returns how
    /// many were produced.
    fn read(&mut self, out: &mut Vec<Reading>, max: usize, utc_ms: u64)
        -> Result<usize, MeterError>;

    fn read_interval(&self) -> Duration;

    /// The source misbehaves below the default CPU clock.
    fn needs_default_clock(&self) -> bool {
        true
    }

    /// The source shares hardware with the radio and must not be read while
    /// network I/O is in flight.
    fn uses_shared_bus(&self) -> bool {
        false
    }
}
