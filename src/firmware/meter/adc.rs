use alloc::vec::Vec;
use core::convert::Infallible;

use embassy_time::Duration;
use embedded_hal::{
    delay::DelayNs,
    digital::{ErrorType, OutputPin},
};

use super::{DataSource, MeterError, Reading};

pub const ADC_FULL_SCALE_COUNTS: f64 = 4096.0;
pub const ADC_SAMPLES_PER_READ: u32 = 5;
const ADC_REFERENCE_VOLTS: f64 = 3.3;
const CONTROL_SETTLE_US: u32 = 10;

/// Raw 12-bit conversions from one ADC input.
pub trait AnalogInput {
    fn read_raw(&mut self) -> Result<u16, MeterError>;
}

/// Placeholder for meters that have no sensor power pin.
pub struct NoControlPin;

impl ErrorType for NoControlPin {
    type Error = Infallible;
}

impl OutputPin for NoControlPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Generic analog meter: averaged conversion scaled by `factor`.
pub struct AdcMeter<A, P, D> {
    input: A,
    control: Option<P>,
    delay: D,
    factor: f64,
    interval: Duration,
    shared_bus: bool,
    open: bool,
}

impl<A, P, D> AdcMeter<A, P, D>
where
    A: AnalogInput,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(input: A, control: Option<P>, delay: D, factor: f64, interval: Duration) -> Self {
        Self {
            input,
            control,
            delay,
            factor,
            interval,
            shared_bus: false,
            open: false,
        }
    }

    /// Marks the input as sitting on hardware the radio also drives.
    pub fn on_shared_bus(mut self) -> Self {
        self.shared_bus = true;
        self
    }

    pub fn scale(&self, raw: u32) -> f64 {
        f64::from(raw) * self.factor * (ADC_REFERENCE_VOLTS / ADC_FULL_SCALE_COUNTS)
    }

    fn sample_average(&mut self) -> Result<u32, MeterError> {
        let mut sum = 0u32;
        for _ in 0..ADC_SAMPLES_PER_READ {
            sum += u32::from(self.input.read_raw()?);
        }
        Ok(sum / ADC_SAMPLES_PER_READ)
    }
}

impl<A, P, D> DataSource for AdcMeter<A, P, D>
where
    A: AnalogInput,
    P: OutputPin,
    D: DelayNs,
{
    fn protocol(&self) -> &'static str {
        "genericAdc"
    }

    fn open(&mut self) -> Result<(), MeterError> {
        if let Some(control) = self.control.as_mut() {
            control.set_low().map_err(|_| MeterError::Open)?;
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), MeterError> {
        self.open = false;
        Ok(())
    }

    fn read(
        &mut self,
        out: &mut Vec<Reading>,
        max: usize,
        utc_ms: u64,
    ) -> Result<usize, MeterError> {
        if !self.open {
            return Err(MeterError::NotOpen);
        }
        if max == 0 {
            return Ok(0);
        }

        if let Some(control) = self.control.as_mut() {
            control.set_high().map_err(|_| MeterError::Read)?;
            self.delay.delay_us(CONTROL_SETTLE_US);
        }
        let averaged = self.sample_average();
        if let Some(control) = self.control.as_mut() {
            // Power the sensor down even when the conversion failed.
            let _ = control.set_low();
        }
        let raw = averaged?;

        let value = self.scale(raw);
        log::debug!("adc: raw={} value={:.2}", raw, value);
        out.push(Reading::new(None, utc_ms, value));
        Ok(1)
    }

    fn read_interval(&self) -> Duration {
        self.interval
    }

    fn uses_shared_bus(&self) -> bool {
        self.shared_bus
    }
}
