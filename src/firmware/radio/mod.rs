mod link;
mod time_sync;

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use statig::blocking::IntoStateMachineExt as _;

use crate::firmware::{config::RadioPolicy, meter::SupplyReading, telemetry};
use link::{LinkEvent, RadioLink};

pub use link::{LinkPhase, RadioStats};
pub use time_sync::{
    parse_sntp_reply, sntp_request, TimeSource, TimeSync, SNTP_PACKET_LEN, SNTP_PORT,
};

/// Link state as reported by the radio firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    BadAuth,
    NoNetwork,
    Failed,
    Down,
    Joined,
    NoIp,
    Up,
}

impl LinkStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadAuth => "authentication failure",
            Self::NoNetwork => "no matching ssid found",
            Self::Failed => "connection failed",
            Self::Down => "link down",
            Self::Joined => "joined",
            Self::NoIp => "joined, no ip address",
            Self::Up => "joined, has ip address",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioError {
    Init,
    Join(LinkStatus),
    Timeout,
}

impl RadioError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "radio init failed",
            Self::Join(status) => status.as_str(),
            Self::Timeout => "join timed out",
        }
    }
}

/// Supply level as sampled by the radio side of the board.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SupplyLevel {
    pub volts: f32,
    pub on_battery: bool,
}

#[allow(async_fn_in_trait)]
pub trait RadioDriver {
    /// Brings the radio hardware up; the inverse of `power_down`.
    async fn power_up(&mut self) -> Result<(), RadioError>;
    async fn power_down(&mut self);
    /// Associates and waits for an address, bounded by `timeout`.
    async fn join(&mut self, timeout: Duration) -> Result<(), RadioError>;
    fn link_status(&mut self) -> LinkStatus;
    fn set_led(&mut self, on: bool);
    fn read_supply(&mut self) -> Option<SupplyLevel>;
    fn bus_acquire(&mut self);
    fn bus_release(&mut self);
}

/// Held across a sensor read that shares hardware with the radio.
pub struct BusGuard<'a, D: RadioDriver> {
    driver: &'a mut D,
}

impl<D: RadioDriver> Drop for BusGuard<'_, D> {
    fn drop(&mut self) {
        self.driver.bus_release();
    }
}

/// Radio power and association on demand, with per-phase time accounting.
pub struct RadioController<D: RadioDriver, Y: DelayNs> {
    driver: D,
    delay: Y,
    policy: RadioPolicy,
    initialized: bool,
    link: statig::blocking::StateMachine<RadioLink>,
    monotonic: fn() -> Instant,
}

impl<D: RadioDriver, Y: DelayNs> RadioController<D, Y> {
    pub fn new(driver: D, delay: Y, policy: RadioPolicy) -> Self {
        Self::with_clock(driver, delay, policy, Instant::now)
    }

    pub fn with_clock(
        driver: D,
        delay: Y,
        policy: RadioPolicy,
        monotonic: fn() -> Instant,
    ) -> Self {
        Self {
            driver,
            delay,
            policy: policy.sanitized(),
            initialized: false,
            link: RadioLink::new(monotonic()).state_machine(),
            monotonic,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn phase(&self) -> LinkPhase {
        self.link.inner().phase
    }

    pub fn stats(&self) -> RadioStats {
        self.link.inner().stats
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn now(&self) -> Instant {
        (self.monotonic)()
    }

    /// Powers the radio (once) and tries to join up to `retries` times;
    /// `0` uses the configured count. Gives the radio back up on failure.
    pub async fn enable(&mut self, retries: u8) -> bool {
        if self.initialized && self.phase() == LinkPhase::Up && self.is_connected() {
            log::debug!("radio: enable skipped, already up");
            return true;
        }
        log::info!("radio: enabling");
        if !self.initialized {
            if let Err(err) = self.driver.power_up().await {
                log::error!("radio: power up failed err={}", err.as_str());
                telemetry::record_radio_enable_failure();
                return false;
            }
            self.initialized = true;
        } else {
            log::debug!(
                "radio: already initialised status={}",
                self.driver.link_status().as_str()
            );
        }
        let at = self.now();
        self.link.handle(&LinkEvent::PowerOn { at });

        let retries = if retries == 0 {
            self.policy.join_retries
        } else {
            retries
        };
        let timeout = Duration::from_millis(u64::from(self.policy.join_timeout_ms));
        let mut last_err = RadioError::Timeout;
        for attempt in 1..=retries {
            telemetry::record_radio_enable_attempt();
            log::info!("radio: enable attempt={}/{}", attempt, retries);
            self.driver.set_led(true);
            let result = self.driver.join(timeout).await;
            self.driver.set_led(false);
            match result {
                Ok(()) => {
                    let at = self.now();
                    self.link.handle(&LinkEvent::Joined { at });
                    telemetry::set_radio_link_up(true);
                    log::info!(
                        "radio: up attempt={} status={}",
                        attempt,
                        self.driver.link_status().as_str()
                    );
                    return true;
                }
                Err(err) => {
                    last_err = err;
                    self.link.handle(&LinkEvent::JoinFailed);
                    log::warn!("radio: join failed attempt={} err={}", attempt, err.as_str());
                    if attempt < retries {
                        self.delay.delay_ms(self.policy.retry_backoff_ms).await;
                    }
                }
            }
        }

        log::error!(
            "radio: giving up after attempts={} err={}",
            retries,
            last_err.as_str()
        );
        telemetry::record_radio_enable_failure();
        self.disable().await;
        false
    }

    /// Shuts the radio hardware down completely; no-op when already off.
    pub async fn disable(&mut self) {
        if !self.initialized {
            return;
        }
        log::info!("radio: disabling");
        let at = self.now();
        self.link.handle(&LinkEvent::PowerOff { at });
        self.driver.power_down().await;
        self.initialized = false;
        telemetry::set_radio_link_up(false);
    }

    pub fn link_status(&mut self) -> LinkStatus {
        if !self.initialized {
            return LinkStatus::Down;
        }
        self.driver.link_status()
    }

    /// Live query; a dropped link is reflected in the time accounting.
    pub fn is_connected(&mut self) -> bool {
        let status = self.link_status();
        log::trace!("radio: link status={}", status.as_str());
        let up = status == LinkStatus::Up;
        if !up && self.phase() == LinkPhase::Up {
            log::warn!("radio: link lost status={}", status.as_str());
            let at = self.now();
            self.link.handle(&LinkEvent::LinkLost { at });
            telemetry::set_radio_link_up(false);
        }
        up
    }

    /// Short LED pulse; only meaningful while the radio is powered.
    pub async fn blink(&mut self) {
        if !self.initialized {
            return;
        }
        self.driver.set_led(true);
        self.delay.delay_ms(self.policy.led_blink_ms).await;
        self.driver.set_led(false);
    }

    /// Samples the supply while the radio is up.
    pub fn measure_voltage(&mut self, utc_ms: u64) -> Option<SupplyReading> {
        if !self.initialized {
            return None;
        }
        let level = self.driver.read_supply()?;
        telemetry::set_supply_voltage(level.volts);
        Some(SupplyReading {
            volts: level.volts,
            on_battery: level.on_battery,
            utc_ms,
        })
    }

    /// Serialises a sensor read against radio traffic. `None` when the
    /// radio is off and the bus is free anyway.
    pub fn bus_guard(&mut self) -> Option<BusGuard<'_, D>> {
        if !self.initialized {
            return None;
        }
        self.driver.bus_acquire();
        Some(BusGuard {
            driver: &mut self.driver,
        })
    }

    pub fn log_statistics(&self) {
        let stats = self.stats();
        log::info!(
            "radio: sessions={} failures={} connecting_s={} up_s={} down_s={}",
            stats.sessions,
            stats.failures,
            stats.connecting_ms / 1_000,
            stats.up_ms / 1_000,
            stats.down_ms / 1_000
        );
    }
}

#[cfg(test)]
mod tests;
