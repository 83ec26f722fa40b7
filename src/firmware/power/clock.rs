use embassy_time::Instant;

/// CPU frequency switch of the target.
pub trait CpuClock {
    fn current_mhz(&self) -> u32;
    /// Frequencies usable as the reduced-power setting.
    fn low_steps(&self) -> &'static [u32];
    fn set_mhz(&mut self, mhz: u32) -> bool;
}

/// Cumulative time spent at each clock setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockStats {
    pub default_ms: u64,
    pub low_ms: u64,
    pub switches: u32,
}

/// Switches the CPU between its boot frequency and a reduced one.
pub struct ClockSpeedController<C> {
    clock: C,
    default_mhz: u32,
    stats: ClockStats,
    since: Instant,
}

impl<C: CpuClock> ClockSpeedController<C> {
    /// The frequency at construction time is taken as the default.
    pub fn new(clock: C, now: Instant) -> Self {
        let default_mhz = clock.current_mhz();
        Self {
            clock,
            default_mhz,
            stats: ClockStats::default(),
            since: now,
        }
    }

    pub fn default_mhz(&self) -> u32 {
        self.default_mhz
    }

    pub fn current_mhz(&self) -> u32 {
        self.clock.current_mhz()
    }

    pub fn is_default(&self) -> bool {
        self.clock.current_mhz() == self.default_mhz
    }

    /// Nearest supported step to `default / divisor`; ties go to the lower
    /// frequency. `None` when down-clocking is disabled.
    pub fn low_target(&self, divisor: u8) -> Option<u32> {
        if divisor == 0 {
            return None;
        }
        let wanted = self.default_mhz / u32::from(divisor);
        self.clock
            .low_steps()
            .iter()
            .copied()
            .filter(|mhz| *mhz < self.default_mhz)
            .min_by_key(|mhz| (mhz.abs_diff(wanted), *mhz))
    }

    pub fn set_default(&mut self, now: Instant) -> bool {
        if self.is_default() {
            return true;
        }
        self.switch_to(self.default_mhz, now)
    }

    pub fn set_low(&mut self, divisor: u8, now: Instant) -> bool {
        let Some(target) = self.low_target(divisor) else {
            return false;
        };
        if self.clock.current_mhz() == target {
            return true;
        }
        self.switch_to(target, now)
    }

    fn switch_to(&mut self, mhz: u32, now: Instant) -> bool {
        let from = self.clock.current_mhz();
        self.account(now);
        if !self.clock.set_mhz(mhz) {
            log::warn!("clock: switch failed from_mhz={} to_mhz={}", from, mhz);
            return false;
        }
        self.stats.switches = self.stats.switches.saturating_add(1);
        log::debug!("clock: from_mhz={} to_mhz={}", from, mhz);
        true
    }

    /// Books the time since the last call onto the current setting.
    pub fn account(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.since).as_millis();
        self.since = now;
        if self.is_default() {
            self.stats.default_ms = self.stats.default_ms.saturating_add(elapsed);
        } else {
            self.stats.low_ms = self.stats.low_ms.saturating_add(elapsed);
        }
    }

    pub fn stats(&mut self, now: Instant) -> ClockStats {
        self.account(now);
        self.stats
    }
}
