//! Power-aware scheduling loop.
//!
//! One pass per tick: due reads, send windows, connection housekeeping,
//! then the radio and CPU clock are brought down whenever nothing needs
//! them. Every fault below startup is logged and retried on a later tick.

mod entry;


use alloc::{collections::BTreeMap, vec::Vec};

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

pub use entry::{assign_channels, PlannedSource, SchedulingEntry, SourcePlan};

use crate::firmware::{
    config::{SchedulerPolicy, TransportEvents, TRANSPORT_EVENTS},
    meter::{SupplyCell, SystemProbe},
    net::{Registry, StatusServer, Transport},
    power::{ClockSpeedController, CpuClock},
    radio::{RadioController, RadioDriver, TimeSource, TimeSync},
    telemetry,
    timefmt,
    types::{ConnId, ConnState, FirmwareError},
    upload::UploadProgress,
};

/// Hardware seams the loop is generic over.
pub trait Board {
    type Transport: Transport;
    type Radio: RadioDriver;
    type RadioDelay: DelayNs;
    type Cpu: CpuClock;
    type Time: TimeSource;
    type Delay: DelayNs;
}

/// Hardware handles moved into the loop at startup.
pub struct Platform<B: Board> {
    pub transport: B::Transport,
    pub radio: RadioController<B::Radio, B::RadioDelay>,
    pub clock: ClockSpeedController<B::Cpu>,
    pub time_source: B::Time,
    pub delay: B::Delay,
}

/// What one tick decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickReport {
    pub next_due: Duration,
    pub radio_up: bool,
    pub clock_default: bool,
}

pub struct Scheduler<B: Board> {
    entries: Vec<SchedulingEntry>,
    registry: Registry,
    transport: B::Transport,
    radio: RadioController<B::Radio, B::RadioDelay>,
    clock: ClockSpeedController<B::Cpu>,
    time_source: B::Time,
    delay: B::Delay,
    time: TimeSync,
    events: &'static TransportEvents,
    supply: &'static SupplyCell,
    heap: Option<&'static dyn SystemProbe>,
    policy: SchedulerPolicy,
    tz_offset_min: i32,
    monotonic: fn() -> Instant,
    ticks: u32,
    last_send_complete: Instant,
    window_open: bool,
    resync_due: bool,
    // Entry whose batch is out on a shared connection.
    exchanges: BTreeMap<ConnId, usize>,
}

impl<B: Board> Scheduler<B> {
    pub fn new(
        entries: Vec<SchedulingEntry>,
        registry: Registry,
        platform: Platform<B>,
        time: TimeSync,
        supply: &'static SupplyCell,
        policy: SchedulerPolicy,
    ) -> Self {
        Self {
            entries,
            registry,
            transport: platform.transport,
            radio: platform.radio,
            clock: platform.clock,
            time_source: platform.time_source,
            delay: platform.delay,
            time,
            events: &TRANSPORT_EVENTS,
            supply,
            heap: None,
            policy: policy.sanitized(),
            tz_offset_min: 0,
            monotonic: Instant::now,
            ticks: 0,
            last_send_complete: Instant::from_ticks(0),
            window_open: false,
            resync_due: false,
            exchanges: BTreeMap::new(),
        }
    }

    pub fn with_clock(mut self, monotonic: fn() -> Instant) -> Self {
        self.monotonic = monotonic;
        self
    }

    pub fn with_events(mut self, events: &'static TransportEvents) -> Self {
        self.events = events;
        self
    }

    pub fn with_heap_probe(mut self, probe: &'static dyn SystemProbe) -> Self {
        self.heap = Some(probe);
        self
    }

    pub fn with_tz_offset(mut self, minutes: i32) -> Self {
        self.tz_offset_min = minutes;
        self
    }

    pub fn entries(&self) -> &[SchedulingEntry] {
        &self.entries
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport_mut(&mut self) -> &mut B::Transport {
        &mut self.transport
    }

    pub fn radio_mut(&mut self) -> &mut RadioController<B::Radio, B::RadioDelay> {
        &mut self.radio
    }

    pub fn clock(&self) -> &ClockSpeedController<B::Cpu> {
        &self.clock
    }

    pub fn time(&self) -> &TimeSync {
        &self.time
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    fn now(&self) -> Instant {
        (self.monotonic)()
    }

    /// Opens every source and starts the first send window. Without a
    /// single source there is nothing to do.
    pub fn start(&mut self) -> Result<(), FirmwareError> {
        if self.entries.is_empty() {
            return Err(FirmwareError::NoSources);
        }
        for entry in self.entries.iter_mut() {
            if let Err(err) = entry.open() {
                log::error!(
                    "sched: open failed protocol={} err={}",
                    entry.protocol(),
                    FirmwareError::from(err).as_str()
                );
            }
        }
        self.last_send_complete = self.now();
        log::info!(
            "sched: started entries={} cpu_mhz={}",
            self.entries.len(),
            self.clock.default_mhz()
        );
        Ok(())
    }

    pub async fn run(mut self) -> ! {
        loop {
            self.tick().await;
            self.delay.delay_ms(self.policy.tick_ms).await;
        }
    }

    pub async fn tick(&mut self) -> TickReport {
        let now = self.now();
        self.ticks = self.ticks.wrapping_add(1);
        telemetry::record_sched_tick();
        if self.ticks % self.policy.time_resync_ticks == 0 {
            self.resync_due = true;
        }

        self.service_network(now);

        let mut clock_default = self.clock.is_default();
        let mut keep_radio = false;
        for index in 0..self.entries.len() {
            clock_default = self.read_if_due(index, now, clock_default);
            keep_radio |= self.send_if_ready(index, now, &mut clock_default).await;
        }
        self.complete_window(now);

        let next_due = self.next_due(now);
        let status_tick = self.ticks % self.policy.status_log_ticks == 0;

        let mut radio_up = false;
        if clock_default && self.radio.is_connected() {
            radio_up = true;
            self.radio.blink().await;
            self.measure_supply(status_tick);
            if self.resync_due {
                self.resync_time().await;
            }

            let horizon = Duration::from_secs(u64::from(self.policy.radio_off_horizon_s));
            if !keep_radio && (next_due > horizon || self.policy.send_interval_s > 0) {
                self.radio_off().await;
                radio_up = false;
            }
        }

        if clock_default && !self.radio.is_connected() && self.policy.low_clock_divisor > 0 {
            let now = self.now();
            if self.clock.set_low(self.policy.low_clock_divisor, now) {
                clock_default = false;
            }
        }

        if status_tick {
            self.log_status(next_due, radio_up);
        }

        TickReport {
            next_due,
            radio_up,
            clock_default,
        }
    }

    /// Applies transport events, serves status requests and times out
    /// stalled exchanges.
    fn service_network(&mut self, now: Instant) {
        self.registry.pump(&mut self.transport, self.events, now);
        if self.registry.pending_requests() > 0 {
            let index_enabled = self.registry.policy().httpd_index_enabled;
            let mut server = StatusServer::new(self.entries.as_slice(), index_enabled);
            self.registry.answer_requests(&mut self.transport, &mut server);
        }
        self.registry.poll_all(&mut self.transport, now);
    }

    fn read_if_due(&mut self, index: usize, now: Instant, clock_default: bool) -> bool {
        let entry = &self.entries[index];
        if entry.read_due_in(now) > Duration::from_ticks(0) {
            return clock_default;
        }
        let mut clock_default = clock_default;
        if entry.needs_default_clock() && !clock_default {
            clock_default = self.clock.set_default(now);
        }
        let shared_bus = entry.uses_shared_bus();
        let utc_ms = self.time.utc_now_ms(now);

        let entry = &mut self.entries[index];
        let result = if shared_bus {
            let _guard = self.radio.bus_guard();
            entry.read(utc_ms, now)
        } else {
            entry.read(utc_ms, now)
        };
        if let Err(err) = result {
            log::warn!(
                "sched: read failed protocol={} err={}",
                entry.protocol(),
                FirmwareError::from(err).as_str()
            );
        }
        clock_default
    }

    fn send_window_open(&self, now: Instant) -> bool {
        let interval = Duration::from_secs(u64::from(self.policy.send_interval_s));
        self.window_open || now.saturating_duration_since(self.last_send_complete) >= interval
    }

    /// Returns true while the entry still needs the radio.
    async fn send_if_ready(
        &mut self,
        index: usize,
        now: Instant,
        clock_default: &mut bool,
    ) -> bool {
        if self.entries[index].is_busy() {
            self.service_entry(index, now);
            return self.entries[index].is_busy() || self.entries[index].send_pending();
        }
        if !self.entries[index].send_pending() || !self.send_window_open(now) {
            return false;
        }

        if !*clock_default {
            *clock_default = self.clock.set_default(now);
        }
        if !self.radio.is_connected() && !self.radio.enable(0).await {
            log::warn!("sched: radio unavailable; send deferred");
            return false;
        }
        self.window_open = true;

        let now = self.now();
        let conn = self.entries[index].conn();
        self.service_entry(index, now);
        if self.registry.state(conn) == Some(ConnState::Dns) {
            self.registry
                .await_dns(&mut self.transport, self.events, &mut self.delay, conn, now)
                .await;
        }
        self.entries[index].is_busy() || self.entries[index].send_pending()
    }

    /// Entries sharing a connection take turns: only the entry whose batch
    /// is out may touch the connection until that exchange ends.
    fn service_entry(&mut self, index: usize, now: Instant) {
        let id = self.entries[index].conn();
        if let Some(&owner) = self.exchanges.get(&id) {
            if owner != index {
                log::debug!("sched: entry={} waits for entry={} conn={}", index, owner, id.0);
                return;
            }
        }
        let Some(conn) = self.registry.get_mut(id) else {
            log::error!("sched: entry={} has no connection id={}", index, id.0);
            self.entries[index].hold();
            return;
        };
        match self.entries[index].service(conn, &mut self.transport, now) {
            UploadProgress::Failed(err) => {
                log::error!(
                    "sched: send failed id={} err={}",
                    conn.label(),
                    FirmwareError::from(err).as_str()
                );
                self.entries[index].hold();
            }
            UploadProgress::Delivered { samples } => {
                log::debug!("sched: entry={} delivered samples={}", index, samples);
            }
            UploadProgress::Idle | UploadProgress::InFlight => {}
        }
        if self.entries[index].is_busy() {
            self.exchanges.insert(id, index);
        } else if self.exchanges.get(&id) == Some(&index) {
            self.exchanges.remove(&id);
        }
    }

    /// A window ends once no entry has a batch out or data left to send.
    fn complete_window(&mut self, now: Instant) {
        if !self.window_open {
            return;
        }
        let active = self
            .entries
            .iter()
            .any(|entry| entry.is_busy() || entry.send_pending());
        if active {
            return;
        }
        self.close_window(now);
        log::debug!("sched: send window complete tick={}", self.ticks);
    }

    fn close_window(&mut self, now: Instant) {
        self.window_open = false;
        self.last_send_complete = now;
        for entry in self.entries.iter_mut() {
            entry.release();
        }
    }

    fn next_due(&self, now: Instant) -> Duration {
        self.entries
            .iter()
            .map(|entry| entry.read_due_in(now))
            .min()
            .unwrap_or(Duration::from_ticks(0))
    }

    fn measure_supply(&mut self, log_it: bool) {
        let utc_ms = self.time.utc_now_ms(self.now());
        let Some(reading) = self.radio.measure_voltage(utc_ms) else {
            return;
        };
        self.supply.store(reading);
        if log_it {
            log::info!(
                "sched: power source={} volts={:.2}",
                if reading.on_battery { "battery" } else { "usb" },
                reading.volts
            );
        }
    }

    async fn resync_time(&mut self) {
        let utc = self.time_source.query_utc().await;
        let now = self.now();
        match self.time.resync(utc, now) {
            Some(correction_ms) => {
                telemetry::record_time_resync(true);
                self.resync_due = false;
                log::info!(
                    "sched: time resync {} correction_ms={}",
                    timefmt::local_time_string(utc, self.tz_offset_min),
                    correction_ms
                );
            }
            None => {
                telemetry::record_time_resync(false);
                log::warn!("sched: time resync failed; retrying while radio is up");
            }
        }
    }

    async fn radio_off(&mut self) {
        self.registry.release_all(&mut self.transport);
        self.radio.disable().await;
        let now = self.now();
        self.close_window(now);
        self.radio.log_statistics();
        if let Some(supply) = self.supply.latest() {
            log::info!(
                "sched: last supply volts={:.2} on_battery={}",
                supply.volts,
                supply.on_battery
            );
        }
    }

    fn log_status(&mut self, next_due: Duration, radio_up: bool) {
        let now = self.now();
        let clock = self.clock.stats(now);
        log::info!(
            "sched: {} tick={} next_due_s={} radio={} mhz={} default_s={} low_s={}",
            timefmt::local_time_string(self.time.utc_now_seconds(now), self.tz_offset_min),
            self.ticks,
            next_due.as_secs(),
            if radio_up { "on" } else { "off" },
            self.clock.current_mhz(),
            clock.default_ms / 1_000,
            clock.low_ms / 1_000
        );
        if let Some(probe) = self.heap {
            log::info!(
                "sched: heap free={} total={}",
                probe.heap_free(),
                probe.heap_total()
            );
        }
        for entry in &self.entries {
            for channel in entry.channels() {
                log::info!(
                    "sched: uuid={} protocol={} buffered={} dropped={}",
                    channel.uuid(),
                    entry.protocol(),
                    channel.len(),
                    channel.dropped()
                );
            }
        }
        let counters = telemetry::snapshot();
        log::info!(
            "sched: uploads ok={} rejected={} abandoned={} samples={} conn_err={} timeouts={}",
            counters.upload_batches_ok,
            counters.upload_batches_rejected,
            counters.upload_batches_abandoned,
            counters.upload_samples_sent,
            counters.conn_failures,
            counters.conn_timeouts
        );
        self.radio.log_statistics();
    }
}
