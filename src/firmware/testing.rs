//! Scripted collaborators for host tests.

use alloc::{
    collections::{BTreeSet, VecDeque},
    string::String,
    vec::Vec,
};
use core::{cell::Cell, convert::Infallible, net::Ipv4Addr};

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use crate::firmware::{
    meter::{AnalogInput, DataSource, MeterError, Reading, SystemProbe},
    net::{Resolution, Transport},
    power::CpuClock,
    radio::{LinkStatus, RadioDriver, RadioError, SupplyLevel, TimeSource},
    types::{ConnId, HandleId, NetError},
};

pub(crate) const COLLECTOR_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

pub(crate) fn at_ms(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

std::thread_local! {
    static MOCK_NOW_MS: Cell<u64> = const { Cell::new(0) };
}

/// Per-thread monotonic clock for code that samples time itself.
pub(crate) fn mock_now() -> Instant {
    Instant::from_millis(MOCK_NOW_MS.with(Cell::get))
}

pub(crate) fn set_mock_ms(ms: u64) {
    MOCK_NOW_MS.with(|now| now.set(ms));
}

pub(crate) fn advance_mock_ms(ms: u64) {
    MOCK_NOW_MS.with(|now| now.set(now.get() + ms));
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Open { secure: bool },
    Register(HandleId, ConnId),
    Unregister(HandleId),
    Close(HandleId),
    Abort(HandleId),
    Resolve(String),
    Connect(HandleId, Ipv4Addr, u16),
    Write(HandleId),
    Listen(u16),
}

pub(crate) struct MockTransport {
    next_handle: u8,
    pub(crate) open_error: Option<NetError>,
    pub(crate) resolve_result: Result<Resolution, NetError>,
    pub(crate) connect_result: Result<(), NetError>,
    pub(crate) close_result: Result<(), NetError>,
    pub(crate) listen_result: Option<NetError>,
    pub(crate) write_results: VecDeque<Result<(), NetError>>,
    pub(crate) calls: Vec<Call>,
    pub(crate) writes: Vec<(HandleId, Vec<u8>)>,
    pub(crate) live: BTreeSet<u8>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            next_handle: 1,
            open_error: None,
            resolve_result: Ok(Resolution::Resolved(COLLECTOR_ADDR)),
            connect_result: Ok(()),
            close_result: Ok(()),
            listen_result: None,
            write_results: VecDeque::new(),
            calls: Vec::new(),
            writes: Vec::new(),
            live: BTreeSet::new(),
        }
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }

    pub(crate) fn last_write(&self) -> Option<&str> {
        self.writes
            .last()
            .and_then(|(_, bytes)| core::str::from_utf8(bytes).ok())
    }

    pub(crate) fn clear_calls(&mut self) {
        self.calls.clear();
    }

    fn alloc(&mut self) -> HandleId {
        let handle = HandleId(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        self.live.insert(handle.0);
        handle
    }
}

impl Transport for MockTransport {
    fn open(&mut self, secure: bool) -> Result<HandleId, NetError> {
        self.calls.push(Call::Open { secure });
        if let Some(err) = self.open_error {
            return Err(err);
        }
        Ok(self.alloc())
    }

    fn register(&mut self, handle: HandleId, owner: ConnId) {
        self.calls.push(Call::Register(handle, owner));
    }

    fn unregister(&mut self, handle: HandleId) {
        self.calls.push(Call::Unregister(handle));
    }

    fn close(&mut self, handle: HandleId) -> Result<(), NetError> {
        self.calls.push(Call::Close(handle));
        if self.close_result.is_ok() {
            self.live.remove(&handle.0);
        }
        self.close_result
    }

    fn abort(&mut self, handle: HandleId) {
        self.calls.push(Call::Abort(handle));
        self.live.remove(&handle.0);
    }

    fn resolve(&mut self, host: &str, _owner: ConnId) -> Result<Resolution, NetError> {
        self.calls.push(Call::Resolve(String::from(host)));
        self.resolve_result
    }

    fn connect(&mut self, handle: HandleId, addr: Ipv4Addr, port: u16) -> Result<(), NetError> {
        self.calls.push(Call::Connect(handle, addr, port));
        self.connect_result
    }

    fn write(&mut self, handle: HandleId, bytes: &[u8]) -> Result<(), NetError> {
        self.calls.push(Call::Write(handle));
        let result = self.write_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.writes.push((handle, bytes.to_vec()));
        }
        result
    }

    fn listen(&mut self, port: u16, _owner: ConnId) -> Result<HandleId, NetError> {
        self.calls.push(Call::Listen(port));
        if let Some(err) = self.listen_result {
            return Err(err);
        }
        Ok(self.alloc())
    }
}

/// Delay that returns immediately and only counts what was asked for.
#[derive(Default)]
pub(crate) struct NoDelay {
    pub(crate) total_ms: u64,
    pub(crate) calls: u32,
}

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.total_ms += u64::from(ns / 1_000_000);
        self.calls += 1;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
        self.calls += 1;
    }
}

/// Delay that moves the per-thread mock clock forward.
#[derive(Default)]
pub(crate) struct ClockDelay {
    pub(crate) total_ms: u64,
}

impl DelayNs for ClockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        let ms = u64::from(ns / 1_000_000);
        self.total_ms += ms;
        advance_mock_ms(ms);
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.total_ms += u64::from(ms);
        advance_mock_ms(u64::from(ms));
    }
}

/// Blocking delay that only counts.
#[derive(Default)]
pub(crate) struct SpinDelay {
    pub(crate) total_us: u64,
}

impl embedded_hal::delay::DelayNs for SpinDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_us += u64::from(ns / 1_000);
    }

    fn delay_us(&mut self, us: u32) {
        self.total_us += u64::from(us);
    }
}

pub(crate) struct MockRadio {
    pub(crate) power_up_result: Result<(), RadioError>,
    /// Scripted join results; an empty script times out.
    pub(crate) joins: VecDeque<Result<(), RadioError>>,
    pub(crate) join_ms: u64,
    pub(crate) status: LinkStatus,
    pub(crate) powered: bool,
    pub(crate) power_ups: u32,
    pub(crate) power_downs: u32,
    pub(crate) led: Vec<bool>,
    pub(crate) supply: Option<SupplyLevel>,
    pub(crate) bus_held: bool,
    pub(crate) bus_acquires: u32,
}

impl MockRadio {
    pub(crate) fn new() -> Self {
        Self {
            power_up_result: Ok(()),
            joins: VecDeque::new(),
            join_ms: 0,
            status: LinkStatus::Down,
            powered: false,
            power_ups: 0,
            power_downs: 0,
            led: Vec::new(),
            supply: None,
            bus_held: false,
            bus_acquires: 0,
        }
    }

    pub(crate) fn joining(results: &[Result<(), RadioError>]) -> Self {
        let mut radio = Self::new();
        radio.joins = results.iter().copied().collect();
        radio
    }
}

impl RadioDriver for MockRadio {
    async fn power_up(&mut self) -> Result<(), RadioError> {
        self.power_ups += 1;
        self.power_up_result?;
        self.powered = true;
        Ok(())
    }

    async fn power_down(&mut self) {
        self.power_downs += 1;
        self.powered = false;
        self.status = LinkStatus::Down;
    }

    async fn join(&mut self, _timeout: Duration) -> Result<(), RadioError> {
        advance_mock_ms(self.join_ms);
        let result = self.joins.pop_front().unwrap_or(Err(RadioError::Timeout));
        self.status = match result {
            Ok(()) => LinkStatus::Up,
            Err(RadioError::Join(status)) => status,
            Err(_) => LinkStatus::Failed,
        };
        result
    }

    fn link_status(&mut self) -> LinkStatus {
        self.status
    }

    fn set_led(&mut self, on: bool) {
        self.led.push(on);
    }

    fn read_supply(&mut self) -> Option<SupplyLevel> {
        self.supply
    }

    fn bus_acquire(&mut self) {
        assert!(!self.bus_held, "bus acquired twice");
        self.bus_held = true;
        self.bus_acquires += 1;
    }

    fn bus_release(&mut self) {
        self.bus_held = false;
    }
}

pub(crate) struct MockTime {
    pub(crate) answers: VecDeque<u64>,
    pub(crate) queries: u32,
}

impl MockTime {
    pub(crate) fn answering(answers: &[u64]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            queries: 0,
        }
    }
}

impl TimeSource for MockTime {
    async fn query_utc(&mut self) -> u64 {
        self.queries += 1;
        self.answers.pop_front().unwrap_or(0)
    }
}

pub(crate) struct MockCpu {
    pub(crate) mhz: u32,
    pub(crate) refuse: bool,
}

impl MockCpu {
    pub(crate) fn new(mhz: u32) -> Self {
        Self { mhz, refuse: false }
    }
}

impl CpuClock for MockCpu {
    fn current_mhz(&self) -> u32 {
        self.mhz
    }

    fn low_steps(&self) -> &'static [u32] {
        &[160, 80]
    }

    fn set_mhz(&mut self, mhz: u32) -> bool {
        if self.refuse {
            return false;
        }
        self.mhz = mhz;
        true
    }
}

pub(crate) struct ScriptedAdc {
    pub(crate) samples: VecDeque<Result<u16, MeterError>>,
}

impl AnalogInput for ScriptedAdc {
    fn read_raw(&mut self) -> Result<u16, MeterError> {
        self.samples.pop_front().unwrap_or(Err(MeterError::Read))
    }
}

/// Output pin that records every level it was driven to.
#[derive(Default)]
pub(crate) struct PinLog {
    pub(crate) levels: Vec<bool>,
}

impl embedded_hal::digital::ErrorType for PinLog {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for PinLog {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.levels.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.levels.push(true);
        Ok(())
    }
}

pub(crate) struct FixedProbe {
    free: usize,
    total: usize,
}

impl FixedProbe {
    pub(crate) fn new(free: usize, total: usize) -> Self {
        Self { free, total }
    }
}

impl SystemProbe for FixedProbe {
    fn heap_free(&self) -> usize {
        self.free
    }

    fn heap_total(&self) -> usize {
        self.total
    }
}

/// Source that returns one fixed value per read, or a scripted error.
pub(crate) struct MockMeter {
    pub(crate) value: f64,
    pub(crate) interval: Duration,
    pub(crate) fail_reads: u32,
    pub(crate) reads: u32,
    pub(crate) needs_default_clock: bool,
    pub(crate) shared_bus: bool,
}

impl MockMeter {
    pub(crate) fn every_secs(secs: u64, value: f64) -> Self {
        Self {
            value,
            interval: Duration::from_secs(secs),
            fail_reads: 0,
            reads: 0,
            needs_default_clock: true,
            shared_bus: false,
        }
    }
}

impl DataSource for MockMeter {
    fn protocol(&self) -> &'static str {
        "mock"
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
        self.reads += 1;
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(MeterError::Read);
        }
        if max == 0 {
            return Ok(0);
        }
        out.push(Reading::new(None, utc_ms, self.value));
        Ok(1)
    }

    fn read_interval(&self) -> Duration {
        self.interval
    }

    fn needs_default_clock(&self) -> bool {
        self.needs_default_clock
    }

    fn uses_shared_bus(&self) -> bool {
        self.shared_bus
    }
}
