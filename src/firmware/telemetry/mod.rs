use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static CONN_ATTEMPTS: AtomicU32 = AtomicU32::new(0);
static CONN_FAILURES: AtomicU32 = AtomicU32::new(0);
static CONN_BACKPRESSURE: AtomicU32 = AtomicU32::new(0);
static CONN_TIMEOUTS: AtomicU32 = AtomicU32::new(0);
static UPLOAD_BATCHES_OK: AtomicU32 = AtomicU32::new(0);
static UPLOAD_BATCHES_REJECTED: AtomicU32 = AtomicU32::new(0);
static UPLOAD_BATCHES_ABANDONED: AtomicU32 = AtomicU32::new(0);
static UPLOAD_SAMPLES_SENT: AtomicU32 = AtomicU32::new(0);
static UPLOAD_ROUNDTRIP_MS_TOTAL: AtomicU32 = AtomicU32::new(0);
static UPLOAD_ROUNDTRIP_MS_MAX: AtomicU32 = AtomicU32::new(0);
static UPLOAD_LAST_STATUS: AtomicU32 = AtomicU32::new(0);
static RADIO_ENABLE_ATTEMPTS: AtomicU32 = AtomicU32::new(0);
static RADIO_ENABLE_FAILURES: AtomicU32 = AtomicU32::new(0);
static RADIO_LINK_UP: AtomicBool = AtomicBool::new(false);
static METER_READS: AtomicU32 = AtomicU32::new(0);
static METER_READ_ERRORS: AtomicU32 = AtomicU32::new(0);
static HTTPD_REQUESTS: AtomicU32 = AtomicU32::new(0);
static TIME_RESYNCS: AtomicU32 = AtomicU32::new(0);
static TIME_RESYNC_FAILURES: AtomicU32 = AtomicU32::new(0);
static SUPPLY_MILLIVOLTS: AtomicU32 = AtomicU32::new(0);
static SCHED_TICKS: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, Debug)]
pub(crate) struct Snapshot {
    pub(crate) conn_attempts: u32,
    pub(crate) conn_failures: u32,
    pub(crate) conn_backpressure: u32,
    pub(crate) conn_timeouts: u32,
    pub(crate) upload_batches_ok: u32,
    pub(crate) upload_batches_rejected: u32,
    pub(crate) upload_batches_abandoned: u32,
    pub(crate) upload_samples_sent: u32,
    pub(crate) upload_roundtrip_ms_total: u32,
    pub(crate) upload_roundtrip_ms_max: u32,
    pub(crate) upload_last_status: Option<u16>,
    pub(crate) radio_enable_attempts: u32,
    pub(crate) radio_enable_failures: u32,
    pub(crate) radio_link_up: bool,
    pub(crate) meter_reads: u32,
    pub(crate) meter_read_errors: u32,
    pub(crate) httpd_requests: u32,
    pub(crate) time_resyncs: u32,
    pub(crate) time_resync_failures: u32,
    pub(crate) supply_millivolts: Option<u32>,
    pub(crate) sched_ticks: u32,
}

pub(crate) fn snapshot() -> Snapshot {
    let last_status = UPLOAD_LAST_STATUS.load(Ordering::Relaxed);
    let millivolts = SUPPLY_MILLIVOLTS.load(Ordering::Relaxed);
    Snapshot {
        conn_attempts: CONN_ATTEMPTS.load(Ordering::Relaxed),
        conn_failures: CONN_FAILURES.load(Ordering::Relaxed),
        conn_backpressure: CONN_BACKPRESSURE.load(Ordering::Relaxed),
        conn_timeouts: CONN_TIMEOUTS.load(Ordering::Relaxed),
        upload_batches_ok: UPLOAD_BATCHES_OK.load(Ordering::Relaxed),
        upload_batches_rejected: UPLOAD_BATCHES_REJECTED.load(Ordering::Relaxed),
        upload_batches_abandoned: UPLOAD_BATCHES_ABANDONED.load(Ordering::Relaxed),
        upload_samples_sent: UPLOAD_SAMPLES_SENT.load(Ordering::Relaxed),
        upload_roundtrip_ms_total: UPLOAD_ROUNDTRIP_MS_TOTAL.load(Ordering::Relaxed),
        upload_roundtrip_ms_max: UPLOAD_ROUNDTRIP_MS_MAX.load(Ordering::Relaxed),
        upload_last_status: u16::try_from(last_status).ok().filter(|code| *code != 0),
        radio_enable_attempts: RADIO_ENABLE_ATTEMPTS.load(Ordering::Relaxed),
        radio_enable_failures: RADIO_ENABLE_FAILURES.load(Ordering::Relaxed),
        radio_link_up: RADIO_LINK_UP.load(Ordering::Relaxed),
        meter_reads: METER_READS.load(Ordering::Relaxed),
        meter_read_errors: METER_READ_ERRORS.load(Ordering::Relaxed),
        httpd_requests: HTTPD_REQUESTS.load(Ordering::Relaxed),
        time_resyncs: TIME_RESYNCS.load(Ordering::Relaxed),
        time_resync_failures: TIME_RESYNC_FAILURES.load(Ordering::Relaxed),
        supply_millivolts: (millivolts != 0).then_some(millivolts),
        sched_ticks: SCHED_TICKS.load(Ordering::Relaxed),
    }
}

pub(crate) fn record_conn_attempt() {
    CONN_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_conn_failure() {
    CONN_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_conn_backpressure() {
    CONN_BACKPRESSURE.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_conn_timeout() {
    CONN_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_upload_accepted(samples: u32, roundtrip_ms: u32) {
    UPLOAD_BATCHES_OK.fetch_add(1, Ordering::Relaxed);
    UPLOAD_LAST_STATUS.store(200, Ordering::Relaxed);
    saturating_add_u32(&UPLOAD_SAMPLES_SENT, samples);
    saturating_add_u32(&UPLOAD_ROUNDTRIP_MS_TOTAL, roundtrip_ms);
    update_max_u32(&UPLOAD_ROUNDTRIP_MS_MAX, roundtrip_ms);
}

pub(crate) fn record_upload_rejected(status: Option<u16>) {
    UPLOAD_BATCHES_REJECTED.fetch_add(1, Ordering::Relaxed);
    UPLOAD_LAST_STATUS.store(u32::from(status.unwrap_or(0)), Ordering::Relaxed);
}

pub(crate) fn record_upload_abandoned() {
    UPLOAD_BATCHES_ABANDONED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_radio_enable_attempt() {
    RADIO_ENABLE_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_radio_enable_failure() {
    RADIO_ENABLE_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn set_radio_link_up(up: bool) {
    RADIO_LINK_UP.store(up, Ordering::Relaxed);
}

pub(crate) fn record_meter_read(ok: bool) {
    METER_READS.fetch_add(1, Ordering::Relaxed);
    if !ok {
        METER_READ_ERRORS.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn record_httpd_request() {
    HTTPD_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_time_resync(ok: bool) {
    if ok {
        TIME_RESYNCS.fetch_add(1, Ordering::Relaxed);
    } else {
        TIME_RESYNC_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn set_supply_voltage(volts: f32) {
    let millivolts = if volts.is_finite() && volts > 0.0 {
        (volts * 1000.0) as u32
    } else {
        0
    };
    SUPPLY_MILLIVOLTS.store(millivolts, Ordering::Relaxed);
}

pub(crate) fn record_sched_tick() -> u32 {
    SCHED_TICKS.fetch_add(1, Ordering::Relaxed)
}

fn saturating_add_u32(counter: &AtomicU32, value: u32) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_add(value))
    });
}

fn update_max_u32(max_counter: &AtomicU32, value: u32) {
    let mut current = max_counter.load(Ordering::Relaxed);
    while value > current {
        match max_counter.compare_exchange_weak(
            current,
            value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(next) => current = next,
        }
    }
}
