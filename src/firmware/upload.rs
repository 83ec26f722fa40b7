//! Collector client for the volkszaehler middleware API.

use alloc::{format, string::String, vec::Vec};
use core::fmt::Write as _;

use embassy_time::Instant;

use crate::firmware::{
    config::{UPLOAD_BATCH_MAX, VERSION},
    meter::MeterChannel,
    net::{http, Connection, Transport},
    telemetry,
    types::ConnState,
};

/// Connects plus back-pressure retries allowed for one batch.
pub const UPLOAD_ATTEMPTS_MAX: u8 = 3;
const REPLY_EXCERPT_MAX: usize = 120;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadError {
    NotReady(ConnState),
    Backpressure,
    Rejected(u16),
    Malformed,
    Timeout,
}

impl UploadError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotReady(_) => "connection not ready",
            Self::Backpressure => "send buffer full",
            Self::Rejected(_) => "collector rejected batch",
            Self::Malformed => "malformed collector reply",
            Self::Timeout => "collector did not answer",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadProgress {
    /// Nothing buffered, nothing in flight.
    Idle,
    InFlight,
    Delivered { samples: usize },
    Failed(UploadError),
}

#[derive(Clone, Copy, Debug)]
struct Batch {
    channel: usize,
    // Buffered samples covered, duplicates included.
    consumed: usize,
    tuples: usize,
    last_ts: u64,
    started: Instant,
    attempts: u8,
}

/// Moves buffered samples of one entry to the collector, one batch at a
/// time, driven by the connection state on every call.
pub struct Uploader {
    base_path: String,
    payload: String,
    resource: String,
    batch: Option<Batch>,
    last_sent: Vec<Option<u64>>,
}

impl Uploader {
    /// `base_path` is the middleware path of the collector URL.
    pub fn new(base_path: &str) -> Self {
        Self {
            base_path: String::from(base_path.trim_end_matches('/')),
            payload: String::new(),
            resource: String::new(),
            batch: None,
            last_sent: Vec::new(),
        }
    }

    pub fn install_headers(conn: &mut Connection) {
        conn.add_header("Content-type: application/json");
        conn.add_header("Accept: application/json");
        conn.add_header(&format!("User-Agent: meterlink/{}", VERSION));
    }

    pub fn is_busy(&self) -> bool {
        self.batch.is_some()
    }

    pub fn ready(channels: &[MeterChannel]) -> bool {
        channels.iter().any(|channel| !channel.is_empty())
    }

    pub fn resource_for(&self, uuid: &str) -> String {
        format!("{}/data/{}.json", self.base_path, uuid)
    }

    fn last_sent(&self, channel: usize) -> Option<u64> {
        self.last_sent.get(channel).copied().flatten()
    }

    fn mark_sent(&mut self, channel: usize, ts: u64) {
        if self.last_sent.len() <= channel {
            self.last_sent.resize(channel + 1, None);
        }
        self.last_sent[channel] = Some(ts);
    }

    /// Picks the first channel with samples and frames its payload. Batches
    /// made only of duplicates are acknowledged on the spot.
    fn prepare(&mut self, channels: &mut [MeterChannel], now: Instant) -> bool {
        for index in 0..channels.len() {
            if channels[index].is_empty() {
                continue;
            }
            let mut previous = self.last_sent(index);
            let mut consumed = 0usize;
            let mut tuples = 0usize;
            let precision = usize::from(channels[index].precision());
            self.payload.clear();
            self.payload.push('[');
            for sample in channels[index].pending().take(UPLOAD_BATCH_MAX) {
                consumed += 1;
                if previous == Some(sample.ts_ms) {
                    continue;
                }
                if tuples > 0 {
                    self.payload.push(',');
                }
                let _ = write!(
                    self.payload,
                    "[{},{:.*}]",
                    sample.ts_ms, precision, sample.value
                );
                previous = Some(sample.ts_ms);
                tuples += 1;
            }
            self.payload.push(']');

            if tuples == 0 {
                log::debug!(
                    "upload: uuid={} skipped duplicates={}",
                    channels[index].uuid(),
                    consumed
                );
                channels[index].acknowledge(consumed);
                continue;
            }

            self.resource = self.resource_for(channels[index].uuid());
            self.batch = Some(Batch {
                channel: index,
                consumed,
                tuples,
                last_ts: previous.unwrap_or(0),
                started: now,
                attempts: 0,
            });
            log::debug!(
                "upload: batch uuid={} tuples={} buffered={}",
                channels[index].uuid(),
                tuples,
                channels[index].len()
            );
            return true;
        }
        false
    }

    fn give_up(&mut self, err: UploadError) -> UploadProgress {
        self.batch = None;
        telemetry::record_upload_abandoned();
        UploadProgress::Failed(err)
    }

    /// Advances the current exchange by one step.
    pub fn service<T: Transport + ?Sized>(
        &mut self,
        conn: &mut Connection,
        transport: &mut T,
        channels: &mut [MeterChannel],
        now: Instant,
    ) -> UploadProgress {
        match conn.state() {
            ConnState::Server => {
                return UploadProgress::Failed(UploadError::NotReady(ConnState::Server));
            }
            ConnState::Dns | ConnState::Connecting | ConnState::Sending => {
                return if self.batch.is_some() {
                    UploadProgress::InFlight
                } else {
                    UploadProgress::Idle
                };
            }
            ConnState::Replied => return self.complete(conn, transport, channels, now),
            ConnState::Error => {
                conn.abandon(transport, "upload_recover");
            }
            ConnState::Init | ConnState::Ready | ConnState::Retry => {}
        }

        if self.batch.is_none() && !self.prepare(channels, now) {
            return UploadProgress::Idle;
        }
        let Some(batch) = self.batch.as_mut() else {
            return UploadProgress::Idle;
        };

        match conn.state() {
            ConnState::Init => {
                if batch.attempts >= UPLOAD_ATTEMPTS_MAX {
                    log::warn!(
                        "upload: id={} giving up after attempts={}",
                        conn.label(),
                        batch.attempts
                    );
                    return self.give_up(UploadError::Timeout);
                }
                batch.attempts += 1;
                conn.connect(transport, now);
                UploadProgress::InFlight
            }
            ConnState::Retry | ConnState::Ready => {
                if conn.state() == ConnState::Retry {
                    if batch.attempts >= UPLOAD_ATTEMPTS_MAX {
                        conn.abandon(transport, "backpressure");
                        return self.give_up(UploadError::Backpressure);
                    }
                    batch.attempts += 1;
                    conn.resume_after_backpressure();
                }
                match conn.post_request(transport, &self.resource, &self.payload, now) {
                    ConnState::Error => self.give_up(UploadError::NotReady(ConnState::Error)),
                    _ => UploadProgress::InFlight,
                }
            }
            state => UploadProgress::Failed(UploadError::NotReady(state)),
        }
    }

    fn complete<T: Transport + ?Sized>(
        &mut self,
        conn: &mut Connection,
        transport: &mut T,
        channels: &mut [MeterChannel],
        now: Instant,
    ) -> UploadProgress {
        let reply = conn.finish_reply(transport).unwrap_or_default();
        let Some(batch) = self.batch.take() else {
            log::debug!("upload: id={} stray reply dropped", conn.label());
            return UploadProgress::Idle;
        };

        match http::parse_status_code(&reply) {
            Some(200) => {
                if let Some(channel) = channels.get_mut(batch.channel) {
                    channel.acknowledge(batch.consumed);
                }
                self.mark_sent(batch.channel, batch.last_ts);
                let roundtrip = now.saturating_duration_since(batch.started).as_millis();
                telemetry::record_upload_accepted(
                    batch.tuples as u32,
                    u32::try_from(roundtrip).unwrap_or(u32::MAX),
                );
                log::info!(
                    "upload: id={} delivered tuples={} roundtrip_ms={}",
                    conn.label(),
                    batch.tuples,
                    roundtrip
                );
                UploadProgress::Delivered {
                    samples: batch.tuples,
                }
            }
            Some(code) => {
                let body = http::response_body(&reply);
                let excerpt = &body[..body.len().min(REPLY_EXCERPT_MAX)];
                log::error!(
                    "upload: id={} rejected status={} body={}",
                    conn.label(),
                    code,
                    String::from_utf8_lossy(excerpt)
                );
                telemetry::record_upload_rejected(Some(code));
                UploadProgress::Failed(UploadError::Rejected(code))
            }
            None => {
                log::error!(
                    "upload: id={} malformed reply bytes={}",
                    conn.label(),
                    reply.len()
                );
                telemetry::record_upload_rejected(None);
                UploadProgress::Failed(UploadError::Malformed)
            }
        }
    }
}

#[cfg(test)]
mod tests;
