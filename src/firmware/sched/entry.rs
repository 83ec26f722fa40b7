use alloc::{boxed::Box, vec::Vec};

use embassy_time::{Duration, Instant};

use crate::firmware::{
    meter::{DataSource, MeterChannel, MeterError, Reading, Sample},
    net::{ChannelView, Connection, StatusSource, Transport},
    telemetry,
    types::ConnId,
    upload::{UploadProgress, Uploader},
};

const READINGS_PER_READ: usize = 16;

/// One source paired with its collector connection. Reads fill the channel
/// buffers on the source's cadence; sends drain them independently.
pub struct SchedulingEntry {
    source: Box<dyn DataSource>,
    channels: Vec<MeterChannel>,
    conn: ConnId,
    uploader: Uploader,
    last_read: Option<Instant>,
    opened: bool,
    // A send failed in the current window; retried in the next one.
    held: bool,
    scratch: Vec<Reading>,
}

impl SchedulingEntry {
    pub fn new(
        source: Box<dyn DataSource>,
        channels: Vec<MeterChannel>,
        conn: ConnId,
        uploader: Uploader,
    ) -> Self {
        Self {
            source,
            channels,
            conn,
            uploader,
            last_read: None,
            opened: false,
            held: false,
            scratch: Vec::with_capacity(READINGS_PER_READ),
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn protocol(&self) -> &'static str {
        self.source.protocol()
    }

    pub fn channels(&self) -> &[MeterChannel] {
        &self.channels
    }

    pub fn read_interval(&self) -> Duration {
        self.source.read_interval()
    }

    pub fn needs_default_clock(&self) -> bool {
        self.source.needs_default_clock()
    }

    pub fn uses_shared_bus(&self) -> bool {
        self.source.uses_shared_bus()
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn open(&mut self) -> Result<(), MeterError> {
        if self.opened {
            return Ok(());
        }
        self.source.open()?;
        self.opened = true;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), MeterError> {
        if !self.opened {
            return Ok(());
        }
        self.opened = false;
        self.source.close()
    }

    /// Zero when a read is due now.
    pub fn read_due_in(&self, now: Instant) -> Duration {
        match self.last_read {
            None => Duration::from_ticks(0),
            Some(last) => (last + self.read_interval()).saturating_duration_since(now),
        }
    }

    /// Reads the source and files every reading into the channels that
    /// accept it. The read cadence restarts even when the source fails.
    pub fn read(&mut self, utc_ms: u64, now: Instant) -> Result<usize, MeterError> {
        self.last_read = Some(now);
        if !self.opened {
            telemetry::record_meter_read(false);
            return Err(MeterError::NotOpen);
        }
        self.scratch.clear();
        let produced = match self.source.read(&mut self.scratch, READINGS_PER_READ, utc_ms) {
            Ok(produced) => produced,
            Err(err) => {
                telemetry::record_meter_read(false);
                return Err(err);
            }
        };
        telemetry::record_meter_read(true);

        for reading in self.scratch.iter() {
            for channel in self.channels.iter_mut().filter(|c| c.accepts(reading)) {
                channel.push(Sample {
                    ts_ms: reading.ts_ms,
                    value: reading.value,
                });
            }
        }
        log::debug!(
            "sched: read protocol={} readings={}",
            self.source.protocol(),
            produced
        );
        Ok(produced)
    }

    pub fn ready_to_send(&self) -> bool {
        Uploader::ready(&self.channels)
    }

    /// Data is buffered and no send failed in the current window.
    pub fn send_pending(&self) -> bool {
        !self.held && self.ready_to_send()
    }

    pub(super) fn hold(&mut self) {
        self.held = true;
    }

    pub(super) fn release(&mut self) {
        self.held = false;
    }

    /// A batch is out and not yet answered.
    pub fn is_busy(&self) -> bool {
        self.uploader.is_busy()
    }

    pub fn service<T: Transport + ?Sized>(
        &mut self,
        conn: &mut Connection,
        transport: &mut T,
        now: Instant,
    ) -> UploadProgress {
        self.uploader.service(conn, transport, &mut self.channels, now)
    }
}

impl StatusSource for [SchedulingEntry] {
    fn visit_channels(&self, visitor: &mut dyn FnMut(ChannelView<'_>)) {
        for entry in self {
            let interval_s = u32::try_from(entry.read_interval().as_secs()).unwrap_or(u32::MAX);
            for channel in &entry.channels {
                let last = channel.last();
                visitor(ChannelView {
                    uuid: channel.uuid(),
                    last_ts_ms: last.map(|sample| sample.ts_ms),
                    last_value: last.map(|sample| sample.value),
                    interval_s,
                    protocol: entry.protocol(),
                });
            }
        }
    }
}

/// A source and the metrics it publishes, before channel UUIDs are known.
pub struct SourcePlan {
    pub source: Box<dyn DataSource>,
    pub identifiers: &'static [Option<&'static str>],
}

/// A source with its channels assigned; becomes an entry once the collector
/// connection exists.
pub struct PlannedSource {
    source: Box<dyn DataSource>,
    channels: Vec<MeterChannel>,
}

impl PlannedSource {
    pub fn protocol(&self) -> &'static str {
        self.source.protocol()
    }

    pub fn channels(&self) -> &[MeterChannel] {
        &self.channels
    }

    pub fn into_entry(self, conn: ConnId, base_path: &str) -> SchedulingEntry {
        SchedulingEntry::new(self.source, self.channels, conn, Uploader::new(base_path))
    }
}

/// Hands out UUIDs in order, one per published metric. Metrics past the
/// last UUID stay unpublished; a source left without channels is dropped.
pub fn assign_channels(
    plans: Vec<SourcePlan>,
    uuid_for: impl Fn(usize) -> Option<&'static str>,
) -> Vec<PlannedSource> {
    let mut next = 0usize;
    let mut planned = Vec::with_capacity(plans.len());
    for plan in plans {
        let mut channels = Vec::with_capacity(plan.identifiers.len());
        for identifier in plan.identifiers {
            let Some(uuid) = uuid_for(next) else {
                break;
            };
            next += 1;
            channels.push(MeterChannel::new(uuid, *identifier));
        }
        if channels.is_empty() {
            log::warn!(
                "sched: source protocol={} has no channel uuid, skipped",
                plan.source.protocol()
            );
            continue;
        }
        planned.push(PlannedSource {
            source: plan.source,
            channels,
        });
    }
    planned
}
