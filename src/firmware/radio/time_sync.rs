use embassy_time::Instant;

use crate::firmware::types::TimeReference;

/// Absolute time provider, queried only while the radio is up.
#[allow(async_fn_in_trait)]
pub trait TimeSource {
    /// UTC seconds, or 0 when the query failed.
    async fn query_utc(&mut self) -> u64;
}

/// Maps the monotonic clock onto UTC and keeps the mapping honest.
///
/// Drift correction compares the UTC delta between two queries with the
/// local delta over the same span; the whole difference is applied to the
/// offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSync {
    reference: TimeReference,
    // UTC milliseconds at local instant zero.
    offset_ms: i64,
}

impl TimeSync {
    /// First reference; `None` for a failed (zero) query.
    pub fn initial(utc_seconds: u64, now: Instant) -> Option<Self> {
        if utc_seconds == 0 {
            return None;
        }
        let offset_ms = utc_ms(utc_seconds) - local_ms(now);
        Some(Self {
            reference: TimeReference {
                utc_seconds,
                local: now,
            },
            offset_ms,
        })
    }

    /// Applies drift correction and returns the correction in ms. A failed
    /// query leaves the state untouched.
    pub fn resync(&mut self, utc_seconds: u64, now: Instant) -> Option<i64> {
        if utc_seconds == 0 {
            log::warn!("time: resync skipped, no answer");
            return None;
        }
        let delta_utc = utc_ms(utc_seconds) - utc_ms(self.reference.utc_seconds);
        let delta_local = local_ms(now) - local_ms(self.reference.local);
        let correction = delta_utc - delta_local;
        if correction != 0 {
            log::info!(
                "time: drift correction_ms={} delta_utc_ms={} delta_local_ms={}",
                correction,
                delta_utc,
                delta_local
            );
            self.offset_ms += correction;
        }
        self.reference = TimeReference {
            utc_seconds,
            local: now,
        };
        Some(correction)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn reference(&self) -> TimeReference {
        self.reference
    }

    pub fn utc_now_ms(&self, now: Instant) -> u64 {
        u64::try_from(self.offset_ms + local_ms(now)).unwrap_or(0)
    }

    pub fn utc_now_seconds(&self, now: Instant) -> u64 {
        self.utc_now_ms(now) / 1_000
    }
}

pub const SNTP_PORT: u16 = 123;
pub const SNTP_PACKET_LEN: usize = 48;
const NTP_UNIX_OFFSET_S: u64 = 2_208_988_800;
const TRANSMIT_TS_AT: usize = 40;

/// Client request: leap indicator 0, version 3, mode 3.
pub const fn sntp_request() -> [u8; SNTP_PACKET_LEN] {
    let mut packet = [0u8; SNTP_PACKET_LEN];
    packet[0] = 0x1b;
    packet
}

/// UTC seconds from a server reply's transmit timestamp. Short packets,
/// non-server modes and kiss-of-death (stratum 0) answers are refused.
pub fn parse_sntp_reply(packet: &[u8]) -> Option<u64> {
    if packet.len() < SNTP_PACKET_LEN {
        return None;
    }
    let mode = packet[0] & 0x07;
    let stratum = packet[1];
    if mode != 4 || stratum == 0 {
        return None;
    }
    let mut seconds = [0u8; 4];
    seconds.copy_from_slice(&packet[TRANSMIT_TS_AT..TRANSMIT_TS_AT + 4]);
    u64::from(u32::from_be_bytes(seconds)).checked_sub(NTP_UNIX_OFFSET_S)
}

fn utc_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

fn local_ms(instant: Instant) -> i64 {
    i64::try_from(instant.as_millis()).unwrap_or(i64::MAX)
}
