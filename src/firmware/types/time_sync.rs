use embassy_time::Instant;

/// A UTC reading paired with the monotonic instant it was taken at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeReference {
    pub utc_seconds: u64,
    pub local: Instant,
}
