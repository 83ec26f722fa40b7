use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};

use crate::firmware::net::TransportEvent;

pub const TRANSPORT_EVENT_DEPTH: usize = 8;

pub type TransportEvents =
    Channel<CriticalSectionRawMutex, TransportEvent, TRANSPORT_EVENT_DEPTH>;

/// Socket-side callbacks land here; the scheduling loop drains it once per tick.
pub static TRANSPORT_EVENTS: TransportEvents = Channel::new();
