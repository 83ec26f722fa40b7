use core::net::Ipv4Addr;

use heapless::Vec as HVec;

use crate::firmware::types::{ConnId, HandleId, NetError};

pub const RX_CHUNK_MAX: usize = 1024;

pub type RxChunk = HVec<u8, RX_CHUNK_MAX>;

/// Outcome of a name lookup request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Answer was cached; the caller connects right away.
    Resolved(Ipv4Addr),
    /// A `DnsFound` event for the owner will follow.
    Pending,
}

/// Non-blocking stream socket facade. Calls return immediately; completion
/// is reported later through [`TransportEvent`]s tagged with the owning
/// connection.
pub trait Transport {
    fn open(&mut self, secure: bool) -> Result<HandleId, NetError>;
    /// Route callbacks of `handle` to `owner`.
    fn register(&mut self, handle: HandleId, owner: ConnId);
    fn unregister(&mut self, handle: HandleId);
    fn close(&mut self, handle: HandleId) -> Result<(), NetError>;
    fn abort(&mut self, handle: HandleId);
    fn resolve(&mut self, host: &str, owner: ConnId) -> Result<Resolution, NetError>;
    fn connect(&mut self, handle: HandleId, addr: Ipv4Addr, port: u16) -> Result<(), NetError>;
    fn write(&mut self, handle: HandleId, bytes: &[u8]) -> Result<(), NetError>;
    /// Bind and listen with a backlog of one; accepted peers arrive as
    /// `Accepted` events for `owner`.
    fn listen(&mut self, port: u16, owner: ConnId) -> Result<HandleId, NetError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    DnsFound(Option<Ipv4Addr>),
    Connected(Result<(), NetError>),
    /// `None` means the peer closed the stream.
    Received(Option<RxChunk>),
    Sent(u16),
    Poll,
    /// The handle is already gone when this arrives.
    Error(NetError),
    Accepted(Result<HandleId, NetError>),
}

impl TransportEventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DnsFound(_) => "dns_found",
            Self::Connected(_) => "connected",
            Self::Received(Some(_)) => "received",
            Self::Received(None) => "peer_closed",
            Self::Sent(_) => "sent",
            Self::Poll => "poll",
            Self::Error(_) => "error",
            Self::Accepted(_) => "accepted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub conn: ConnId,
    /// Socket the event came from; `None` for owner-level events such as
    /// lookups and accepts.
    pub handle: Option<HandleId>,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub const fn new(conn: ConnId, kind: TransportEventKind) -> Self {
        Self {
            conn,
            handle: None,
            kind,
        }
    }

    pub const fn from_handle(conn: ConnId, handle: HandleId, kind: TransportEventKind) -> Self {
        Self {
            conn,
            handle: Some(handle),
            kind,
        }
    }

    pub fn received(conn: ConnId, bytes: &[u8]) -> Self {
        let mut chunk = RxChunk::new();
        let take = bytes.len().min(RX_CHUNK_MAX);
        // Capacity checked above.
        let _ = chunk.extend_from_slice(&bytes[..take]);
        Self::new(conn, TransportEventKind::Received(Some(chunk)))
    }
}
