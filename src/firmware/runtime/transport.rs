//! `Transport` over embassy-net.
//!
//! Every socket is owned by a worker task. The scheduling loop talks to the
//! workers through per-slot command queues and never blocks; the workers
//! report back through `TRANSPORT_EVENTS`, tagged with the connection that
//! registered the slot and the handle the session was started for.

use alloc::vec::Vec;
use core::{
    cell::RefCell,
    net::Ipv4Addr,
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
};

use embassy_futures::select::{select, Either};
use embassy_net::{
    dns::DnsQueryType,
    tcp::{AcceptError, ConnectError, TcpSocket},
    IpAddress, IpEndpoint, IpListenEndpoint, Stack,
};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    channel::Channel,
};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write as _;
use heapless::String as HString;

use crate::firmware::{
    config::TRANSPORT_EVENTS,
    net::{Resolution, RxChunk, Transport, TransportEvent, TransportEventKind, RX_CHUNK_MAX},
    types::{ConnId, HandleId, NetError},
};

pub const CLIENT_SLOTS: usize = 3;
const LISTENER_SLOT: usize = CLIENT_SLOTS;
const PEER_SLOT: usize = CLIENT_SLOTS + 1;
const SLOTS: usize = CLIENT_SLOTS + 2;
// Handle layout: slot in the low bits, slot generation above.
const SLOT_BITS: u8 = 3;
const SLOT_MASK: u8 = (1 << SLOT_BITS) - 1;
const GENERATION_MASK: u8 = u8::MAX >> SLOT_BITS;

const COMMAND_DEPTH: usize = 4;
const SOCKET_RX_BUF: usize = 2048;
const SOCKET_TX_BUF: usize = 2048;
const SOCKET_TIMEOUT_S: u64 = 30;
const PEER_LINGER_MS: u64 = 20;
const ACCEPT_RETRY_MS: u64 = 1_000;
const HOST_MAX: usize = 64;
const NO_OWNER: u8 = u8::MAX;

enum SocketCommand {
    Connect(Ipv4Addr, u16),
    Write(Vec<u8>),
    Listen(u16),
    Close,
    Abort,
}

impl SocketCommand {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Connect(..) => "connect",
            Self::Write(_) => "write",
            Self::Listen(_) => "listen",
            Self::Close => "close",
            Self::Abort => "abort",
        }
    }
}

type CommandQueue = Channel<CriticalSectionRawMutex, SocketCommand, COMMAND_DEPTH>;

static COMMANDS: [CommandQueue; SLOTS] = [const { Channel::new() }; SLOTS];
static OWNERS: [AtomicU8; SLOTS] = [const { AtomicU8::new(NO_OWNER) }; SLOTS];
static CLIENT_IN_USE: [AtomicBool; CLIENT_SLOTS] = [const { AtomicBool::new(false) }; CLIENT_SLOTS];
static GENERATIONS: [AtomicU8; SLOTS] = [const { AtomicU8::new(0) }; SLOTS];

struct DnsRequest {
    owner: ConnId,
    host: HString<HOST_MAX>,
}

static DNS_REQUESTS: Channel<CriticalSectionRawMutex, DnsRequest, 2> = Channel::new();
type DnsCache = RefCell<Option<(HString<HOST_MAX>, Ipv4Addr)>>;

static DNS_CACHE: Mutex<CriticalSectionRawMutex, DnsCache> = Mutex::new(RefCell::new(None));

/// Loop-side handle on the socket workers. All state lives in statics
/// shared with the worker tasks.
#[derive(Default)]
pub struct EspTransport {
    _private: (),
}

/// Handle of the slot's current generation.
fn handle_for(slot: usize) -> HandleId {
    let generation = GENERATIONS[slot].load(Ordering::Acquire) & GENERATION_MASK;
    HandleId((generation << SLOT_BITS) | slot as u8)
}

/// Starts a new generation; handles of the previous one go stale.
fn next_generation(slot: usize) -> HandleId {
    GENERATIONS[slot].fetch_add(1, Ordering::AcqRel);
    handle_for(slot)
}

/// Slot behind `handle`; stale handles map to nothing.
fn slot_of(handle: HandleId) -> Option<usize> {
    let slot = usize::from(handle.0 & SLOT_MASK);
    (slot < SLOTS && handle_for(slot) == handle).then_some(slot)
}

fn free_slot(slot: usize) {
    if let Some(flag) = CLIENT_IN_USE.get(slot) {
        flag.store(false, Ordering::Release);
    }
}

fn send(slot: usize, command: SocketCommand) -> Result<(), NetError> {
    COMMANDS[slot].try_send(command).map_err(|_| NetError::Mem)
}

fn cached_address(host: &str) -> Option<Ipv4Addr> {
    DNS_CACHE.lock(|cache| {
        cache
            .borrow()
            .as_ref()
            .filter(|(known, _)| known.as_str() == host)
            .map(|(_, addr)| *addr)
    })
}

impl Transport for EspTransport {
    fn open(&mut self, secure: bool) -> Result<HandleId, NetError> {
        if secure {
            log::error!("transport: tls is not available");
            return Err(NetError::Argument);
        }
        for (slot, flag) in CLIENT_IN_USE.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(next_generation(slot));
            }
        }
        Err(NetError::Mem)
    }

    fn register(&mut self, handle: HandleId, owner: ConnId) {
        if let Some(slot) = slot_of(handle) {
            OWNERS[slot].store(owner.0, Ordering::Release);
        }
    }

    fn unregister(&mut self, handle: HandleId) {
        if let Some(slot) = slot_of(handle) {
            OWNERS[slot].store(NO_OWNER, Ordering::Release);
        }
    }

    fn close(&mut self, handle: HandleId) -> Result<(), NetError> {
        let Some(slot) = slot_of(handle) else {
            return Ok(());
        };
        send(slot, SocketCommand::Close)?;
        free_slot(slot);
        Ok(())
    }

    fn abort(&mut self, handle: HandleId) {
        let Some(slot) = slot_of(handle) else {
            return;
        };
        COMMANDS[slot].clear();
        let _ = send(slot, SocketCommand::Abort);
        free_slot(slot);
    }

    fn resolve(&mut self, host: &str, owner: ConnId) -> Result<Resolution, NetError> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Ok(Resolution::Resolved(addr));
        }
        if let Some(addr) = cached_address(host) {
            return Ok(Resolution::Resolved(addr));
        }
        let mut name = HString::new();
        name.push_str(host).map_err(|_| NetError::Argument)?;
        DNS_REQUESTS
            .try_send(DnsRequest { owner, host: name })
            .map_err(|_| NetError::InProgress)?;
        Ok(Resolution::Pending)
    }

    fn connect(&mut self, handle: HandleId, addr: Ipv4Addr, port: u16) -> Result<(), NetError> {
        let slot = slot_of(handle).ok_or(NetError::Argument)?;
        send(slot, SocketCommand::Connect(addr, port))
    }

    fn write(&mut self, handle: HandleId, bytes: &[u8]) -> Result<(), NetError> {
        let slot = slot_of(handle).ok_or(NetError::Conn)?;
        send(slot, SocketCommand::Write(bytes.to_vec()))
    }

    fn listen(&mut self, port: u16, owner: ConnId) -> Result<HandleId, NetError> {
        send(LISTENER_SLOT, SocketCommand::Listen(port)).map_err(|_| NetError::Use)?;
        OWNERS[LISTENER_SLOT].store(owner.0, Ordering::Release);
        Ok(handle_for(LISTENER_SLOT))
    }
}

fn connect_error(err: ConnectError) -> NetError {
    match err {
        ConnectError::InvalidState => NetError::IsConnected,
        ConnectError::ConnectionReset => NetError::Reset,
        ConnectError::TimedOut => NetError::Timeout,
        ConnectError::NoRoute => NetError::Route,
    }
}

fn accept_error(err: AcceptError) -> NetError {
    match err {
        AcceptError::InvalidState => NetError::Use,
        AcceptError::InvalidPort => NetError::Value,
        AcceptError::ConnectionReset => NetError::Reset,
    }
}

async fn emit_to(owner: u8, handle: Option<HandleId>, kind: TransportEventKind) {
    if owner == NO_OWNER {
        log::debug!("transport: handle={:?} event={} unowned", handle, kind.as_str());
        return;
    }
    let event = match handle {
        Some(handle) => TransportEvent::from_handle(ConnId(owner), handle, kind),
        None => TransportEvent::new(ConnId(owner), kind),
    };
    TRANSPORT_EVENTS.send(event).await;
}

async fn emit(slot: usize, handle: HandleId, kind: TransportEventKind) {
    emit_to(OWNERS[slot].load(Ordering::Acquire), Some(handle), kind).await;
}

/// The stack dropped the socket; the owner forgets the handle on receipt.
/// A handle that already went stale keeps the slot's new owner untouched.
async fn emit_lost(slot: usize, handle: HandleId, err: NetError) {
    if slot_of(handle) != Some(slot) {
        log::debug!("transport: slot={} lost stale handle={:?}", slot, handle);
        return;
    }
    let owner = OWNERS[slot].swap(NO_OWNER, Ordering::AcqRel);
    free_slot(slot);
    emit_to(owner, Some(handle), TransportEventKind::Error(err)).await;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    PeerClosed,
    Closed,
    Lost,
    Replied,
}

/// Shuttles bytes between the socket and the owner until either side ends
/// the exchange. `one_shot` ends the session after the first write.
async fn serve_session(
    socket: &mut TcpSocket<'_>,
    slot: usize,
    handle: HandleId,
    one_shot: bool,
) -> SessionEnd {
    let mut chunk = [0u8; RX_CHUNK_MAX];
    loop {
        match select(socket.read(&mut chunk), COMMANDS[slot].receive()).await {
            Either::First(Ok(0)) => {
                emit(slot, handle, TransportEventKind::Received(None)).await;
                return SessionEnd::PeerClosed;
            }
            Either::First(Ok(len)) => {
                let mut rx = RxChunk::new();
                let _ = rx.extend_from_slice(&chunk[..len]);
                emit(slot, handle, TransportEventKind::Received(Some(rx))).await;
            }
            Either::First(Err(err)) => {
                log::warn!("transport: slot={} read err={:?}", slot, err);
                emit_lost(slot, handle, NetError::Reset).await;
                return SessionEnd::Lost;
            }
            Either::Second(SocketCommand::Write(bytes)) => {
                if let Err(err) = socket.write_all(&bytes).await {
                    log::warn!("transport: slot={} write err={:?}", slot, err);
                    emit_lost(slot, handle, NetError::Reset).await;
                    return SessionEnd::Lost;
                }
                let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
                emit(slot, handle, TransportEventKind::Sent(len)).await;
                if one_shot {
                    let _ = socket.flush().await;
                    return SessionEnd::Replied;
                }
            }
            Either::Second(SocketCommand::Close) => {
                let _ = socket.flush().await;
                socket.close();
                return SessionEnd::Closed;
            }
            Either::Second(SocketCommand::Abort) => {
                socket.abort();
                return SessionEnd::Closed;
            }
            Either::Second(other) => {
                log::warn!("transport: slot={} unexpected {}", slot, other.as_str());
            }
        }
    }
}

#[embassy_executor::task(pool_size = CLIENT_SLOTS)]
pub(super) async fn client_socket_task(stack: Stack<'static>, slot: usize) {
    let mut rx_buffer = [0u8; SOCKET_RX_BUF];
    let mut tx_buffer = [0u8; SOCKET_TX_BUF];

    loop {
        let (addr, port) = match COMMANDS[slot].receive().await {
            SocketCommand::Connect(addr, port) => (addr, port),
            SocketCommand::Close | SocketCommand::Abort => continue,
            other => {
                log::debug!("transport: slot={} idle, dropped {}", slot, other.as_str());
                continue;
            }
        };

        let handle = handle_for(slot);
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
        socket.set_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_S)));
        let remote = IpEndpoint::new(IpAddress::Ipv4(addr), port);
        match select(socket.connect(remote), COMMANDS[slot].receive()).await {
            Either::First(Ok(())) => {
                emit(slot, handle, TransportEventKind::Connected(Ok(()))).await;
                serve_session(&mut socket, slot, handle, false).await;
            }
            Either::First(Err(err)) => {
                log::warn!("transport: slot={} connect err={:?}", slot, err);
                let kind = TransportEventKind::Connected(Err(connect_error(err)));
                emit(slot, handle, kind).await;
            }
            Either::Second(command) => {
                log::debug!("transport: slot={} connect cut by {}", slot, command.as_str());
            }
        }
        socket.abort();
        let _ = socket.flush().await;
    }
}

/// Accepts one peer at a time on the status port.
#[embassy_executor::task]
pub(super) async fn listener_task(stack: Stack<'static>) {
    let mut rx_buffer = [0u8; SOCKET_RX_BUF];
    let mut tx_buffer = [0u8; SOCKET_TX_BUF];

    loop {
        let port = match COMMANDS[LISTENER_SLOT].receive().await {
            SocketCommand::Listen(port) => port,
            _ => continue,
        };
        log::info!("transport: listening port={}", port);
        let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);

        loop {
            socket.set_timeout(Some(Duration::from_secs(SOCKET_TIMEOUT_S)));
            let endpoint = IpListenEndpoint { addr: None, port };
            match select(socket.accept(endpoint), COMMANDS[LISTENER_SLOT].receive()).await {
                Either::First(Ok(())) => {}
                Either::First(Err(err)) => {
                    log::warn!("transport: accept port={} err={:?}", port, err);
                    let owner = OWNERS[LISTENER_SLOT].load(Ordering::Acquire);
                    let kind = TransportEventKind::Accepted(Err(accept_error(err)));
                    emit_to(owner, None, kind).await;
                    socket.abort();
                    Timer::after(Duration::from_millis(ACCEPT_RETRY_MS)).await;
                    continue;
                }
                Either::Second(SocketCommand::Close | SocketCommand::Abort) => {
                    log::info!("transport: listener closed port={}", port);
                    socket.abort();
                    break;
                }
                Either::Second(_) => continue,
            }

            let owner = OWNERS[LISTENER_SLOT].load(Ordering::Acquire);
            COMMANDS[PEER_SLOT].clear();
            // Requests can arrive before the owner registers the peer.
            OWNERS[PEER_SLOT].store(owner, Ordering::Release);
            let peer = next_generation(PEER_SLOT);
            emit_to(owner, None, TransportEventKind::Accepted(Ok(peer))).await;

            let end = serve_session(&mut socket, PEER_SLOT, peer, true).await;

            // A late close for this visitor must not reach the next one.
            next_generation(PEER_SLOT);
            let owner = OWNERS[PEER_SLOT].swap(NO_OWNER, Ordering::AcqRel);
            COMMANDS[PEER_SLOT].clear();
            if end == SessionEnd::Replied {
                emit_to(owner, Some(peer), TransportEventKind::Received(None)).await;
            }
            Timer::after(Duration::from_millis(PEER_LINGER_MS)).await;
            socket.close();
            Timer::after(Duration::from_millis(PEER_LINGER_MS)).await;
            socket.abort();
            let _ = socket.flush().await;
        }
    }
}

fn first_ipv4(addrs: &[IpAddress]) -> Option<Ipv4Addr> {
    addrs.iter().find_map(|addr| match addr {
        IpAddress::Ipv4(v4) => Some(*v4),
        #[allow(unreachable_patterns)]
        _ => None,
    })
}

/// Answers `resolve` requests; the newest answer is cached.
#[embassy_executor::task]
pub(super) async fn dns_task(stack: Stack<'static>) {
    loop {
        let request = DNS_REQUESTS.receive().await;
        let answer = match stack.dns_query(request.host.as_str(), DnsQueryType::A).await {
            Ok(addrs) => first_ipv4(&addrs),
            Err(err) => {
                log::warn!("transport: dns host={} err={:?}", request.host, err);
                None
            }
        };
        if let Some(addr) = answer {
            log::debug!("transport: dns host={} addr={}", request.host, addr);
            DNS_CACHE.lock(|cache| {
                cache.replace(Some((request.host.clone(), addr)));
            });
        }
        TRANSPORT_EVENTS
            .send(TransportEvent::new(
                request.owner,
                TransportEventKind::DnsFound(answer),
            ))
            .await;
    }
}
