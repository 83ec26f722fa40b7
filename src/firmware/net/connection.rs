use alloc::{collections::BTreeSet, string::String, vec::Vec};
use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};

use super::{
    endpoint::Endpoint,
    http,
    transport::{Resolution, RxChunk, Transport, TransportEventKind},
};
use crate::firmware::{
    telemetry,
    types::{ConnId, ConnState, HandleId, NetError},
};


#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Client(Endpoint),
    Server { port: u16 },
}

/// What the owner has to do after an event was applied.
#[derive(Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,
    /// Stale or empty event; nothing changed.
    Ignored,
    /// Server role: a request that needs a synchronous reply.
    Request(RxChunk),
}

/// One logical endpoint. All state changes go through the methods below,
/// whether they were triggered by a transport event or by the loop.
pub struct Connection {
    id: ConnId,
    label: String,
    role: Role,
    state: ConnState,
    handle: Option<HandleId>,
    // Handle opened but never used for a connect; safe to reuse.
    handle_fresh: bool,
    response: Option<Vec<u8>>,
    connect_initiated: Option<Instant>,
    send_initiated: Option<Instant>,
    timeout: Duration,
    headers: BTreeSet<String>,
    remote: Option<Ipv4Addr>,
}

impl Connection {
    pub(crate) fn client(
        id: ConnId,
        label: String,
        endpoint: Endpoint,
        timeout: Duration,
    ) -> Self {
        Self::with_role(id, label, Role::Client(endpoint), timeout)
    }

    pub(crate) fn server(id: ConnId, label: String, port: u16, timeout: Duration) -> Self {
        Self::with_role(id, label, Role::Server { port }, timeout)
    }

    fn with_role(id: ConnId, label: String, role: Role, timeout: Duration) -> Self {
        Self {
            id,
            label,
            role,
            state: ConnState::Init,
            handle: None,
            handle_fresh: false,
            response: None,
            connect_initiated: None,
            send_initiated: None,
            timeout,
            headers: BTreeSet::new(),
            remote: None,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        match &self.role {
            Role::Client(endpoint) => Some(endpoint),
            Role::Server { .. } => None,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn handle(&self) -> Option<HandleId> {
        self.handle
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn remote(&self) -> Option<Ipv4Addr> {
        self.remote
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    /// Returns false if the header was already registered.
    pub fn add_header(&mut self, header: &str) -> bool {
        self.headers.insert(String::from(header))
    }

    pub fn headers(&self) -> &BTreeSet<String> {
        &self.headers
    }

    pub(crate) fn set_state(&mut self, next: ConnState, reason: &'static str) {
        if self.state == next {
            return;
        }
        log::debug!(
            "conn: id={} state={}->{} reason={}",
            self.label,
            self.state.as_str(),
            next.as_str(),
            reason
        );
        self.state = next;
    }

    /// Opens a handle unless one is held already.
    pub(crate) fn open_handle<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<HandleId, NetError> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        let secure = self.endpoint().is_some_and(Endpoint::is_secure);
        let handle = transport.open(secure)?;
        self.attach(transport, handle);
        self.handle_fresh = true;
        Ok(handle)
    }

    /// Takes ownership of `handle`; a previously held handle is released first.
    pub(crate) fn attach<T: Transport + ?Sized>(&mut self, transport: &mut T, handle: HandleId) {
        if self.handle.is_some() {
            let _ = self.release_handle(transport);
        }
        transport.register(handle, self.id);
        self.handle = Some(handle);
        self.handle_fresh = false;
    }

    /// Unregisters callbacks, then closes; a failed close falls back to abort.
    /// The local reference is always cleared. Calling it without a handle
    /// does nothing.
    pub fn release_handle<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), NetError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.handle_fresh = false;
        transport.unregister(handle);
        match transport.close(handle) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!(
                    "conn: id={} close failed code={} ({}); aborting",
                    self.label,
                    err.code(),
                    err.as_str()
                );
                transport.abort(handle);
                Err(NetError::Abort)
            }
        }
    }

    /// Starts name resolution. Only valid from `Init`.
    pub fn connect<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        now: Instant,
    ) -> ConnState {
        if self.state != ConnState::Init {
            log::debug!(
                "conn: id={} connect skipped state={}",
                self.label,
                self.state.as_str()
            );
            return self.state;
        }
        if self.endpoint().is_none() {
            return self.state;
        }

        if self.handle.is_some() && !self.handle_fresh {
            let _ = self.release_handle(transport);
        }
        if let Err(err) = self.open_handle(transport) {
            log::error!(
                "conn: id={} handle alloc failed code={} ({})",
                self.label,
                err.code(),
                err.as_str()
            );
            telemetry::record_conn_failure();
            self.set_state(ConnState::Error, "handle_alloc");
            return self.state;
        }
        self.handle_fresh = false;

        if let Some(endpoint) = self.endpoint() {
            log::info!(
                "conn: id={} connecting host={} port={}",
                self.label,
                endpoint.host(),
                endpoint.port()
            );
        }
        self.set_state(ConnState::Dns, "connect");
        self.connect_initiated = Some(now);
        telemetry::record_conn_attempt();

        let resolution = match &self.role {
            Role::Client(endpoint) => transport.resolve(endpoint.host(), self.id),
            Role::Server { .. } => return self.state,
        };
        match resolution {
            Ok(Resolution::Resolved(addr)) => self.on_dns(transport, Some(addr), now),
            Ok(Resolution::Pending) => {
                log::debug!("conn: id={} dns pending", self.label);
            }
            Err(err) => {
                log::error!(
                    "conn: id={} dns start failed code={} ({})",
                    self.label,
                    err.code(),
                    err.as_str()
                );
                telemetry::record_conn_failure();
                self.set_state(ConnState::Init, "dns_start_failed");
            }
        }
        self.state
    }

    /// Drops whatever handle is held and starts over from `Init`.
    pub fn reconnect<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        now: Instant,
    ) -> ConnState {
        log::debug!("conn: id={} reconnect", self.label);
        let _ = self.release_handle(transport);
        self.set_state(ConnState::Init, "reconnect");
        self.connect(transport, now)
    }

    /// Releases the handle and returns to `Init` from any state.
    pub fn abandon<T: Transport + ?Sized>(&mut self, transport: &mut T, reason: &'static str) {
        let _ = self.release_handle(transport);
        self.set_state(ConnState::Init, reason);
    }

    /// Frames and writes a POST. Only valid from `Ready`; any other state is
    /// returned unchanged without touching the transport.
    pub fn post_request<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        resource: &str,
        payload: &str,
        now: Instant,
    ) -> ConnState {
        if self.state != ConnState::Ready {
            log::debug!(
                "conn: id={} post skipped state={}",
                self.label,
                self.state.as_str()
            );
            return self.state;
        }
        let Role::Client(endpoint) = &self.role else {
            return self.state;
        };
        let request = http::build_post(resource, &endpoint.host_header(), &self.headers, payload);
        self.response = None;

        let Some(handle) = self.handle else {
            self.set_state(ConnState::Init, "no_handle");
            return self.state;
        };
        log::debug!(
            "conn: id={} post resource={} bytes={}",
            self.label,
            resource,
            request.len()
        );
        match transport.write(handle, request.as_bytes()) {
            Ok(()) => {
                // A reply may already have been applied; only a plain Ready moves on.
                if self.state == ConnState::Ready {
                    self.set_state(ConnState::Sending, "written");
                }
                self.send_initiated = Some(now);
            }
            Err(err) if err.is_backpressure() => {
                log::warn!(
                    "conn: id={} send buffer full code={}; retry later",
                    self.label,
                    err.code()
                );
                telemetry::record_conn_backpressure();
                self.set_state(ConnState::Retry, "backpressure");
            }
            Err(err) => {
                log::error!(
                    "conn: id={} write failed code={} ({})",
                    self.label,
                    err.code(),
                    err.as_str()
                );
                telemetry::record_conn_failure();
                self.set_state(ConnState::Init, "write_failed");
            }
        }
        self.state
    }

    /// `Retry -> Ready` so the owner can write the same payload again.
    pub fn resume_after_backpressure(&mut self) -> bool {
        if self.state != ConnState::Retry {
            return false;
        }
        self.set_state(ConnState::Ready, "retry");
        true
    }

    /// Server role: writes a reply to the current peer; state stays `Server`.
    pub fn respond<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        reply: &str,
    ) -> Result<(), NetError> {
        let handle = self.handle.ok_or(NetError::Conn)?;
        transport.write(handle, reply.as_bytes()).map_err(|err| {
            log::error!(
                "conn: id={} reply write failed code={} ({})",
                self.label,
                err.code(),
                err.as_str()
            );
            err
        })
    }

    /// Hands out the buffered reply, closes the exchange and returns to `Init`.
    pub fn finish_reply<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Option<Vec<u8>> {
        if self.state != ConnState::Replied {
            return None;
        }
        let response = self.response.take();
        let _ = self.release_handle(transport);
        self.set_state(ConnState::Init, "reply_consumed");
        response
    }

    /// Idle tick: abandons a connect or send that outlived the timeout.
    pub fn check_timeout<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        now: Instant,
    ) -> bool {
        let started = match self.state {
            ConnState::Connecting => self.connect_initiated,
            ConnState::Sending => self.send_initiated,
            _ => return false,
        };
        let Some(started) = started else {
            return false;
        };
        if now.saturating_duration_since(started) <= self.timeout {
            return false;
        }
        log::warn!(
            "conn: id={} timeout state={} after_ms={}",
            self.label,
            self.state.as_str(),
            now.saturating_duration_since(started).as_millis()
        );
        telemetry::record_conn_timeout();
        self.abandon(transport, "timeout");
        true
    }

    /// Applies an event raised by `source`. Events from a handle this
    /// connection no longer holds are dropped.
    pub fn apply_event<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        source: Option<HandleId>,
        kind: TransportEventKind,
        now: Instant,
    ) -> EventOutcome {
        if let Some(source) = source {
            if self.handle != Some(source) {
                log::debug!(
                    "conn: id={} stale event={} from handle={} holding={:?}",
                    self.label,
                    kind.as_str(),
                    source.0,
                    self.handle.map(|handle| handle.0)
                );
                return EventOutcome::Ignored;
            }
        }
        self.handle_event(transport, kind, now)
    }

    pub fn handle_event<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        kind: TransportEventKind,
        now: Instant,
    ) -> EventOutcome {
        match kind {
            TransportEventKind::DnsFound(addr) => {
                if self.state != ConnState::Dns {
                    return EventOutcome::Ignored;
                }
                self.on_dns(transport, addr, now);
            }
            TransportEventKind::Connected(Ok(())) => {
                if self.state != ConnState::Connecting {
                    return EventOutcome::Ignored;
                }
                log::info!("conn: id={} connected", self.label);
                self.set_state(ConnState::Ready, "connected");
            }
            TransportEventKind::Connected(Err(err)) => {
                log::error!(
                    "conn: id={} connect failed code={} ({})",
                    self.label,
                    err.code(),
                    err.as_str()
                );
                telemetry::record_conn_failure();
                self.set_state(ConnState::Init, "connect_failed");
            }
            TransportEventKind::Received(None) => {
                log::debug!("conn: id={} closed by peer", self.label);
                let _ = self.release_handle(transport);
                self.set_state(ConnState::Init, "peer_closed");
            }
            TransportEventKind::Received(Some(chunk)) => {
                if chunk.is_empty() {
                    return EventOutcome::Ignored;
                }
                match self.state {
                    ConnState::Server => return EventOutcome::Request(chunk),
                    ConnState::Ready
                    | ConnState::Sending
                    | ConnState::Retry
                    | ConnState::Replied => {
                        log::debug!("conn: id={} received bytes={}", self.label, chunk.len());
                        // One reply per request: a later chunk replaces an earlier one.
                        self.response = Some(chunk.to_vec());
                        self.set_state(ConnState::Replied, "received");
                    }
                    _ => return EventOutcome::Ignored,
                }
            }
            TransportEventKind::Sent(len) => {
                log::debug!("conn: id={} sent bytes={}", self.label, len);
                match self.state {
                    ConnState::Ready => self.set_state(ConnState::Sending, "sent"),
                    ConnState::Retry => self.set_state(ConnState::Ready, "send_buffer_drained"),
                    _ => return EventOutcome::Ignored,
                }
            }
            TransportEventKind::Poll => {
                if !self.check_timeout(transport, now) {
                    return EventOutcome::Ignored;
                }
            }
            TransportEventKind::Error(err) => {
                log::error!(
                    "conn: id={} transport error code={} ({})",
                    self.label,
                    err.code(),
                    err.as_str()
                );
                telemetry::record_conn_failure();
                // The stack already freed the handle.
                self.handle = None;
                self.handle_fresh = false;
                self.set_state(ConnState::Init, "transport_error");
            }
            TransportEventKind::Accepted(Ok(handle)) => {
                log::debug!("conn: id={} peer accepted", self.label);
                self.attach(transport, handle);
                self.response = None;
                self.set_state(ConnState::Server, "accepted");
            }
            TransportEventKind::Accepted(Err(err)) => {
                log::error!(
                    "conn: id={} accept failed code={} ({})",
                    self.label,
                    err.code(),
                    err.as_str()
                );
                let _ = self.release_handle(transport);
                self.set_state(ConnState::Init, "accept_failed");
            }
        }
        EventOutcome::Handled
    }

    fn on_dns<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        addr: Option<Ipv4Addr>,
        now: Instant,
    ) {
        let Some(addr) = addr else {
            log::error!("conn: id={} dns lookup failed", self.label);
            telemetry::record_conn_failure();
            self.set_state(ConnState::Init, "dns_failed");
            return;
        };
        let (Some(handle), Some(port)) = (self.handle, self.endpoint().map(Endpoint::port)) else {
            self.set_state(ConnState::Init, "no_handle");
            return;
        };
        self.remote = Some(addr);
        self.set_state(ConnState::Connecting, "dns_found");
        self.connect_initiated = Some(now);
        if let Err(err) = transport.connect(handle, addr, port) {
            log::error!(
                "conn: id={} connect start failed code={} ({})",
                self.label,
                err.code(),
                err.as_str()
            );
            telemetry::record_conn_failure();
            self.set_state(ConnState::Init, "connect_start_failed");
        }
    }
}
