use alloc::{
    collections::VecDeque,
    format,
    string::{String, ToString},
    vec::Vec,
};

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use super::{
    connection::{Connection, EventOutcome},
    endpoint::{Endpoint, EndpointError},
    transport::{Transport, TransportEvent},
};
use crate::firmware::{
    config::{NetPolicy, TransportEvents},
    telemetry,
    types::{ConnId, ConnState, NetError},
};

const SERVER_LABEL: &str = "lwi-srv";
const PENDING_REQUESTS_MAX: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryError {
    Endpoint(EndpointError),
    HandleAlloc(NetError),
    ServerBind(NetError),
    ServerExists,
    Full,
}

impl RegistryError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Endpoint(err) => err.as_str(),
            Self::HandleAlloc(_) => "transport handle allocation failed",
            Self::ServerBind(_) => "status server bind failed",
            Self::ServerExists => "status server already running",
            Self::Full => "connection table full",
        }
    }
}

/// Answers a request received on the server connection.
pub trait RequestHandler {
    fn process(&mut self, request: &str) -> Option<String>;
}

#[derive(Clone, Copy, Debug)]
struct ServerSlot {
    conn: ConnId,
    port: u16,
}

/// Owns every connection; at most one per `scheme://host:port`.
pub struct Registry {
    connections: Vec<Connection>,
    server: Option<ServerSlot>,
    pending_requests: VecDeque<(ConnId, String)>,
    policy: NetPolicy,
}

impl Registry {
    pub fn new(policy: NetPolicy) -> Self {
        Self {
            connections: Vec::new(),
            server: None,
            pending_requests: VecDeque::new(),
            policy: policy.sanitized(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.policy.timeout_ms))
    }

    fn next_id(&self) -> Result<ConnId, RegistryError> {
        u8::try_from(self.connections.len())
            .map(ConnId)
            .map_err(|_| RegistryError::Full)
    }

    /// Returns the connection for `url`, creating it on first use. A new
    /// connection opens its transport handle right away.
    pub fn get_or_create<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        url: &str,
    ) -> Result<ConnId, RegistryError> {
        let endpoint = Endpoint::parse(url).map_err(|err| {
            log::error!("registry: url={} err={}", url, err.as_str());
            RegistryError::Endpoint(err)
        })?;
        let key = endpoint.key();
        if let Some(existing) = self
            .connections
            .iter()
            .find(|conn| conn.endpoint().is_some_and(|known| known.key() == key))
        {
            log::debug!("registry: reuse id={} key={}", existing.label(), key);
            return Ok(existing.id());
        }

        let id = self.next_id()?;
        let clients = self
            .connections
            .iter()
            .filter(|conn| conn.endpoint().is_some())
            .count();
        let mut conn = Connection::client(id, format!("lwi{}", clients), endpoint, self.timeout());
        conn.open_handle(transport).map_err(|err| {
            log::error!(
                "registry: handle alloc failed key={} code={}",
                key,
                err.code()
            );
            RegistryError::HandleAlloc(err)
        })?;
        log::info!("registry: created id={} key={}", conn.label(), key);
        self.connections.push(conn);
        Ok(id)
    }

    /// Binds the single status server socket.
    pub fn start_server<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        port: u16,
    ) -> Result<ConnId, RegistryError> {
        if self.server.is_some() {
            return Err(RegistryError::ServerExists);
        }
        let id = self.next_id()?;
        let listener = transport.listen(port, id).map_err(|err| {
            log::error!("registry: listen failed port={} code={}", port, err.code());
            RegistryError::ServerBind(err)
        })?;
        self.connections.push(Connection::server(
            id,
            SERVER_LABEL.to_string(),
            port,
            self.timeout(),
        ));
        self.server = Some(ServerSlot { conn: id, port });
        log::info!(
            "registry: status server listening port={} handle={}",
            port,
            listener.0
        );
        Ok(id)
    }

    pub fn policy(&self) -> NetPolicy {
        self.policy
    }

    pub fn server_conn(&self) -> Option<ConnId> {
        self.server.map(|slot| slot.conn)
    }

    pub fn server_port(&self) -> Option<u16> {
        self.server.map(|slot| slot.port)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(usize::from(id.0))
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(usize::from(id.0))
    }

    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        self.get(id).map(Connection::state)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn any_busy(&self) -> bool {
        self.connections.iter().any(Connection::is_busy)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_requests.len()
    }

    /// Applies one transport event to its connection.
    pub fn dispatch<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        event: TransportEvent,
        now: Instant,
    ) {
        let TransportEvent { conn, handle, kind } = event;
        let Some(target) = self.connections.get_mut(usize::from(conn.0)) else {
            log::warn!("registry: event={} for unknown conn={}", kind.as_str(), conn.0);
            return;
        };
        if let EventOutcome::Request(chunk) = target.apply_event(transport, handle, kind, now) {
            if self.pending_requests.len() >= PENDING_REQUESTS_MAX {
                log::warn!("registry: request dropped id={} queue full", target.label());
                return;
            }
            let request = String::from_utf8_lossy(&chunk).into_owned();
            self.pending_requests.push_back((conn, request));
        }
    }

    /// Drains everything queued by the transport since the last call.
    pub fn pump<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        events: &TransportEvents,
        now: Instant,
    ) -> usize {
        let mut applied = 0usize;
        while let Ok(event) = events.try_receive() {
            self.dispatch(transport, event, now);
            applied += 1;
        }
        applied
    }

    /// Serves requests collected by `pump`.
    pub fn answer_requests<T: Transport + ?Sized, H: RequestHandler + ?Sized>(
        &mut self,
        transport: &mut T,
        handler: &mut H,
    ) {
        while let Some((id, request)) = self.pending_requests.pop_front() {
            let Some(conn) = self.connections.get_mut(usize::from(id.0)) else {
                continue;
            };
            if conn.state() != ConnState::Server {
                log::debug!("registry: peer gone before reply id={}", conn.label());
                continue;
            }
            telemetry::record_httpd_request();
            if let Some(reply) = handler.process(&request) {
                let _ = conn.respond(transport, &reply);
            }
        }
    }

    /// Idle tick for every connection.
    pub fn poll_all<T: Transport + ?Sized>(&mut self, transport: &mut T, now: Instant) {
        for conn in self.connections.iter_mut() {
            conn.check_timeout(transport, now);
        }
    }

    /// Drops every client and peer handle before the radio goes down. The
    /// listening socket survives.
    pub fn release_all<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        for conn in self.connections.iter_mut() {
            if conn.handle().is_some() || conn.state() != ConnState::Init {
                conn.abandon(transport, "radio_off");
            }
        }
        self.pending_requests.clear();
    }

    /// While the lookup of `id` is outstanding, keeps draining events in
    /// `dns_step_ms` slices. Bounded by the connection timeout; an
    /// unanswered lookup is abandoned back to `Init`.
    pub async fn await_dns<T: Transport + ?Sized, D: DelayNs>(
        &mut self,
        transport: &mut T,
        events: &TransportEvents,
        delay: &mut D,
        id: ConnId,
        now: Instant,
    ) -> ConnState {
        let step_ms = self.policy.dns_step_ms;
        let max_steps = (self.policy.timeout_ms / step_ms).max(1);
        let mut waited_ms = 0u64;

        for _ in 0..max_steps {
            match self.state(id) {
                Some(ConnState::Dns) => {}
                Some(state) => return state,
                None => return ConnState::Error,
            }
            delay.delay_ms(step_ms).await;
            waited_ms += u64::from(step_ms);
            self.pump(transport, events, now + Duration::from_millis(waited_ms));
        }

        let Some(conn) = self.get_mut(id) else {
            return ConnState::Error;
        };
        if conn.state() == ConnState::Dns {
            log::warn!("registry: dns timeout id={} waited_ms={}", conn.label(), waited_ms);
            conn.abandon(transport, "dns_timeout");
        }
        conn.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{
        net::{Resolution, TransportEventKind},
        testing::{at_ms, Call, MockTransport, NoDelay, COLLECTOR_ADDR},
        types::HandleId,
    };

    struct Echo;

    impl RequestHandler for Echo {
        fn process(&mut self, request: &str) -> Option<String> {
            Some(format!("echo:{}", request))
        }
    }

    fn registry() -> Registry {
        Registry::new(NetPolicy::defaults())
    }

    #[test]
    fn same_endpoint_is_reused() {
        let mut transport = MockTransport::new();
        let mut registry = registry();

        let first = registry
            .get_or_create(&mut transport, "http://coll.example:8080/middleware.php")
            .unwrap();
        let second = registry
            .get_or_create(&mut transport, "http://coll.example:8080/other")
            .unwrap();
        let third = registry
            .get_or_create(&mut transport, "http://other.example:8080")
            .unwrap();

        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(registry.get(first).unwrap().label(), "lwi0");
        assert_eq!(registry.get(third).unwrap().label(), "lwi1");
        assert_eq!(transport.count(|call| matches!(call, Call::Open { .. })), 2);
    }

    #[test]
    fn url_without_port_is_rejected() {
        let mut transport = MockTransport::new();
        let mut registry = registry();
        assert_eq!(
            registry.get_or_create(&mut transport, "http://coll.example/middleware.php"),
            Err(RegistryError::Endpoint(EndpointError::MissingPort))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn handle_exhaustion_surfaces_as_error() {
        let mut transport = MockTransport::new();
        transport.open_error = Some(NetError::Mem);
        let mut registry = registry();
        assert_eq!(
            registry.get_or_create(&mut transport, "http://coll.example:80"),
            Err(RegistryError::HandleAlloc(NetError::Mem))
        );
    }

    #[test]
    fn single_server_per_registry() {
        let mut transport = MockTransport::new();
        let mut registry = registry();
        let id = registry.start_server(&mut transport, 80).unwrap();
        assert_eq!(registry.server_conn(), Some(id));
        assert_eq!(
            registry.start_server(&mut transport, 81),
            Err(RegistryError::ServerExists)
        );
    }

    #[test]
    fn bind_failure_is_reported() {
        let mut transport = MockTransport::new();
        transport.listen_result = Some(NetError::Use);
        let mut registry = registry();
        assert_eq!(
            registry.start_server(&mut transport, 80),
            Err(RegistryError::ServerBind(NetError::Use))
        );
        assert_eq!(registry.server_conn(), None);
    }

    #[test]
    fn pump_routes_events_and_queues_requests() {
        let mut transport = MockTransport::new();
        let events = TransportEvents::new();
        let mut registry = registry();
        let server = registry.start_server(&mut transport, 80).unwrap();

        events
            .try_send(TransportEvent::new(
                server,
                TransportEventKind::Accepted(Ok(HandleId(40))),
            ))
            .unwrap();
        events
            .try_send(TransportEvent::received(server, b"GET / HTTP/1.1\r\n\r\n"))
            .unwrap();

        assert_eq!(registry.pump(&mut transport, &events, at_ms(0)), 2);
        assert_eq!(registry.pending_requests(), 1);

        registry.answer_requests(&mut transport, &mut Echo);
        assert_eq!(registry.pending_requests(), 0);
        assert!(transport.last_write().unwrap().starts_with("echo:GET / HTTP/1.1"));
    }

    #[test]
    fn event_for_unknown_connection_is_dropped() {
        let mut transport = MockTransport::new();
        let mut registry = registry();
        registry.dispatch(
            &mut transport,
            TransportEvent::new(ConnId(9), TransportEventKind::Poll),
            at_ms(0),
        );
        assert!(transport.calls.is_empty());
    }

    #[test]
    fn late_event_from_replaced_handle_is_dropped() {
        let mut transport = MockTransport::new();
        let mut registry = registry();
        let id = registry
            .get_or_create(&mut transport, "http://coll.example:8080")
            .unwrap();
        let conn = registry.get_mut(id).unwrap();
        conn.connect(&mut transport, at_ms(0));
        let first = conn.handle().unwrap();
        conn.check_timeout(&mut transport, at_ms(40_000));
        conn.connect(&mut transport, at_ms(41_000));
        let second = conn.handle().unwrap();
        assert_ne!(first, second);

        registry.dispatch(
            &mut transport,
            TransportEvent::from_handle(id, first, TransportEventKind::Error(NetError::Reset)),
            at_ms(41_500),
        );

        assert_eq!(registry.get(id).unwrap().handle(), Some(second));
        assert_eq!(registry.state(id), Some(ConnState::Connecting));
        assert!(transport.live.contains(&second.0));
    }

    #[test]
    fn dns_wait_returns_once_answer_lands() {
        let mut transport = MockTransport::new();
        transport.resolve_result = Ok(Resolution::Pending);
        let events = TransportEvents::new();
        let mut registry = registry();
        let id = registry
            .get_or_create(&mut transport, "http://coll.example:8080")
            .unwrap();
        events
            .try_send(TransportEvent::new(
                id,
                TransportEventKind::DnsFound(Some(COLLECTOR_ADDR)),
            ))
            .unwrap();
        let mut delay = NoDelay::default();

        registry.get_mut(id).unwrap().connect(&mut transport, at_ms(0));

        let state = embassy_futures::block_on(registry.await_dns(
            &mut transport,
            &events,
            &mut delay,
            id,
            at_ms(0),
        ));

        assert_eq!(state, ConnState::Connecting);
        assert_eq!(delay.calls, 1);
    }

    #[test]
    fn dns_wait_is_bounded_by_timeout() {
        let mut transport = MockTransport::new();
        transport.resolve_result = Ok(Resolution::Pending);
        let events = TransportEvents::new();
        let mut registry = registry();
        let id = registry
            .get_or_create(&mut transport, "http://coll.example:8080")
            .unwrap();
        let mut delay = NoDelay::default();

        registry.get_mut(id).unwrap().connect(&mut transport, at_ms(0));

        let state = embassy_futures::block_on(registry.await_dns(
            &mut transport,
            &events,
            &mut delay,
            id,
            at_ms(0),
        ));

        assert_eq!(state, ConnState::Init);
        assert_eq!(delay.total_ms, u64::from(NetPolicy::defaults().timeout_ms));
        assert_eq!(registry.get(id).unwrap().handle(), None);
    }

    #[test]
    fn release_all_keeps_listener() {
        let mut transport = MockTransport::new();
        let mut registry = registry();
        let client = registry
            .get_or_create(&mut transport, "http://coll.example:8080")
            .unwrap();
        registry.start_server(&mut transport, 80).unwrap();
        registry.get_mut(client).unwrap().connect(&mut transport, at_ms(0));

        registry.release_all(&mut transport);

        assert_eq!(registry.state(client), Some(ConnState::Init));
        assert_eq!(transport.live.len(), 1);
        assert!(!registry.any_busy());
    }

    #[test]
    fn poll_all_times_out_stalled_connects() {
        let mut transport = MockTransport::new();
        let mut registry = registry();
        let client = registry
            .get_or_create(&mut transport, "http://coll.example:8080")
            .unwrap();
        registry.get_mut(client).unwrap().connect(&mut transport, at_ms(0));
        assert!(registry.any_busy());

        registry.poll_all(&mut transport, at_ms(31_000));

        assert_eq!(registry.state(client), Some(ConnState::Init));
    }
}
