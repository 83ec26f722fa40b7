use core::net::Ipv4Addr;

use embassy_net::{
    dns::DnsQueryType,
    udp::{PacketMetadata, UdpSocket},
    IpAddress, IpEndpoint, Stack,
};
use embassy_time::{with_timeout, Duration};

use crate::firmware::radio::{
    parse_sntp_reply, sntp_request, TimeSource, SNTP_PACKET_LEN, SNTP_PORT,
};

const SNTP_LOCAL_PORT: u16 = 50_123;
const SNTP_TIMEOUT: Duration = Duration::from_secs(5);
const SNTP_BUF: usize = 128;

/// One-shot SNTP queries against a fixed server.
pub struct SntpClient {
    stack: Stack<'static>,
    server: &'static str,
}

impl SntpClient {
    pub(super) fn new(stack: Stack<'static>, server: &'static str) -> Self {
        Self { stack, server }
    }

    async fn server_address(&self) -> Result<Ipv4Addr, &'static str> {
        if let Ok(addr) = self.server.parse::<Ipv4Addr>() {
            return Ok(addr);
        }
        let addrs = self
            .stack
            .dns_query(self.server, DnsQueryType::A)
            .await
            .map_err(|_| "dns")?;
        addrs
            .iter()
            .find_map(|addr| match addr {
                IpAddress::Ipv4(v4) => Some(*v4),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .ok_or("no address")
    }

    async fn exchange(&mut self) -> Result<u64, &'static str> {
        let server = self.server_address().await?;

        let mut rx_meta = [PacketMetadata::EMPTY; 1];
        let mut tx_meta = [PacketMetadata::EMPTY; 1];
        let mut rx_storage = [0u8; SNTP_BUF];
        let mut tx_storage = [0u8; SNTP_BUF];
        let mut socket = UdpSocket::new(
            self.stack,
            &mut rx_meta,
            &mut rx_storage,
            &mut tx_meta,
            &mut tx_storage,
        );
        socket.bind(SNTP_LOCAL_PORT).map_err(|_| "bind")?;

        let remote = IpEndpoint::new(IpAddress::Ipv4(server), SNTP_PORT);
        socket
            .send_to(&sntp_request(), remote)
            .await
            .map_err(|_| "send")?;

        let mut reply = [0u8; SNTP_PACKET_LEN];
        let (len, _) = socket.recv_from(&mut reply).await.map_err(|_| "recv")?;
        parse_sntp_reply(&reply[..len]).ok_or("bad reply")
    }
}

impl TimeSource for SntpClient {
    async fn query_utc(&mut self) -> u64 {
        match with_timeout(SNTP_TIMEOUT, self.exchange()).await {
            Ok(Ok(seconds)) => {
                log::info!("sntp: server={} utc_s={}", self.server, seconds);
                seconds
            }
            Ok(Err(reason)) => {
                log::warn!("sntp: server={} failed reason={}", self.server, reason);
                0
            }
            Err(_) => {
                log::warn!("sntp: server={} timed out", self.server);
                0
            }
        }
    }
}
