use crate::amt::amt_messages::{AmtMessage, GatewayAddress, ResponseMac};
use crate::gateway::gateway_config::GatewayConfig;
use crate::packet::membership::{MembershipQuery, MembershipReport};
use crate::util::backoff::BackoffConfig;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::trace;

/// how long the fake relay waits for an expected message before failing the test
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// A gateway configuration pointing at a relay on `relay_addr`, with timers scaled down to tens
///  of milliseconds
pub fn engine_test_config(relay_addr: SocketAddr) -> GatewayConfig {
    let mut config = GatewayConfig::new(relay_addr);
    config.relay_port = relay_addr.port();
    config.local_addr = SocketAddr::new(relay_addr.ip(), 0);
    config.discovery_backoff = BackoffConfig::new(Duration::from_millis(50), Duration::from_millis(200));
    config.max_discovery_attempts = 10;
    config.request_backoff = BackoffConfig::new(Duration::from_millis(50), Duration::from_millis(200));
    config.max_request_attempts = 4;
    config.max_response_delay = Duration::from_millis(200);
    config.state_change_report_delay = Duration::from_millis(10);
    config.unsolicited_report_interval = Duration::from_millis(50);
    config.robustness = 2;
    config.default_query_interval = Duration::from_secs(10);
    config
}

/// A relay on a loopback UDP socket, driven step by step by test code. All methods panic if
///  something goes wrong, failing the test.
pub struct FakeRelay {
    socket: UdpSocket,
}

impl FakeRelay {
    pub async fn bind() -> FakeRelay {
        Self::bind_to("127.0.0.1:0".parse().expect("valid literal")).await
    }

    pub async fn bind_to(addr: SocketAddr) -> FakeRelay {
        FakeRelay {
            socket: UdpSocket::bind(addr).await.expect("bind fake relay socket"),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("fake relay socket has a local address")
    }

    pub async fn send_raw(&self, buf: &[u8], to: SocketAddr) {
        self.socket.send_to(buf, to).await.expect("send from fake relay");
    }

    pub async fn send(&self, message: &AmtMessage, to: SocketAddr) {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        self.send_raw(&buf, to).await;
    }

    async fn try_recv_message(&self, max_wait: Duration) -> Option<(AmtMessage, SocketAddr)> {
        let mut buf = vec![0u8; 65_536];
        let (len, from) = timeout(max_wait, self.socket.recv_from(&mut buf)).await
            .ok()?
            .expect("receive on fake relay");
        let message = AmtMessage::try_deser(&buf[..len]).expect("gateway sends well-formed messages");
        trace!("fake relay received {:?} from {:?}", message, from);
        Some((message, from))
    }

    pub async fn recv_message(&self) -> (AmtMessage, SocketAddr) {
        self.try_recv_message(RECEIVE_TIMEOUT).await
            .expect("no message from gateway")
    }

    /// waits for a relay discovery, skipping other messages, and returns its nonce and sender
    pub async fn expect_discovery(&self) -> (u32, SocketAddr) {
        loop {
            if let (AmtMessage::RelayDiscovery { nonce }, from) = self.recv_message().await {
                return (nonce, from);
            }
        }
    }

    /// answers a discovery, announcing this relay's address
    pub async fn advertise(&self, nonce: u32, to: SocketAddr) {
        self.send(&AmtMessage::RelayAdvertisement { nonce, relay_address: self.addr().ip() }, to).await;
    }

    /// waits for a request, skipping other messages, and returns its nonce and sender
    pub async fn expect_request(&self) -> (u32, SocketAddr) {
        loop {
            if let (AmtMessage::Request { nonce, .. }, from) = self.recv_message().await {
                return (nonce, from);
            }
        }
    }

    pub async fn send_query(&self, to: SocketAddr, response_mac: ResponseMac, nonce: u32, query: &MembershipQuery, gateway: Option<GatewayAddress>) {
        let packet = query.encode(self.addr().ip()).expect("encodable query");
        self.send(&AmtMessage::MembershipQuery {
            limited_membership: false,
            response_mac,
            nonce,
            packet: packet.freeze(),
            gateway,
        }, to).await;
    }

    /// waits for a membership update, skipping other messages
    pub async fn expect_update(&self) -> (MembershipReport, ResponseMac, u32) {
        loop {
            if let (AmtMessage::MembershipUpdate { response_mac, nonce, packet }, _) = self.recv_message().await {
                let report = MembershipReport::decode(&packet).expect("well-formed report");
                return (report, response_mac, nonce);
            }
        }
    }

    /// collects all membership updates arriving within `duration`
    pub async fn drain_updates(&self, duration: Duration) -> Vec<MembershipReport> {
        let deadline = Instant::now() + duration;
        let mut result = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return result;
            }
            if let Some((AmtMessage::MembershipUpdate { packet, .. }, _)) = self.try_recv_message(remaining).await {
                result.push(MembershipReport::decode(&packet).expect("well-formed report"));
            }
        }
    }
}
