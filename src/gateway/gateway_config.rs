use crate::amt::AMT_PORT;
use crate::packet::membership::MAX_REPORT_PAYLOAD;
use crate::util::backoff::BackoffConfig;
use anyhow::bail;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

pub struct GatewayConfig {
    /// The address to which relay discovery messages are sent. This is typically an anycast
    ///  address shared by a set of relays, with [AMT_PORT] as the port.
    pub relay_discovery_addr: SocketAddr,

    /// The port on the relay's unicast address (as announced in the advertisement) to which
    ///  requests and updates are sent
    pub relay_port: u16,

    /// The local address the gateway's socket is bound to. Port 0 lets the OS choose a port.
    pub local_addr: SocketAddr,

    pub discovery_backoff: BackoffConfig,
    /// Relay discovery fails after this many unanswered discovery messages
    pub max_discovery_attempts: u32,

    pub request_backoff: BackoffConfig,
    /// After this many unanswered requests, the gateway falls back to relay discovery
    pub max_request_attempts: u32,
    /// The number of times the handshake may fall back from request to discovery before
    ///  the session fails
    pub max_handshake_restarts: u32,

    /// Upper bound for the randomized delay of query responses. Queries may request a shorter
    ///  window, in which case that is used.
    pub max_response_delay: Duration,

    /// Delay before an unsolicited report of a local filter change is sent. This is a short
    ///  fixed delay, allowing several changes in quick succession to be combined into a single
    ///  report.
    pub state_change_report_delay: Duration,
    /// Interval between retransmissions of unsolicited state change reports
    pub unsolicited_report_interval: Duration,
    /// Number of transmissions of each state change report
    pub robustness: u8,

    /// The interval for refreshing the tunnel with a new request if the relay's queries do not
    ///  specify one
    pub default_query_interval: Duration,

    /// While a tunnel is active, the gateway sends a new discovery message at this interval. If
    ///  the advertisement names a different relay, the gateway moves its tunnel to that relay.
    pub relay_rediscovery_interval: Duration,

    /// Number of consecutive socket errors after which the session fails
    pub max_consecutive_io_failures: u32,

    /// Ask the relay for MLD rather than IGMP queries
    pub prefer_mld: bool,

    /// Verify the UDP checksum of decapsulated multicast datagrams. Relays are expected to
    ///  forward intact packets, so this is off by default.
    pub verify_udp_checksums: bool,

    /// Source addresses written into encapsulated membership reports
    pub report_source_v4: Ipv4Addr,
    pub report_source_v6: Ipv6Addr,

    /// Upper bound for the size of the IGMP / MLD part of a single report. Reports exceeding
    ///  this are split. Must not exceed [MAX_REPORT_PAYLOAD].
    pub max_report_payload: usize,

    /// Capacity of the channels that decapsulated datagrams are delivered to
    pub subscriber_channel_capacity: usize,
}

impl GatewayConfig {
    pub fn new(relay_discovery_addr: SocketAddr) -> GatewayConfig {
        let local_ip = if relay_discovery_addr.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };

        GatewayConfig {
            relay_discovery_addr,
            relay_port: AMT_PORT,
            local_addr: SocketAddr::new(local_ip, 0),
            discovery_backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(16)),
            max_discovery_attempts: 6,
            request_backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(8)),
            max_request_attempts: 4,
            max_handshake_restarts: 3,
            max_response_delay: Duration::from_secs(10),
            state_change_report_delay: Duration::from_millis(50),
            unsolicited_report_interval: Duration::from_secs(1),
            robustness: 2,
            default_query_interval: Duration::from_secs(125),
            relay_rediscovery_interval: Duration::from_secs(24 * 60 * 60),
            max_consecutive_io_failures: 5,
            prefer_mld: false,
            verify_udp_checksums: false,
            report_source_v4: Ipv4Addr::UNSPECIFIED,
            report_source_v6: Ipv6Addr::UNSPECIFIED,
            max_report_payload: 1400,
            subscriber_channel_capacity: 1024,
        }
    }

    pub fn report_source(&self, ipv4: bool) -> IpAddr {
        if ipv4 {
            IpAddr::V4(self.report_source_v4)
        }
        else {
            IpAddr::V6(self.report_source_v6)
        }
    }

    /// The window from which a query's response delay is drawn
    pub fn response_window(&self, query_max_response_delay: Duration) -> Duration {
        if query_max_response_delay.is_zero() {
            self.max_response_delay
        }
        else {
            query_max_response_delay.min(self.max_response_delay)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.discovery_backoff.validate()?;
        self.request_backoff.validate()?;

        if self.max_discovery_attempts == 0 {
            bail!("max_discovery_attempts must be at least 1");
        }
        if self.max_request_attempts == 0 {
            bail!("max_request_attempts must be at least 1");
        }
        if self.robustness == 0 {
            bail!("robustness must be at least 1");
        }
        if self.default_query_interval.is_zero() {
            bail!("default_query_interval must not be zero");
        }
        if self.relay_rediscovery_interval.is_zero() {
            bail!("relay_rediscovery_interval must not be zero");
        }
        if self.max_report_payload < 100 {
            bail!("max_report_payload is too small");
        }
        if self.max_report_payload > MAX_REPORT_PAYLOAD {
            bail!("max_report_payload must be at most {}", MAX_REPORT_PAYLOAD);
        }
        if self.subscriber_channel_capacity == 0 {
            bail!("subscriber_channel_capacity must not be zero");
        }
        if self.relay_discovery_addr.is_ipv4() != self.local_addr.is_ipv4() {
            bail!("relay discovery address {} and local address {} have different address families", self.relay_discovery_addr, self.local_addr);
        }
        Ok(())
    }
}
