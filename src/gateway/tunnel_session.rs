use crate::amt::amt_messages::{AmtMessage, GatewayAddress, ResponseMac};
use crate::error::GatewayError;
use crate::gateway::gateway_config::GatewayConfig;
use crate::util::backoff::ExponentialBackoff;
use crate::util::random::{Random, RngRandom};
use std::fmt::{Display, Formatter};
use std::io;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Discovering,
    Requesting,
    Active,
    Closed,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Discovering => "DISCOVERING",
            SessionState::Requesting => "REQUESTING",
            SessionState::Active => "ACTIVE",
            SessionState::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// What the engine should do when the session timer fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStep {
    /// send `message` to `to` and fire the session timer again after `next`
    Send { message: AmtMessage, to: SocketAddr, next: Duration },
    /// the session failed, this is terminal
    Fail(GatewayError),
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// the query does not belong to this session
    Rejected,
    /// the query completed the handshake, the session timer should fire after `refresh_after`
    Activated { refresh_after: Duration },
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoFailureOutcome {
    /// nothing to do beyond logging
    Continue,
    /// the session left ACTIVE and needs a new request as soon as possible
    Reestablish,
    Fatal(GatewayError),
}

/// The relay handshake as a pure state machine. It does no I/O and has no timers of its own:
///  the engine feeds it inbound messages, timer expiry and socket errors, and carries out the
///  resulting steps.
///
/// ```text
///   DISCOVERING --advertisement--> REQUESTING --query--> ACTIVE
///        ^                              |                  |
///        +---- requests exhausted ------+   <-- I/O error / unanswered refresh
/// ```
///
/// Any state goes to CLOSED on close or on a terminal failure. While ACTIVE, the session sends a
///  new discovery message every relay rediscovery interval. An advertisement of a different
///  relay moves the session to REQUESTING with that relay, the same relay keeps the tunnel.
pub struct TunnelSession<R: Random = RngRandom> {
    config: Arc<GatewayConfig>,
    state: SessionState,

    relay_addr: Option<SocketAddr>,
    discovery_nonce: Option<u32>,
    request_nonce: Option<u32>,
    response_mac: ResponseMac,
    gateway_address: Option<GatewayAddress>,

    /// discovery messages or requests sent in the current phase
    attempts: u32,
    discovery_backoff: ExponentialBackoff,
    request_backoff: ExponentialBackoff,
    handshake_restarts: u32,
    request_refused: bool,
    consecutive_io_failures: u32,

    /// a refresh request was sent in ACTIVE, and no query has answered it yet
    refresh_pending: bool,
    query_interval: Duration,
    refresh_at: Option<Instant>,
    rediscover_at: Option<Instant>,

    _random: PhantomData<R>,
}

impl <R: Random> TunnelSession<R> {
    pub fn new(config: Arc<GatewayConfig>) -> TunnelSession<R> {
        TunnelSession {
            discovery_backoff: ExponentialBackoff::new(config.discovery_backoff),
            request_backoff: ExponentialBackoff::new(config.request_backoff),
            query_interval: config.default_query_interval,
            config,
            state: SessionState::Discovering,
            relay_addr: None,
            discovery_nonce: None,
            request_nonce: None,
            response_mac: ResponseMac::default(),
            gateway_address: None,
            attempts: 0,
            handshake_restarts: 0,
            request_refused: false,
            consecutive_io_failures: 0,
            refresh_pending: false,
            refresh_at: None,
            rediscover_at: None,
            _random: PhantomData,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The relay's unicast address, once it is known
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_addr
    }

    pub fn handshake_restarts(&self) -> u32 {
        self.handshake_restarts
    }

    pub fn gateway_address(&self) -> Option<GatewayAddress> {
        self.gateway_address
    }

    /// Where and with which credentials a membership update must be sent. Updates can only be
    ///  sent in ACTIVE.
    pub fn update_target(&self) -> Option<(SocketAddr, ResponseMac, u32)> {
        if self.state != SessionState::Active {
            return None;
        }
        match (self.relay_addr, self.request_nonce) {
            (Some(relay_addr), Some(nonce)) => Some((relay_addr, self.response_mac, nonce)),
            _ => None,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("tunnel session {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn enter_discovering(&mut self) {
        self.set_state(SessionState::Discovering);
        self.relay_addr = None;
        self.discovery_nonce = None;
        self.request_nonce = None;
        self.attempts = 0;
        self.discovery_backoff.reset();
    }

    fn enter_requesting(&mut self) {
        self.set_state(SessionState::Requesting);
        self.request_nonce = None;
        self.refresh_pending = false;
        self.attempts = 0;
        self.request_backoff.reset();
    }

    fn fail(&mut self, error: GatewayError) -> SessionStep {
        self.set_state(SessionState::Closed);
        SessionStep::Fail(error)
    }

    fn discovery(&mut self) -> AmtMessage {
        let nonce = R::next_u32();
        self.discovery_nonce = Some(nonce);
        AmtMessage::RelayDiscovery { nonce }
    }

    fn request(&mut self) -> AmtMessage {
        let nonce = R::next_u32();
        self.request_nonce = Some(nonce);
        AmtMessage::Request { nonce, prefer_mld: self.config.prefer_mld }
    }

    /// Called when the session timer fires: (re)transmits discovery messages and requests,
    ///  refreshes an active tunnel and periodically rediscovers its relay.
    pub fn on_timer(&mut self) -> SessionStep {
        match self.state {
            SessionState::Discovering => {
                if self.attempts >= self.config.max_discovery_attempts {
                    return self.fail(GatewayError::DiscoveryFailed { attempts: self.attempts });
                }
                self.attempts += 1;

                debug!("sending relay discovery #{} to {}", self.attempts, self.config.relay_discovery_addr);
                SessionStep::Send {
                    message: self.discovery(),
                    to: self.config.relay_discovery_addr,
                    next: self.discovery_backoff.next_delay(),
                }
            }
            SessionState::Requesting => {
                let relay_addr = match self.relay_addr {
                    Some(a) if self.attempts < self.config.max_request_attempts && !self.request_refused => a,
                    _ => return self.on_handshake_failure(),
                };
                self.attempts += 1;

                debug!("sending request #{} to relay {}", self.attempts, relay_addr);
                SessionStep::Send {
                    message: self.request(),
                    to: relay_addr,
                    next: self.request_backoff.next_delay(),
                }
            }
            SessionState::Active => {
                let Some(relay_addr) = self.relay_addr else {
                    self.enter_discovering();
                    return self.on_timer();
                };

                let now = Instant::now();
                if self.rediscover_at.is_some_and(|t| t <= now) {
                    let rediscover_at = now + self.config.relay_rediscovery_interval;
                    self.rediscover_at = Some(rediscover_at);
                    let refresh_at = self.refresh_at.unwrap_or(now).min(rediscover_at);
                    debug!("rediscovering relay while the tunnel to {} is active", relay_addr);
                    return SessionStep::Send {
                        message: self.discovery(),
                        to: self.config.relay_discovery_addr,
                        next: refresh_at.saturating_duration_since(now),
                    };
                }

                if self.refresh_pending {
                    debug!("relay {} did not answer the last refresh request", relay_addr);
                    self.enter_requesting();
                    return self.on_timer();
                }

                self.refresh_pending = true;
                let refresh_at = now + self.query_interval;
                self.refresh_at = Some(refresh_at);
                let next_at = match self.rediscover_at {
                    Some(rediscover_at) => refresh_at.min(rediscover_at),
                    None => refresh_at,
                };
                debug!("refreshing tunnel to relay {}", relay_addr);
                SessionStep::Send {
                    message: self.request(),
                    to: relay_addr,
                    next: next_at.saturating_duration_since(now),
                }
            }
            SessionState::Closed => SessionStep::Idle,
        }
    }

    fn on_handshake_failure(&mut self) -> SessionStep {
        self.handshake_restarts += 1;
        if self.handshake_restarts > self.config.max_handshake_restarts {
            let restarts = self.handshake_restarts - 1;
            return if self.request_refused {
                self.fail(GatewayError::RequestRejected { restarts })
            }
            else {
                self.fail(GatewayError::RequestTimeout { restarts })
            };
        }

        info!("relay {:?} did not complete the handshake - falling back to relay discovery", self.relay_addr);
        self.request_refused = false;
        self.enter_discovering();
        self.on_timer()
    }

    /// Returns `true` if the advertisement answers the current discovery message and a request
    ///  to the advertised relay is needed. The request is sent when the session timer fires next,
    ///  which the caller should schedule right away.
    ///
    /// In ACTIVE, an advertisement of the current relay keeps the tunnel as it is. An
    ///  advertisement of a different relay moves the session to REQUESTING with the new relay.
    pub fn on_advertisement(&mut self, nonce: u32, relay_address: IpAddr) -> bool {
        if !matches!(self.state, SessionState::Discovering | SessionState::Active) {
            debug!("relay advertisement in state {} - ignoring", self.state);
            return false;
        }
        if self.discovery_nonce != Some(nonce) {
            debug!("relay advertisement with stale nonce {:08x} - ignoring", nonce);
            return false;
        }
        if relay_address.is_ipv4() != self.config.relay_discovery_addr.is_ipv4() {
            debug!("relay advertisement for {} does not match the local address family - ignoring", relay_address);
            return false;
        }

        self.discovery_nonce = None;
        let relay_addr = SocketAddr::new(relay_address, self.config.relay_port);
        if self.state == SessionState::Active {
            if self.relay_addr == Some(relay_addr) {
                debug!("rediscovered the current relay {}", relay_addr);
                return false;
            }
            info!("relay changed from {:?} to {} - moving the tunnel", self.relay_addr, relay_addr);
        }
        else {
            info!("discovered relay {}", relay_addr);
        }

        self.relay_addr = Some(relay_addr);
        self.enter_requesting();
        true
    }

    /// Checks a membership query against the handshake state and picks up the relay's
    ///  credentials from it
    pub fn on_query(&mut self, from: SocketAddr, nonce: u32, response_mac: ResponseMac, gateway_address: Option<GatewayAddress>, query_interval: Option<Duration>) -> QueryOutcome {
        if !matches!(self.state, SessionState::Requesting | SessionState::Active) {
            debug!("membership query in state {} - ignoring", self.state);
            return QueryOutcome::Rejected;
        }
        if self.relay_addr != Some(from) {
            debug!("membership query from {} which is not the relay {:?} - ignoring", from, self.relay_addr);
            return QueryOutcome::Rejected;
        }
        if self.request_nonce != Some(nonce) {
            debug!("membership query with stale nonce {:08x} - ignoring", nonce);
            return QueryOutcome::Rejected;
        }

        self.response_mac = response_mac;
        if gateway_address.is_some() {
            self.gateway_address = gateway_address;
        }
        self.query_interval = query_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(self.config.default_query_interval);
        self.refresh_pending = false;

        if self.state == SessionState::Requesting {
            let now = Instant::now();
            self.refresh_at = Some(now + self.query_interval);
            self.rediscover_at = Some(now + self.config.relay_rediscovery_interval);
            self.set_state(SessionState::Active);
            self.handshake_restarts = 0;
            self.request_refused = false;
            self.consecutive_io_failures = 0;
            QueryOutcome::Activated { refresh_after: self.query_interval.min(self.config.relay_rediscovery_interval) }
        }
        else {
            QueryOutcome::Accepted
        }
    }

    pub fn on_io_success(&mut self) {
        self.consecutive_io_failures = 0;
    }

    pub fn on_io_error(&mut self, error: &io::Error) -> IoFailureOutcome {
        if self.state == SessionState::Closed {
            return IoFailureOutcome::Continue;
        }

        self.consecutive_io_failures += 1;
        if self.consecutive_io_failures >= self.config.max_consecutive_io_failures {
            self.set_state(SessionState::Closed);
            return IoFailureOutcome::Fatal(GatewayError::SocketIo { kind: error.kind(), message: error.to_string() });
        }

        match self.state {
            SessionState::Active => {
                self.enter_requesting();
                IoFailureOutcome::Reestablish
            }
            SessionState::Requesting if error.kind() == io::ErrorKind::ConnectionRefused => {
                self.request_refused = true;
                IoFailureOutcome::Continue
            }
            _ => IoFailureOutcome::Continue,
        }
    }

    /// Moves the session to CLOSED, returning a teardown message if the relay should be told
    pub fn close(&mut self) -> Option<(AmtMessage, SocketAddr)> {
        let teardown = match (self.state, self.relay_addr, self.request_nonce, self.gateway_address) {
            (SessionState::Active, Some(relay_addr), Some(nonce), Some(gateway)) => Some((
                AmtMessage::Teardown { response_mac: self.response_mac, nonce, gateway },
                relay_addr,
            )),
            _ => None,
        };
        self.set_state(SessionState::Closed);
        teardown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::util::backoff::BackoffConfig;
    use tokio::time::advance;

    const RELAY: &str = "192.0.2.7";

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::new("192.0.2.1:2268".parse().unwrap());
        config.discovery_backoff = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(4));
        config.max_discovery_attempts = 3;
        config.request_backoff = BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(2));
        config.max_request_attempts = 2;
        config.max_handshake_restarts = 1;
        config.max_consecutive_io_failures = 3;
        config.default_query_interval = Duration::from_secs(60);
        config
    }

    fn session(config: GatewayConfig) -> TunnelSession {
        TunnelSession::new(Arc::new(config))
    }

    fn relay_addr() -> SocketAddr {
        SocketAddr::new(RELAY.parse().unwrap(), 2268)
    }

    fn sent(step: SessionStep) -> (AmtMessage, SocketAddr, Duration) {
        match step {
            SessionStep::Send { message, to, next } => (message, to, next),
            other => panic!("expected a message to send, got {:?}", other),
        }
    }

    /// runs discovery, returning the session in REQUESTING
    fn discovered(session: &mut TunnelSession) {
        let (message, _, _) = sent(session.on_timer());
        let AmtMessage::RelayDiscovery { nonce } = message else { panic!() };
        assert!(session.on_advertisement(nonce, RELAY.parse().unwrap()));
        assert_eq!(session.state(), SessionState::Requesting);
    }

    /// sends a request and answers it, returning the request nonce
    fn activated(session: &mut TunnelSession) -> u32 {
        discovered(session);
        let (message, _, _) = sent(session.on_timer());
        let AmtMessage::Request { nonce, .. } = message else { panic!() };
        assert_eq!(
            session.on_query(relay_addr(), nonce, ResponseMac([1, 2, 3, 4, 5, 6]), None, None),
            QueryOutcome::Activated { refresh_after: Duration::from_secs(60) }
        );
        nonce
    }

    #[test]
    fn test_discovery_retransmission_and_failure() {
        let mut session = session(config());
        assert_eq!(session.state(), SessionState::Discovering);

        let mut nonces = Vec::new();
        for expected_next in [1, 2, 4] {
            let (message, to, next) = sent(session.on_timer());
            let AmtMessage::RelayDiscovery { nonce } = message else { panic!() };
            nonces.push(nonce);
            assert_eq!(to, "192.0.2.1:2268".parse().unwrap());
            assert_eq!(next, Duration::from_secs(expected_next));
        }
        assert_eq!(session.on_timer(), SessionStep::Fail(GatewayError::DiscoveryFailed { attempts: 3 }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.on_timer(), SessionStep::Idle);
    }

    #[test]
    fn test_advertisement_with_stale_nonce() {
        let mut session = session(config());
        let (message, _, _) = sent(session.on_timer());
        let AmtMessage::RelayDiscovery { nonce } = message else { panic!() };

        assert!(!session.on_advertisement(nonce.wrapping_add(1), RELAY.parse().unwrap()));
        assert!(!session.on_advertisement(nonce, "2001:db8::1".parse().unwrap()));
        assert_eq!(session.state(), SessionState::Discovering);

        assert!(session.on_advertisement(nonce, RELAY.parse().unwrap()));
        assert_eq!(session.relay_addr(), Some(relay_addr()));
        // duplicate
        assert!(!session.on_advertisement(nonce, RELAY.parse().unwrap()));
    }

    #[test]
    fn test_handshake() {
        let mut config = config();
        config.prefer_mld = true;
        let mut session = session(config);
        discovered(&mut session);

        let (message, to, next) = sent(session.on_timer());
        let AmtMessage::Request { nonce, prefer_mld } = message else { panic!() };
        assert!(prefer_mld);
        assert_eq!(to, relay_addr());
        assert_eq!(next, Duration::from_secs(1));
        assert_eq!(session.update_target(), None);

        // wrong sender, wrong nonce
        assert_eq!(session.on_query("192.0.2.8:2268".parse().unwrap(), nonce, ResponseMac::default(), None, None), QueryOutcome::Rejected);
        assert_eq!(session.on_query(relay_addr(), nonce ^ 1, ResponseMac::default(), None, None), QueryOutcome::Rejected);

        let mac = ResponseMac([1, 2, 3, 4, 5, 6]);
        assert_eq!(
            session.on_query(relay_addr(), nonce, mac, None, Some(Duration::from_secs(30))),
            QueryOutcome::Activated { refresh_after: Duration::from_secs(30) }
        );
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.update_target(), Some((relay_addr(), mac, nonce)));

        assert_eq!(session.on_query(relay_addr(), nonce, mac, None, None), QueryOutcome::Accepted);
    }

    #[test]
    fn test_request_exhaustion_falls_back_to_discovery() {
        let mut session = session(config());
        discovered(&mut session);

        sent(session.on_timer());
        sent(session.on_timer());
        let (message, to, _) = sent(session.on_timer());
        assert!(matches!(message, AmtMessage::RelayDiscovery { .. }));
        assert_eq!(to, "192.0.2.1:2268".parse().unwrap());
        assert_eq!(session.state(), SessionState::Discovering);
        assert_eq!(session.handshake_restarts(), 1);

        discovered(&mut session);
        sent(session.on_timer());
        sent(session.on_timer());
        assert_eq!(session.on_timer(), SessionStep::Fail(GatewayError::RequestTimeout { restarts: 1 }));
    }

    #[test]
    fn test_refused_request() {
        let mut session = session(config());
        discovered(&mut session);
        sent(session.on_timer());

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(session.on_io_error(&refused), IoFailureOutcome::Continue);
        session.on_io_success();

        // the request phase is over right away
        let (message, _, _) = sent(session.on_timer());
        assert!(matches!(message, AmtMessage::RelayDiscovery { .. }));

        discovered(&mut session);
        sent(session.on_timer());
        assert_eq!(session.on_io_error(&refused), IoFailureOutcome::Continue);
        assert_eq!(session.on_timer(), SessionStep::Fail(GatewayError::RequestRejected { restarts: 1 }));
    }

    #[test]
    fn test_refresh() {
        let mut session = session(config());
        let first_nonce = activated(&mut session);

        let (message, to, next) = sent(session.on_timer());
        let AmtMessage::Request { nonce, .. } = message else { panic!() };
        assert_ne!(nonce, first_nonce);
        assert_eq!(to, relay_addr());
        assert_eq!(next, Duration::from_secs(60));
        assert_eq!(session.state(), SessionState::Active);

        assert_eq!(session.on_query(relay_addr(), nonce, ResponseMac::default(), None, None), QueryOutcome::Accepted);
        sent(session.on_timer());
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_unanswered_refresh_returns_to_requesting() {
        let mut session = session(config());
        activated(&mut session);

        sent(session.on_timer());
        let (message, _, next) = sent(session.on_timer());
        assert!(matches!(message, AmtMessage::Request { .. }));
        assert_eq!(next, Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Requesting);
        assert_eq!(session.update_target(), None);
    }

    fn rediscovery_config() -> GatewayConfig {
        let mut config = config();
        config.relay_rediscovery_interval = Duration::from_secs(150);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_of_the_current_relay() {
        let mut session = session(rediscovery_config());
        activated(&mut session);

        let refresh = |session: &mut TunnelSession| {
            let (message, to, next) = sent(session.on_timer());
            let AmtMessage::Request { nonce, .. } = message else { panic!() };
            assert_eq!(to, relay_addr());
            assert_eq!(session.on_query(relay_addr(), nonce, ResponseMac::default(), None, None), QueryOutcome::Accepted);
            next
        };

        advance(Duration::from_secs(60)).await;
        assert_eq!(refresh(&mut session), Duration::from_secs(60));
        advance(Duration::from_secs(60)).await;
        assert_eq!(refresh(&mut session), Duration::from_secs(30));

        advance(Duration::from_secs(30)).await;
        let (message, to, next) = sent(session.on_timer());
        let AmtMessage::RelayDiscovery { nonce } = message else { panic!() };
        assert_eq!(to, "192.0.2.1:2268".parse().unwrap());
        assert_eq!(next, Duration::from_secs(30));
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.update_target().is_some());

        assert!(!session.on_advertisement(nonce, RELAY.parse().unwrap()));
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.relay_addr(), Some(relay_addr()));

        advance(Duration::from_secs(30)).await;
        assert_eq!(refresh(&mut session), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_moves_tunnel_to_new_relay() {
        let mut session = session(rediscovery_config());
        activated(&mut session);

        advance(Duration::from_secs(150)).await;
        let (message, _, _) = sent(session.on_timer());
        let AmtMessage::RelayDiscovery { nonce } = message else { panic!() };

        let new_relay: SocketAddr = "192.0.2.9:2268".parse().unwrap();
        assert!(!session.on_advertisement(nonce ^ 1, new_relay.ip()));
        assert_eq!(session.state(), SessionState::Active);

        assert!(session.on_advertisement(nonce, new_relay.ip()));
        assert_eq!(session.state(), SessionState::Requesting);
        assert_eq!(session.relay_addr(), Some(new_relay));
        assert_eq!(session.update_target(), None);
        // duplicate
        assert!(!session.on_advertisement(nonce, new_relay.ip()));

        let (message, to, _) = sent(session.on_timer());
        let AmtMessage::Request { nonce, .. } = message else { panic!() };
        assert_eq!(to, new_relay);
        assert_eq!(session.on_query(relay_addr(), nonce, ResponseMac::default(), None, None), QueryOutcome::Rejected);
        assert!(matches!(session.on_query(new_relay, nonce, ResponseMac::default(), None, None), QueryOutcome::Activated { .. }));
    }

    #[test]
    fn test_activation_waits_at_most_the_rediscovery_interval() {
        let mut config = config();
        config.relay_rediscovery_interval = Duration::from_secs(20);
        let mut session = session(config);
        discovered(&mut session);

        let (message, _, _) = sent(session.on_timer());
        let AmtMessage::Request { nonce, .. } = message else { panic!() };
        assert_eq!(
            session.on_query(relay_addr(), nonce, ResponseMac::default(), None, None),
            QueryOutcome::Activated { refresh_after: Duration::from_secs(20) }
        );
    }

    #[rstest]
    #[case::timed_out(io::ErrorKind::TimedOut)]
    #[case::refused(io::ErrorKind::ConnectionRefused)]
    fn test_io_error_in_active(#[case] kind: io::ErrorKind) {
        let mut session = session(config());
        activated(&mut session);

        assert_eq!(session.on_io_error(&io::Error::from(kind)), IoFailureOutcome::Reestablish);
        assert_eq!(session.state(), SessionState::Requesting);
    }

    #[test]
    fn test_consecutive_io_failures_are_fatal() {
        let mut session = session(config());
        let error = io::Error::from(io::ErrorKind::TimedOut);

        assert_eq!(session.on_io_error(&error), IoFailureOutcome::Continue);
        session.on_io_success();
        assert_eq!(session.on_io_error(&error), IoFailureOutcome::Continue);
        assert_eq!(session.on_io_error(&error), IoFailureOutcome::Continue);
        assert!(matches!(session.on_io_error(&error), IoFailureOutcome::Fatal(GatewayError::SocketIo { kind: io::ErrorKind::TimedOut, .. })));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_sends_teardown_only_with_gateway_address() {
        let mut session = session(config());
        activated(&mut session);
        assert_eq!(session.close(), None);

        let mut session = self::session(config());
        discovered(&mut session);
        let (message, _, _) = sent(session.on_timer());
        let AmtMessage::Request { nonce, .. } = message else { panic!() };
        let mac = ResponseMac([9; 6]);
        let gateway = GatewayAddress { port: 40000, address: "198.51.100.3".parse().unwrap() };
        session.on_query(relay_addr(), nonce, mac, Some(gateway), None);

        assert_eq!(session.close(), Some((AmtMessage::Teardown { response_mac: mac, nonce, gateway }, relay_addr())));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close(), None);
    }
}
