use crate::amt::amt_messages::AmtMessage;
use crate::error::GatewayError;
use crate::gateway::datagram_sink::DatagramSink;
use crate::gateway::gateway_config::GatewayConfig;
use crate::gateway::stats::GatewayStats;
use crate::gateway::tunnel_session::{IoFailureOutcome, QueryOutcome, SessionState, SessionStep, TunnelSession};
use crate::membership::interface_manager::{InterfaceMembershipManager, ReportSender};
use crate::packet::membership::{MembershipQuery, MembershipReport};
use crate::packet::udp::decapsulate;
use crate::timer::reschedulable_task::{ReschedulableTimerTask, TimerAction};
use crate::timer::timer_service::TimerService;
use crate::util::random::{Random, RngRandom};
use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

/// large enough for any AMT message carrying a maximum size IPv4 or IPv6 packet
const RECEIVE_BUFFER_SIZE: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Running,
    Closed,
    Failed(GatewayError),
}

/// The gateway side of an AMT tunnel: owns the socket to the relay, drives the relay handshake,
///  and dispatches inbound messages.
///
/// The receive loop ([GatewayProtocolEngine::run]) only reads from the socket. Everything that
///  is written to the socket is written from the session timer, from report timers or from
///  API calls, so a slow send never holds up reception.
pub struct GatewayProtocolEngine<R: Random = RngRandom> {
    inner: Arc<EngineInner<R>>,
}

impl <R: Random> Clone for GatewayProtocolEngine<R> {
    fn clone(&self) -> Self {
        GatewayProtocolEngine { inner: self.inner.clone() }
    }
}

struct EngineInner<R: Random> {
    config: Arc<GatewayConfig>,
    socket: UdpSocket,
    session: Mutex<TunnelSession<R>>,
    session_timer: ReschedulableTimerTask,
    membership: InterfaceMembershipManager<R>,
    sink: Arc<dyn DatagramSink>,
    stats: GatewayStats,
    status: watch::Sender<EngineStatus>,
}

impl GatewayProtocolEngine<RngRandom> {
    pub async fn bind(config: GatewayConfig, timer_service: TimerService, sink: Arc<dyn DatagramSink>) -> anyhow::Result<GatewayProtocolEngine> {
        Self::bind_with_random(config, timer_service, sink).await
    }
}

impl <R: Random> GatewayProtocolEngine<R> {
    pub async fn bind_with_random(config: GatewayConfig, timer_service: TimerService, sink: Arc<dyn DatagramSink>) -> anyhow::Result<GatewayProtocolEngine<R>> {
        config.validate()?;

        let socket = UdpSocket::bind(config.local_addr).await?;
        info!("bound gateway socket to {:?}", socket.local_addr()?);

        let config = Arc::new(config);
        let inner = Arc::new_cyclic(|engine: &Weak<EngineInner<R>>| {
            let report_sender = Arc::new(EngineReportSender { engine: engine.clone() });
            EngineInner {
                session: Mutex::new(TunnelSession::new(config.clone())),
                session_timer: ReschedulableTimerTask::new(
                    &timer_service,
                    "amt session",
                    Arc::new(SessionTimerAction { engine: engine.clone() }),
                ),
                membership: InterfaceMembershipManager::new_with_random(config.clone(), timer_service.clone(), report_sender),
                config,
                socket,
                sink,
                stats: GatewayStats::default(),
                status: watch::Sender::new(EngineStatus::Running),
            }
        });
        Ok(GatewayProtocolEngine { inner })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn membership(&self) -> &InterfaceMembershipManager<R> {
        &self.inner.membership
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_session().state()
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.inner.stats
    }

    pub fn status(&self) -> EngineStatus {
        self.inner.status.borrow().clone()
    }

    /// Waits until the engine is closed or has failed. A failure is reported exactly once per
    ///  caller, as the error of this call.
    pub async fn wait(&self) -> Result<(), GatewayError> {
        let mut status = self.inner.status.subscribe();
        let terminal = match status.wait_for(|s| *s != EngineStatus::Running).await {
            Ok(s) => s.clone(),
            Err(_) => EngineStatus::Closed,
        };
        match terminal {
            EngineStatus::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Starts relay discovery and runs the receive loop until the engine is closed or fails
    pub async fn run(&self) -> Result<(), GatewayError> {
        let local_addr = self.inner.socket.local_addr()?;
        let span = span!(Level::INFO, "amt_gateway", %local_addr);
        self.inner.recv_loop().instrument(span).await
    }

    /// Closes the session: cancels all timers synchronously, sends a teardown to the relay if
    ///  the tunnel is active, and stops the receive loop
    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl <R: Random> EngineInner<R> {
    fn lock_session(&self) -> MutexGuard<'_, TunnelSession<R>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        *self.status.borrow() == EngineStatus::Running
    }

    async fn recv_loop(&self) -> Result<(), GatewayError> {
        info!("starting receive loop");
        self.session_timer.schedule(Duration::ZERO);

        let mut status = self.status.subscribe();
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            self.lock_session().on_io_success();
                            self.on_datagram(&buf[..len], from).await;
                        }
                        Err(e) => self.on_io_error(&e).await,
                    }
                }
                _ = async { let _ = status.wait_for(|s| *s != EngineStatus::Running).await; } => break,
            }
        }

        info!("receive loop terminated");
        match &*self.status.borrow() {
            EngineStatus::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    async fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        let message = match AmtMessage::try_deser(buf) {
            Ok(m) => m,
            Err(e) => {
                debug!("malformed datagram from {:?}: {} - dropping", from, e);
                self.stats.on_malformed_message();
                return;
            }
        };
        trace!("received {:?} from {:?}", message.message_type(), from);

        match message {
            AmtMessage::RelayAdvertisement { nonce, relay_address } => {
                let (accepted, left_active) = {
                    let mut session = self.lock_session();
                    let was_active = session.state() == SessionState::Active;
                    let accepted = session.on_advertisement(nonce, relay_address);
                    (accepted, was_active && session.state() != SessionState::Active)
                };
                if left_active {
                    self.membership.cancel_pending_reports().await;
                }
                if accepted {
                    self.session_timer.schedule(Duration::ZERO);
                }
            }
            AmtMessage::MembershipQuery { response_mac, nonce, packet, gateway, .. } => {
                let query = match MembershipQuery::decode(&packet) {
                    Ok(q) => q,
                    Err(e) => {
                        debug!("membership query with malformed encapsulated query from {:?}: {} - dropping", from, e);
                        self.stats.on_malformed_message();
                        return;
                    }
                };

                let outcome = self.lock_session().on_query(from, nonce, response_mac, gateway, query.query_interval);
                match outcome {
                    QueryOutcome::Rejected => return,
                    QueryOutcome::Activated { refresh_after } => {
                        info!("tunnel to relay {:?} is active", from);
                        self.session_timer.schedule(refresh_after);
                    }
                    QueryOutcome::Accepted => {}
                }
                debug!("membership query from relay: {:?}", query);
                self.membership.handle_query(&query).await;
            }
            AmtMessage::MulticastData { packet } => {
                let (state, relay_addr) = {
                    let session = self.lock_session();
                    (session.state(), session.relay_addr())
                };
                if state != SessionState::Active || relay_addr != Some(from) {
                    debug!("multicast data from {:?} in state {} - dropping", from, state);
                    return;
                }

                match decapsulate(&packet, self.config.verify_udp_checksums) {
                    Ok(datagram) => {
                        trace!("decapsulated {:?}", datagram);
                        if self.sink.on_datagram(datagram).await {
                            self.stats.on_datagram_delivered();
                        }
                        else {
                            self.stats.on_datagram_dropped();
                        }
                    }
                    Err(e) => {
                        debug!("malformed multicast data from {:?}: {} - dropping", from, e);
                        self.stats.on_malformed_message();
                    }
                }
            }
            other => {
                debug!("unexpected {:?} message from {:?} - dropping", other.message_type(), from);
            }
        }
    }

    async fn send_message(&self, message: &AmtMessage, to: SocketAddr) -> io::Result<()> {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        trace!("sending {:?} to {:?}", message.message_type(), to);
        self.socket.send_to(&buf, to).await?;
        self.lock_session().on_io_success();
        Ok(())
    }

    async fn on_io_error(&self, e: &io::Error) {
        let outcome = self.lock_session().on_io_error(e);
        match outcome {
            IoFailureOutcome::Continue => warn!("socket error: {}", e),
            IoFailureOutcome::Reestablish => {
                warn!("socket error on active tunnel: {} - re-establishing", e);
                self.membership.cancel_pending_reports().await;
                self.session_timer.schedule(Duration::ZERO);
            }
            IoFailureOutcome::Fatal(e) => self.fail(e).await,
        }
    }

    async fn on_session_timer(&self) -> Option<Duration> {
        let (step, restarts_before, restarts_after, left_active) = {
            let mut session = self.lock_session();
            let restarts_before = session.handshake_restarts();
            let was_active = session.state() == SessionState::Active;
            let step = session.on_timer();
            (step, restarts_before, session.handshake_restarts(), was_active && session.state() != SessionState::Active)
        };
        if restarts_after > restarts_before {
            self.stats.on_handshake_restart();
        }
        if left_active {
            self.membership.cancel_pending_reports().await;
        }

        match step {
            SessionStep::Send { message, to, next } => {
                if let Err(e) = self.send_message(&message, to).await {
                    self.on_io_error(&e).await;
                }
                Some(next)
            }
            SessionStep::Fail(e) => {
                self.fail(e).await;
                None
            }
            SessionStep::Idle => None,
        }
    }

    /// Sends a membership update to the relay. Socket errors are handled in a separate task, since
    ///  handling them cancels the report timer that is calling this.
    async fn send_report(self: &Arc<Self>, report: MembershipReport) -> Result<(), GatewayError> {
        let Some((relay_addr, response_mac, nonce)) = self.lock_session().update_target() else {
            return Err(GatewayError::NotConnected);
        };
        let Some(first) = report.records.first() else {
            return Ok(());
        };

        let packet = report.encode(self.config.report_source(first.group.is_ipv4()))?;
        let message = AmtMessage::MembershipUpdate { response_mac, nonce, packet: packet.freeze() };
        match self.send_message(&message, relay_addr).await {
            Ok(()) => {
                self.stats.on_report_sent();
                Ok(())
            }
            Err(e) => {
                let result = GatewayError::SocketIo { kind: e.kind(), message: e.to_string() };
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.on_io_error(&e).await;
                });
                Err(result)
            }
        }
    }

    async fn fail(&self, e: GatewayError) {
        error!("tunnel session failed: {}", e);
        self.lock_session().close();
        self.session_timer.cancel();
        self.membership.shutdown().await;
        self.status.send_if_modified(|status| {
            if *status == EngineStatus::Running {
                *status = EngineStatus::Failed(e);
                true
            }
            else {
                false
            }
        });
    }

    async fn close(&self) {
        if !self.is_running() {
            return;
        }
        info!("closing gateway");

        let teardown = self.lock_session().close();
        self.session_timer.cancel();
        self.membership.shutdown().await;

        if let Some((message, to)) = teardown {
            if let Err(e) = self.send_message(&message, to).await {
                debug!("error sending teardown to relay {:?}: {}", to, e);
            }
        }
        self.status.send_if_modified(|status| {
            if *status == EngineStatus::Running {
                *status = EngineStatus::Closed;
                true
            }
            else {
                false
            }
        });
    }
}

/// Fires discovery and request retransmissions and tunnel refreshes
struct SessionTimerAction<R: Random> {
    engine: Weak<EngineInner<R>>,
}

#[async_trait]
impl <R: Random> TimerAction for SessionTimerAction<R> {
    async fn on_timer(&self) -> Option<Duration> {
        match self.engine.upgrade() {
            Some(engine) => engine.on_session_timer().await,
            None => None,
        }
    }
}

/// The membership manager's path to the relay socket
struct EngineReportSender<R: Random> {
    engine: Weak<EngineInner<R>>,
}

#[async_trait]
impl <R: Random> ReportSender for EngineReportSender<R> {
    async fn send_report(&self, report: MembershipReport) -> Result<(), GatewayError> {
        match self.engine.upgrade() {
            Some(engine) => engine.send_report(report).await,
            None => Err(GatewayError::Closed),
        }
    }
}
