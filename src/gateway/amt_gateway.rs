use crate::error::GatewayError;
use crate::gateway::gateway_config::GatewayConfig;
use crate::gateway::protocol_engine::GatewayProtocolEngine;
use crate::gateway::stats::GatewayStatsSnapshot;
use crate::gateway::tunnel_session::SessionState;
use crate::membership::channel_manager::{Channel, ChannelMembershipManager, SubscriptionId};
use crate::membership::source_filter::SourceFilter;
use crate::packet::udp::UdpDatagram;
use crate::timer::timer_service::TimerService;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// The application's handle on an AMT gateway: a tunnel to a relay, group membership, and
///  channels of received multicast datagrams.
///
/// ```ignore
/// let gateway = AmtGateway::start(GatewayConfig::new(relay_discovery_addr)).await?;
/// let (_, mut datagrams) = gateway.subscribe(Channel::source_specific(group, source)).await?;
/// while let Some(datagram) = datagrams.recv().await {
///     // ...
/// }
/// ```
pub struct AmtGateway {
    engine: GatewayProtocolEngine,
    channels: Arc<ChannelMembershipManager>,
    timer_service: TimerService,
    recv_loop: JoinHandle<Result<(), GatewayError>>,
    dispatcher: JoinHandle<()>,
}

impl AmtGateway {
    /// Binds the gateway socket and starts relay discovery. Must be called in the context of a
    ///  tokio runtime.
    pub async fn start(config: GatewayConfig) -> anyhow::Result<AmtGateway> {
        let channel_capacity = config.subscriber_channel_capacity;
        let timer_service = TimerService::for_current_runtime();

        let (sender, mut receiver) = mpsc::channel::<UdpDatagram>(channel_capacity);
        let engine = GatewayProtocolEngine::bind(config, timer_service.clone(), Arc::new(sender)).await?;
        let channels = Arc::new(ChannelMembershipManager::new(engine.membership().clone(), channel_capacity));

        let dispatcher = {
            let channels = channels.clone();
            tokio::spawn(async move {
                while let Some(datagram) = receiver.recv().await {
                    channels.dispatch(datagram).await;
                }
            })
        };
        let recv_loop = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        info!("AMT gateway started on {:?}", engine.local_addr()?);

        Ok(AmtGateway {
            engine,
            channels,
            timer_service,
            recv_loop,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.engine.local_addr()
    }

    /// Adds interest in a group. Traffic is only delivered to subscribers, see
    ///  [AmtGateway::subscribe].
    pub async fn join(&self, group: IpAddr, filter: SourceFilter) -> Result<(), GatewayError> {
        self.engine.membership().join(group, filter).await
    }

    pub async fn leave(&self, group: IpAddr) -> Result<(), GatewayError> {
        self.engine.membership().leave(group).await
    }

    pub async fn update_filter(&self, group: IpAddr, filter: SourceFilter) -> Result<(), GatewayError> {
        self.engine.membership().update_filter(group, filter).await
    }

    /// Joins the channel's group (as far as necessary) and returns a receiver for its datagrams
    pub async fn subscribe(&self, channel: Channel) -> Result<(SubscriptionId, mpsc::Receiver<UdpDatagram>), GatewayError> {
        self.channels.subscribe(channel).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), GatewayError> {
        self.channels.unsubscribe(id).await
    }

    pub fn state(&self) -> SessionState {
        self.engine.state()
    }

    pub fn stats(&self) -> GatewayStatsSnapshot {
        self.engine.stats().snapshot()
    }

    /// Waits for the session to end, returning the terminal error if it failed
    pub async fn wait(&self) -> Result<(), GatewayError> {
        self.engine.wait().await
    }

    /// Tears down the tunnel and stops all background work. No timer fires after this returns.
    pub async fn close(&self) {
        self.engine.close().await;
        self.timer_service.shutdown();
        self.dispatcher.abort();
    }
}

impl Drop for AmtGateway {
    fn drop(&mut self) {
        self.recv_loop.abort();
        self.dispatcher.abort();
        self.timer_service.shutdown();
    }
}
