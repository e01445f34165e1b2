use crate::error::GatewayError;
use crate::membership::interface_manager::InterfaceMembershipManager;
use crate::membership::source_filter::SourceFilter;
use crate::packet::udp::UdpDatagram;
use crate::util::random::{Random, RngRandom};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// What a subscriber wants to receive: datagrams to `group`, optionally restricted to a single
///  source address and / or destination port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel {
    pub group: IpAddr,
    pub source: Option<IpAddr>,
    pub port: Option<u16>,
}

impl Channel {
    pub fn any_source(group: IpAddr) -> Channel {
        Channel { group, source: None, port: None }
    }

    pub fn source_specific(group: IpAddr, source: IpAddr) -> Channel {
        Channel { group, source: Some(source), port: None }
    }

    pub fn with_port(self, port: u16) -> Channel {
        Channel { port: Some(port), ..self }
    }

    pub fn matches(&self, datagram: &UdpDatagram) -> bool {
        self.group == datagram.destination_address()
            && self.source.map(|s| s == datagram.source_address()).unwrap_or(true)
            && self.port.map(|p| p == datagram.destination_port()).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    channel: Channel,
    sender: mpsc::Sender<UdpDatagram>,
}

struct Subscriptions {
    next_id: u64,
    by_id: BTreeMap<SubscriptionId, Subscription>,
}

impl Subscriptions {
    /// The filter receiving everything that the group's subscribers want
    fn aggregate_filter(&self, group: &IpAddr) -> SourceFilter {
        let mut any_source = false;
        let mut sources = Vec::new();
        for s in self.by_id.values().filter(|s| s.channel.group == *group) {
            match s.channel.source {
                None => any_source = true,
                Some(source) => sources.push(source),
            }
        }
        if any_source {
            SourceFilter::all_sources()
        }
        else {
            SourceFilter::include(sources)
        }
    }
}

/// Delivers decapsulated datagrams to subscriber channels, and keeps each group's membership
///  in line with its subscriptions: the first subscription joins a group, removing the last
///  one leaves it.
///
/// Subscriber channels are bounded. If a subscriber does not keep up, datagrams for it are
///  dropped rather than stalling delivery to everybody else.
pub struct ChannelMembershipManager<R: Random = RngRandom> {
    membership: InterfaceMembershipManager<R>,
    channel_capacity: usize,
    subscriptions: Mutex<Subscriptions>,
}

impl <R: Random> ChannelMembershipManager<R> {
    pub fn new(membership: InterfaceMembershipManager<R>, channel_capacity: usize) -> ChannelMembershipManager<R> {
        ChannelMembershipManager {
            membership,
            channel_capacity,
            subscriptions: Mutex::new(Subscriptions {
                next_id: 0,
                by_id: Default::default(),
            }),
        }
    }

    pub async fn subscribe(&self, channel: Channel) -> Result<(SubscriptionId, mpsc::Receiver<UdpDatagram>), GatewayError> {
        if let Some(source) = channel.source {
            if source.is_ipv4() != channel.group.is_ipv4() {
                return Err(GatewayError::InvalidFilterOperation(format!("source {} does not match the address family of group {}", source, channel.group)));
            }
        }

        let mut subscriptions = self.subscriptions.lock().await;

        let mut filter = subscriptions.aggregate_filter(&channel.group);
        filter = filter.union(&match channel.source {
            None => SourceFilter::all_sources(),
            Some(source) => SourceFilter::include([source]),
        });
        self.membership.update_filter(channel.group, filter).await?;

        let id = SubscriptionId(subscriptions.next_id);
        subscriptions.next_id += 1;

        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        subscriptions.by_id.insert(id, Subscription { channel, sender });
        debug!("subscription {:?} to {:?}", id, channel);
        Ok((id, receiver))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), GatewayError> {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(removed) = subscriptions.by_id.remove(&id) else {
            debug!("unsubscribing unknown subscription {:?}", id);
            return Ok(());
        };
        debug!("unsubscribed {:?} from {:?}", id, removed.channel);

        let group = removed.channel.group;
        let filter = subscriptions.aggregate_filter(&group);
        self.membership.update_filter(group, filter).await
    }

    pub async fn num_subscriptions(&self) -> usize {
        self.subscriptions.lock().await.by_id.len()
    }

    /// Hands a datagram to all matching subscribers, returning the number of subscribers it was
    ///  delivered to. Subscriptions whose receiver was dropped are removed.
    pub async fn dispatch(&self, datagram: UdpDatagram) -> usize {
        let mut subscriptions = self.subscriptions.lock().await;

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, subscription) in &subscriptions.by_id {
            if !subscription.channel.matches(&datagram) {
                continue;
            }
            match subscription.sender.try_send(datagram.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => warn!("subscriber channel for {:?} is full - dropping datagram", subscription.channel),
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        if delivered == 0 {
            trace!("no subscriber for {:?}", datagram);
        }

        for id in closed {
            if let Some(removed) = subscriptions.by_id.remove(&id) {
                debug!("subscriber for {:?} went away - removing subscription {:?}", removed.channel, id);
                let group = removed.channel.group;
                let filter = subscriptions.aggregate_filter(&group);
                if let Err(e) = self.membership.update_filter(group, filter).await {
                    warn!("error updating membership for group {}: {}", group, e);
                }
            }
        }
        delivered
    }
}
