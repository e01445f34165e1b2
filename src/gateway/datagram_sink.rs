use crate::packet::udp::UdpDatagram;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// The downstream end of the decapsulation pipeline. The receive loop hands every decapsulated
///  datagram to the sink in the order it was received from the relay.
///
/// Implementations must not block: a slow consumer should drop datagrams rather than stall the
///  receive loop.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSink: Send + Sync + 'static {
    /// returns `false` if the datagram was dropped
    async fn on_datagram(&self, datagram: UdpDatagram) -> bool;
}

#[async_trait]
impl DatagramSink for mpsc::Sender<UdpDatagram> {
    async fn on_datagram(&self, datagram: UdpDatagram) -> bool {
        match self.try_send(datagram) {
            Ok(()) => true,
            Err(TrySendError::Full(d)) => {
                warn!("output channel is full - dropping {:?}", d);
                false
            }
            Err(TrySendError::Closed(d)) => {
                trace!("output channel is closed - dropping {:?}", d);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn datagram(payload: &'static [u8]) -> UdpDatagram {
        UdpDatagram {
            source: "10.0.0.1:1234".parse().unwrap(),
            destination: "239.1.1.1:5000".parse().unwrap(),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sender, mut receiver) = mpsc::channel(1);

        assert!(sender.on_datagram(datagram(b"a")).await);
        assert!(!sender.on_datagram(datagram(b"b")).await);
        assert_eq!(receiver.recv().await, Some(datagram(b"a")));

        drop(receiver);
        assert!(!sender.on_datagram(datagram(b"c")).await);
    }
}
