use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Everything the packet and AMT codecs reject. Inbound datagrams failing with this error are
///  dropped and logged by the receive loop, they never terminate a session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPacketError {
    #[error("{what}: buffer too short, need {expected} bytes, have {actual}")]
    TooShort { what: &'static str, expected: usize, actual: usize },
    #[error("{what}: declared length {declared} does not fit the {available} available bytes")]
    LengthOutOfBounds { what: &'static str, declared: usize, available: usize },
    #[error("unsupported IP version {0}")]
    UnsupportedIpVersion(u8),
    #[error("unsupported protocol {0}, expected {1}")]
    UnsupportedProtocol(u8, &'static str),
    #[error("fragmented IP packets are not supported")]
    Fragmented,
    #[error("{0}: checksum mismatch")]
    ChecksumMismatch(&'static str),
    #[error("unsupported AMT version {0}")]
    UnsupportedAmtVersion(u8),
    #[error("unknown AMT message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected {what} type {value}")]
    UnexpectedType { what: &'static str, value: u8 },
    #[error("invalid address length {0}")]
    InvalidAddressLength(usize),
    #[error("address family mismatch between {0} and {1}")]
    AddressFamilyMismatch(IpAddr, IpAddr),
}

/// Errors visible to users of the gateway.
///
/// Only [GatewayError::DiscoveryFailed], [GatewayError::RequestRejected],
///  [GatewayError::RequestTimeout] and [GatewayError::SocketIo] terminate a session; the others
///  are returned from individual calls or handled locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("relay discovery failed: no advertisement after {attempts} attempts")]
    DiscoveryFailed { attempts: u32 },
    #[error("relay rejected the tunnel request after {restarts} handshake restarts")]
    RequestRejected { restarts: u32 },
    #[error("relay did not answer the tunnel request after {restarts} handshake restarts")]
    RequestTimeout { restarts: u32 },
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] MalformedPacketError),
    #[error("socket I/O error ({kind:?}): {message}")]
    SocketIo { kind: io::ErrorKind, message: String },
    #[error("invalid filter operation: {0}")]
    InvalidFilterOperation(String),
    #[error("no active tunnel")]
    NotConnected,
    #[error("gateway is closed")]
    Closed,
}

impl GatewayError {
    pub fn is_terminal(&self) -> bool {
        matches!(self,
            GatewayError::DiscoveryFailed { .. }
            | GatewayError::RequestRejected { .. }
            | GatewayError::RequestTimeout { .. }
            | GatewayError::SocketIo { .. })
    }
}

impl From<io::Error> for GatewayError {
    fn from(e: io::Error) -> Self {
        GatewayError::SocketIo {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
