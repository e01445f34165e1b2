pub mod amt_messages;

/// UDP port on which relays receive discovery and request messages
pub const AMT_PORT: u16 = 2268;
