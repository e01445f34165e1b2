pub mod amt_gateway;
pub mod datagram_sink;
pub mod gateway_config;
pub mod protocol_engine;
pub mod stats;
pub mod tunnel_session;
