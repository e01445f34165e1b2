//! A gateway for Automatic Multicast Tunneling: it discovers a relay, establishes a unicast
//!  tunnel to it, keeps the relay informed about the groups and sources the local application
//!  wants to receive, and turns the multicast traffic arriving through the tunnel into plain
//!  UDP datagrams.

pub mod amt;
pub mod error;
pub mod gateway;
pub mod membership;
pub mod packet;
pub mod timer;
pub mod util;
pub mod test_util;
