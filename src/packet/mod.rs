pub mod checksum;
pub mod igmp;
pub mod ip;
pub mod membership;
pub mod mld;
pub mod udp;
