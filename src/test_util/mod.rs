//! Utilities for testing code built on the gateway: a report sender that records what it is
//!  given, and an in-process fake relay talking AMT over a loopback UDP socket.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so that applications can use
//!  them in their own tests.

pub mod membership;
pub mod relay;
