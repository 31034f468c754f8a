//! noc-router library
//!
//! Cycle-level model of a wormhole network-on-chip router with virtual
//! channels and credit-based flow control.

pub mod config;
pub mod router;
pub mod testing;
