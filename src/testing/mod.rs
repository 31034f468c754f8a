//! Test harness for driving a router with simulated neighbours.
//!
//! This module provides infrastructure for:
//! - Injecting packets under the credit protocol and consuming them
//! - Checking credit conservation and packet atomicity every tick
//! - Running TOML traffic scenarios and comparing deliveries
//!
//! # Usage
//!
//! ```bash
//! cargo run -- scenarios/multicast_starvation.toml --stats
//! ```

pub mod harness;
pub mod scenario;

pub use harness::{Delivery, Harness, HarnessError, Link, Sender, Sink, SinkBehavior};
pub use scenario::{Mismatch, PortDelivery, Scenario, ScenarioError, ScenarioResult};
