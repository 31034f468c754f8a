//! Wormhole virtual-channel router model.
//!
//! Cycle-level model of a credit-flow-controlled network-on-chip switch.
//! Multi-flit packets enter on ingress ports, are routed by source-route
//! bits or lookup tables, contend for egress ports through per-output
//! arbiters and leave through a crossbar. Downstream buffer space is
//! tracked with credits.
//!
//! # Architecture
//!
//! ```text
//!  ingress[p] ──► InputQueueBank ──► VC select ──► RoutingPolicy (headers)
//!                  (port, VC)                          │
//!                                                      ▼
//!  credit_out[p,vc] ◄── CreditBank ◄── pop ◄── RequestMatrix + Arbiter[k]
//!                           ▲                          │
//!  credit_in[k,vc] ─────────┘                          ▼
//!                                   egress[k] ◄── EgressStage ◄── crossbar
//! ```
//!
//! Everything is recomputed once per [`Router::tick`]. There are no
//! threads; peers exchange flits and credits through bounded
//! [`Channel`]s that the caller services between ticks.
//!
//! # Modules
//!
//! - [`bits`]: bit-field accessors and [`PortMask`]
//! - [`flit`]: flits and position tags
//! - [`arbiter`]: per-output priority arbiter
//! - [`channel`]: bounded handshake channels
//! - [`queue`]: per-(port, VC) input buffers
//! - [`credit`]: credit counters
//! - [`routing`]: source and table routing policies
//! - [`matrix`]: request matrix and multicast grant rules
//! - [`crossbar`]: data movement and egress staging
//! - [`engine`]: the [`Router`] and its per-tick pipeline

pub mod arbiter;
pub mod bits;
pub mod channel;
pub mod credit;
pub mod crossbar;
pub mod engine;
pub mod flit;
pub mod matrix;
pub mod queue;
pub mod routing;

pub use arbiter::{Arbiter, ArbiterKind};
pub use bits::PortMask;
pub use channel::{Channel, Credit, RouterPorts};
pub use credit::{CreditBank, CreditCounter};
pub use engine::{Grant, OutputVcState, Router, RouterStats, TickReport};
pub use flit::{packet_id, packetize, Flit, FlitPosition};
pub use routing::{Hop, LutLayout, LutRouting, RouteDecision, RoutingPolicy, SourceRouting};

use thiserror::Error;

/// Protocol violations detected while ticking a router.
///
/// These are fatal: the router state after one of them is not meaningful.
/// Contention and backpressure are never reported here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error("Input queue overflow on port {port} VC {vc} (depth {depth})")]
    QueueOverflow { port: usize, vc: usize, depth: usize },

    #[error("Input queue empty on port {port} VC {vc}")]
    QueueUnderflow { port: usize, vc: usize },

    #[error("Credit overflow on port {port} VC {vc}: {credits} exceeds buffer depth {depth}")]
    CreditOverflow { port: usize, vc: usize, credits: usize, depth: usize },

    #[error("No credit on port {port} VC {vc}")]
    CreditUnderflow { port: usize, vc: usize },

    #[error("Owed credits on port {port} VC {vc}: {owed} exceeds buffer depth {depth}")]
    CreditReturnOverflow { port: usize, vc: usize, owed: usize, depth: usize },

    #[error("Flit on port {port} names VC {vc}, router has {num_vcs}")]
    InvalidVirtualChannel { port: usize, vc: usize, num_vcs: usize },

    #[error("Egress staging overflow on port {port}")]
    StagingOverflow { port: usize },
}
