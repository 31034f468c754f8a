//! Priority arbiter for output ports.
//!
//! One arbiter sits on every egress port. Each cycle it receives the column
//! of inputs that may send to that port and grants exactly one of them.
//!
//! # Round-robin
//!
//! After a grant to requester `k`, requester `(k + 1) % N` gets top priority
//! on the next pick. A requester that stays valid is granted within `N`
//! grants to others.
//!
//! ```
//! use noc_router::router::{Arbiter, ArbiterKind, PortMask};
//!
//! let mut arb = Arbiter::new(4, ArbiterKind::RoundRobin);
//! let both = PortMask::from_bits(0b0101);
//! assert_eq!(arb.pick(both), PortMask::one_hot(0));
//! assert_eq!(arb.pick(both), PortMask::one_hot(2));
//! assert_eq!(arb.pick(both), PortMask::one_hot(0));
//! ```

use serde::{Deserialize, Serialize};

use super::bits::PortMask;

/// Arbitration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterKind {
    /// Rotating priority, starvation-free
    #[default]
    RoundRobin,
    /// Lowest index always wins
    Static,
}

/// Priority arbiter over `size` requesters.
#[derive(Debug, Clone)]
pub struct Arbiter {
    /// Number of requesters
    size: usize,
    /// Arbitration policy
    kind: ArbiterKind,
    /// Requester with top priority on the next pick
    next: usize,
}

impl Arbiter {
    pub fn new(size: usize, kind: ArbiterKind) -> Self {
        Self { size, kind, next: 0 }
    }

    /// Restore reset priority (requester 0 first).
    pub fn reset(&mut self) {
        self.next = 0;
    }

    /// Pick one winner from `valid`.
    ///
    /// Returns a one-hot mask, or an empty mask iff no requester in range is
    /// valid. Round-robin state only advances on a successful pick.
    pub fn pick(&mut self, valid: PortMask) -> PortMask {
        let valid = valid & PortMask::first_n(self.size);
        if valid.is_empty() {
            return PortMask::EMPTY;
        }

        // Single requester: pass-through, no state
        if self.size == 1 {
            return valid;
        }

        let winner = match self.kind {
            ArbiterKind::Static => valid.lowest(),
            ArbiterKind::RoundRobin => {
                (0..self.size)
                    .map(|offset| (self.next + offset) % self.size)
                    .find(|&idx| valid.contains(idx))
            }
        };

        match winner {
            Some(k) => {
                if self.kind == ArbiterKind::RoundRobin {
                    self.next = (k + 1) % self.size;
                }
                PortMask::one_hot(k)
            }
            None => PortMask::EMPTY,
        }
    }

    /// Convenience wrapper returning the winner's index.
    pub fn pick_index(&mut self, valid: PortMask) -> Option<usize> {
        self.pick(valid).one_hot_index()
    }
}
