//! Credit counters for flow control.
//!
//! Each (port, VC) lane carries two counters:
//! - `available`: flits this router may still push to the downstream
//!   buffer behind that egress lane. Starts at the buffer depth.
//! - `owed`: credits this router has earned by draining its own input
//!   lane and not yet returned upstream. Starts at 0.
//!
//! Neither counter may exceed the buffer depth. Crossing it means a peer
//! returned more credits than it was sent flits, or the router drained
//! more flits than it could have buffered.

use super::RouterError;

/// Per-lane credit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditCounter {
    /// Credits available to send downstream
    pub available: usize,
    /// Credits owed upstream
    pub owed: usize,
}

/// Credit counters for every (port, VC) lane of a router.
#[derive(Debug, Clone)]
pub struct CreditBank {
    num_vcs: usize,
    depth: usize,
    lanes: Vec<CreditCounter>,
}

impl CreditBank {
    pub fn new(num_ports: usize, num_vcs: usize, depth: usize) -> Self {
        let lanes = num_ports * num_vcs;
        Self {
            num_vcs,
            depth,
            lanes: vec![CreditCounter { available: depth, owed: 0 }; lanes],
        }
    }

    fn lane(&self, port: usize, vc: usize) -> usize {
        port * self.num_vcs + vc
    }

    pub fn counter(&self, port: usize, vc: usize) -> CreditCounter {
        self.lanes[self.lane(port, vc)]
    }

    pub fn available(&self, port: usize, vc: usize) -> usize {
        self.counter(port, vc).available
    }

    pub fn owed(&self, port: usize, vc: usize) -> usize {
        self.counter(port, vc).owed
    }

    /// A credit message arrived from downstream.
    pub fn receive(&mut self, port: usize, vc: usize) -> Result<(), RouterError> {
        let lane = self.lane(port, vc);
        let credits = self.lanes[lane].available + 1;
        if credits > self.depth {
            log::warn!(
                "Credit overflow on port {} VC {}: {} > depth {}",
                port, vc, credits, self.depth
            );
            return Err(RouterError::CreditOverflow { port, vc, credits, depth: self.depth });
        }
        self.lanes[lane].available = credits;
        Ok(())
    }

    /// Spend one credit for a flit pushed toward (port, vc).
    ///
    /// Callers only grant lanes with credit, so an empty lane here is a
    /// router bug; it is reported as an underflow rather than wrapping.
    pub fn consume(&mut self, port: usize, vc: usize) -> Result<(), RouterError> {
        let lane = self.lane(port, vc);
        if self.lanes[lane].available == 0 {
            return Err(RouterError::CreditUnderflow { port, vc });
        }
        self.lanes[lane].available -= 1;
        Ok(())
    }

    /// An input flit on (port, vc) was drained; one credit is now owed.
    pub fn accrue(&mut self, port: usize, vc: usize) -> Result<(), RouterError> {
        let lane = self.lane(port, vc);
        let owed = self.lanes[lane].owed + 1;
        if owed > self.depth {
            log::warn!(
                "Owed credits overflow on port {} VC {}: {} > depth {}",
                port, vc, owed, self.depth
            );
            return Err(RouterError::CreditReturnOverflow { port, vc, owed, depth: self.depth });
        }
        self.lanes[lane].owed = owed;
        Ok(())
    }

    /// A credit message went out upstream.
    pub fn settle(&mut self, port: usize, vc: usize) {
        let lane = self.lane(port, vc);
        self.lanes[lane].owed = self.lanes[lane].owed.saturating_sub(1);
    }

    pub fn reset(&mut self) {
        for lane in &mut self.lanes {
            *lane = CreditCounter { available: self.depth, owed: 0 };
        }
    }
}
