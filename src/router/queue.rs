//! Input queue bank: one bounded FIFO per (ingress port, virtual channel).
//!
//! Queue depth equals the credits advertised upstream, so a push to a full
//! queue means the sender ignored its credit count. That is reported as a
//! protocol violation rather than silently dropped.

use super::channel::Channel;
use super::flit::Flit;
use super::RouterError;

/// Input buffers for every (port, VC) lane.
#[derive(Debug, Clone)]
pub struct InputQueueBank {
    num_vcs: usize,
    queues: Vec<Channel<Flit>>,
}

impl InputQueueBank {
    pub fn new(num_ports: usize, num_vcs: usize, depth: usize) -> Self {
        Self {
            num_vcs,
            queues: (0..num_ports * num_vcs).map(|_| Channel::new(depth)).collect(),
        }
    }

    fn lane(&self, port: usize, vc: usize) -> usize {
        port * self.num_vcs + vc
    }

    /// Buffer a flit arriving on (port, vc).
    pub fn push(&mut self, port: usize, vc: usize, flit: Flit) -> Result<(), RouterError> {
        let lane = self.lane(port, vc);
        let depth = self.queues[lane].capacity();
        if self.queues[lane].try_push(flit).is_err() {
            log::warn!("Input queue overflow on port {} VC {} (depth {})", port, vc, depth);
            return Err(RouterError::QueueOverflow { port, vc, depth });
        }
        Ok(())
    }

    /// Head-of-queue flit for (port, vc).
    pub fn peek(&self, port: usize, vc: usize) -> Result<&Flit, RouterError> {
        self.queues[self.lane(port, vc)]
            .peek()
            .ok_or(RouterError::QueueUnderflow { port, vc })
    }

    /// Remove the head-of-queue flit for (port, vc).
    pub fn pop(&mut self, port: usize, vc: usize) -> Result<Flit, RouterError> {
        let lane = self.lane(port, vc);
        self.queues[lane]
            .try_pop()
            .ok_or(RouterError::QueueUnderflow { port, vc })
    }

    pub fn is_empty(&self, port: usize, vc: usize) -> bool {
        self.queues[self.lane(port, vc)].is_empty()
    }

    pub fn len(&self, port: usize, vc: usize) -> usize {
        self.queues[self.lane(port, vc)].len()
    }

    /// Pick the VC an ingress port presents this cycle.
    ///
    /// Static priority: the lowest-numbered non-empty VC wins. Input and
    /// output VCs are the same, so this also fixes the output VC.
    pub fn select_vc(&self, port: usize) -> Option<usize> {
        (0..self.num_vcs).find(|&vc| !self.is_empty(port, vc))
    }

    /// Total flits buffered across all lanes.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(Channel::len).sum()
    }

    pub fn clear(&mut self) {
        self.queues.iter_mut().for_each(Channel::clear);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_overflow_is_protocol_violation() {
        let mut bank = InputQueueBank::new(2, 1, 1);
        bank.push(1, 0, Flit::single(0, 0)).unwrap();
        let err = bank.push(1, 0, Flit::single(1, 0)).unwrap_err();
        assert_eq!(err, RouterError::QueueOverflow { port: 1, vc: 0, depth: 1 });
    }

    #[test]
    fn test_empty_queue_access_is_protocol_violation() {
        let mut bank = InputQueueBank::new(1, 2, 4);
        assert_eq!(bank.peek(0, 1).unwrap_err(), RouterError::QueueUnderflow { port: 0, vc: 1 });
        assert_eq!(bank.pop(0, 0).unwrap_err(), RouterError::QueueUnderflow { port: 0, vc: 0 });
    }

    #[test]
    fn test_vc_selection_prefers_lowest() {
        let mut bank = InputQueueBank::new(2, 3, 4);
        assert_eq!(bank.select_vc(0), None);

        bank.push(0, 2, Flit::single(0, 2)).unwrap();
        assert_eq!(bank.select_vc(0), Some(2));

        bank.push(0, 1, Flit::single(0, 1)).unwrap();
        assert_eq!(bank.select_vc(0), Some(1));
        assert_eq!(bank.select_vc(1), None);
        assert_eq!(bank.total_len(), 2);
    }
}
