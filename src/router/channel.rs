//! Handshake channels connecting the router to its peers.
//!
//! Every ingress port, egress port and credit lane is a bounded channel with
//! non-blocking push and pop. A full channel is backpressure, not an error:
//! the pusher keeps its item and retries on a later tick.

use std::collections::VecDeque;

/// A single credit-return message worth one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credit;

/// Bounded non-blocking channel.
#[derive(Debug, Clone)]
pub struct Channel<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push an item, handing it back if the channel is full.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            Ok(())
        } else {
            Err(item)
        }
    }

    pub fn try_pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.items.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// All channels a router exposes to its neighbours.
///
/// Credit lanes are indexed `port * num_vcs + vc`.
#[derive(Debug, Clone)]
pub struct RouterPorts<F> {
    /// Flits from upstream, one per ingress port
    pub ingress: Vec<Channel<F>>,
    /// Flits to downstream, one per egress port
    pub egress: Vec<Channel<F>>,
    /// Credits returned by downstream, per (egress port, VC)
    pub credit_in: Vec<Channel<Credit>>,
    /// Credits returned to upstream, per (ingress port, VC)
    pub credit_out: Vec<Channel<Credit>>,
}

impl<F> RouterPorts<F> {
    pub fn new(num_ports: usize, num_vcs: usize, depth: usize) -> Self {
        let lanes = num_ports * num_vcs;
        Self {
            ingress: (0..num_ports).map(|_| Channel::new(depth)).collect(),
            egress: (0..num_ports).map(|_| Channel::new(depth)).collect(),
            credit_in: (0..lanes).map(|_| Channel::new(depth)).collect(),
            credit_out: (0..lanes).map(|_| Channel::new(depth)).collect(),
        }
    }

    pub fn clear(&mut self) {
        self.ingress.iter_mut().for_each(Channel::clear);
        self.egress.iter_mut().for_each(Channel::clear);
        self.credit_in.iter_mut().for_each(Channel::clear);
        self.credit_out.iter_mut().for_each(Channel::clear);
    }
}
