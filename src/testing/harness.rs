//! Traffic harness around a [`Router`].
//!
//! The harness plays every neighbour of a router:
//!
//! - a [`Sender`] per ingress port, injecting flits only while it holds
//!   credits for the flit's VC;
//! - a [`Sink`] per egress port, consuming flits and returning credits,
//!   optionally after a delay, never, or with periodic back-pressure.
//!
//! After every tick it checks the invariants a correct router keeps:
//! credit conservation on both sides of every lane, packet atomicity per
//! egress VC and all-or-nothing multicast grants.
//!
//! Ports wired to another router through a [`Link`] are excluded from
//! senders, sinks and checks.
//!
//! # Usage
//!
//! ```ignore
//! let mut h = Harness::new(Router::new(config)?);
//! h.send(0, packetize(1, header, &[1, 2, 3]));
//! h.run_until_drained(100)?;
//! assert_eq!(h.deliveries(1).len(), 4);
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::{Credit, Flit, FlitPosition, PortMask, Router, RouterError, TickReport};

/// Failure while driving a router.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("Cycle {cycle}: {side} credits on port {port} VC {vc} add up to {total}, buffer depth is {depth}")]
    CreditConservation { cycle: u64, side: &'static str, port: usize, vc: usize, total: usize, depth: usize },

    #[error("Cycle {cycle}: port {port} VC {vc} got a flit of packet {found} inside packet {open}")]
    PacketInterleaved { cycle: u64, port: usize, vc: usize, open: u32, found: u32 },

    #[error("Cycle {cycle}: port {port} VC {vc} got {position} flit of packet {packet_id} outside a packet")]
    OrphanFlit { cycle: u64, port: usize, vc: usize, position: FlitPosition, packet_id: u32 },

    #[error("Cycle {cycle}: input {input} granted {outputs} of destinations {dest}")]
    PartialMulticast { cycle: u64, input: usize, outputs: PortMask, dest: PortMask },

    #[error("Traffic not drained after {ticks} ticks")]
    Timeout { ticks: u64 },
}

/// Upstream neighbour of one ingress port.
#[derive(Debug, Clone)]
pub struct Sender {
    pending: VecDeque<Flit>,
    credits: Vec<usize>,
    sent: u64,
}

impl Sender {
    fn new(num_vcs: usize, depth: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            credits: vec![depth; num_vcs],
            sent: 0,
        }
    }

    pub fn enqueue(&mut self, flits: impl IntoIterator<Item = Flit>) {
        self.pending.extend(flits);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn credits(&self, vc: usize) -> usize {
        self.credits[vc]
    }

    /// Push the next flit if its VC has credit and the channel has room.
    fn offer(&mut self, port: usize, router: &mut Router) -> bool {
        let Some(&flit) = self.pending.front() else {
            return false;
        };
        let vc = flit.virtual_channel(router.num_vcs());
        if self.credits.get(vc).copied().unwrap_or(0) == 0 {
            return false;
        }
        if router.ingress_mut(port).try_push(flit).is_err() {
            return false;
        }
        self.pending.pop_front();
        self.credits[vc] -= 1;
        self.sent += 1;
        true
    }

    fn collect_credits(&mut self, port: usize, router: &mut Router) {
        for (vc, credits) in self.credits.iter_mut().enumerate() {
            while router.credit_out_mut(port, vc).try_pop().is_some() {
                *credits += 1;
            }
        }
    }
}

/// How a sink treats flits and credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkBehavior {
    /// Ticks between consuming a flit and returning its credit
    pub credit_delay: u64,
    /// Keep every credit until released
    pub hold_credits: bool,
    /// Refuse flits on every Nth tick (0 = never)
    pub stall_every: u64,
}

/// A flit observed on an egress port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub cycle: u64,
    pub flit: Flit,
}

/// Downstream neighbour of one egress port.
#[derive(Debug, Clone)]
pub struct Sink {
    behavior: SinkBehavior,
    deliveries: Vec<Delivery>,
    /// Credits not yet returned: (due cycle, VC)
    held: VecDeque<(u64, usize)>,
    /// Packet currently open on each VC
    open: Vec<Option<u32>>,
}

impl Sink {
    fn new(num_vcs: usize) -> Self {
        Self {
            behavior: SinkBehavior::default(),
            deliveries: Vec::new(),
            held: VecDeque::new(),
            open: vec![None; num_vcs],
        }
    }

    pub fn behavior(&self) -> SinkBehavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: SinkBehavior) {
        self.behavior = behavior;
    }

    /// Start returning held credits.
    pub fn release(&mut self) {
        self.behavior.hold_credits = false;
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Credits for `vc` consumed but not yet returned.
    pub fn held_credits(&self, vc: usize) -> usize {
        self.held.iter().filter(|&&(_, v)| v == vc).count()
    }

    /// Check packet atomicity for a flit arriving on (port, vc).
    fn observe(&mut self, port: usize, vc: usize, cycle: u64, flit: &Flit) -> Result<(), HarnessError> {
        let id = flit.packet_id;
        match (self.open[vc], flit.position) {
            (None, FlitPosition::Head) => self.open[vc] = Some(id),
            (None, FlitPosition::Single) => {}
            (None, position) => {
                return Err(HarnessError::OrphanFlit { cycle, port, vc, position, packet_id: id });
            }
            (Some(open), FlitPosition::Body) if open == id => {}
            (Some(open), FlitPosition::Tail) if open == id => self.open[vc] = None,
            (Some(open), _) => {
                return Err(HarnessError::PacketInterleaved { cycle, port, vc, open, found: id });
            }
        }
        Ok(())
    }

    fn accept(&mut self, port: usize, cycle: u64, router: &mut Router) -> Result<(), HarnessError> {
        let stalled = self.behavior.stall_every > 0 && cycle % self.behavior.stall_every == 0;
        if !stalled {
            if let Some(flit) = router.egress_mut(port).try_pop() {
                let vc = flit.virtual_channel(router.num_vcs());
                self.observe(port, vc, cycle, &flit)?;
                self.deliveries.push(Delivery { cycle, flit });
                self.held.push_back((cycle + self.behavior.credit_delay, vc));
            }
        }

        if !self.behavior.hold_credits {
            while let Some(&(due, vc)) = self.held.front() {
                if due > cycle || router.credit_in_mut(port, vc).try_push(Credit).is_err() {
                    break;
                }
                self.held.pop_front();
            }
        }
        Ok(())
    }
}

/// A router with simulated neighbours on every port.
#[derive(Debug)]
pub struct Harness {
    router: Router,
    senders: Vec<Sender>,
    sinks: Vec<Sink>,
    /// Ports wired to another router
    linked: PortMask,
}

impl Harness {
    pub fn new(router: Router) -> Self {
        let ports = router.num_ports();
        let vcs = router.num_vcs();
        let depth = router.config().buffer_depth;
        Self {
            senders: (0..ports).map(|_| Sender::new(vcs, depth)).collect(),
            sinks: (0..ports).map(|_| Sink::new(vcs)).collect(),
            linked: PortMask::EMPTY,
            router,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn cycle(&self) -> u64 {
        self.router.cycle()
    }

    /// Hand `port` over to a [`Link`].
    pub fn link_port(&mut self, port: usize) {
        self.linked.insert(port);
    }

    /// Queue flits for injection on ingress `port`.
    pub fn send(&mut self, port: usize, flits: impl IntoIterator<Item = Flit>) {
        self.senders[port].enqueue(flits);
    }

    pub fn sender(&self, port: usize) -> &Sender {
        &self.senders[port]
    }

    pub fn sink(&self, port: usize) -> &Sink {
        &self.sinks[port]
    }

    pub fn sink_mut(&mut self, port: usize) -> &mut Sink {
        &mut self.sinks[port]
    }

    pub fn deliveries(&self, port: usize) -> &[Delivery] {
        self.sinks[port].deliveries()
    }

    /// Inject, tick, consume, then check invariants.
    pub fn step(&mut self) -> Result<TickReport, HarnessError> {
        let ports = self.router.num_ports();

        for port in (0..ports).filter(|&p| !self.linked.contains(p)) {
            self.senders[port].offer(port, &mut self.router);
        }

        let report = self.router.tick()?;
        let cycle = report.cycle;

        for grant in &report.grants {
            if grant.outputs != grant.dest {
                return Err(HarnessError::PartialMulticast {
                    cycle,
                    input: grant.input,
                    outputs: grant.outputs,
                    dest: grant.dest,
                });
            }
        }

        for port in (0..ports).filter(|&p| !self.linked.contains(p)) {
            self.sinks[port].accept(port, cycle, &mut self.router)?;
            self.senders[port].collect_credits(port, &mut self.router);
        }

        self.check_conservation(cycle)?;
        Ok(report)
    }

    /// Nothing left to send and nothing inside the router or its egress
    /// channels.
    pub fn is_drained(&self) -> bool {
        let ports = 0..self.router.num_ports();
        self.router.is_idle()
            && self.senders.iter().all(|s| s.pending() == 0)
            && ports.clone().all(|p| self.router.ingress(p).is_empty())
            && ports.filter(|&p| !self.linked.contains(p)).all(|p| self.router.egress(p).is_empty())
    }

    /// Step until drained, returning the cycle count.
    pub fn run_until_drained(&mut self, max_ticks: u64) -> Result<u64, HarnessError> {
        for _ in 0..max_ticks {
            if self.is_drained() {
                return Ok(self.cycle());
            }
            self.step()?;
        }
        if self.is_drained() {
            Ok(self.cycle())
        } else {
            Err(HarnessError::Timeout { ticks: max_ticks })
        }
    }

    /// Step exactly `ticks` times.
    pub fn run(&mut self, ticks: u64) -> Result<(), HarnessError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    /// Every credit of every lane must be somewhere: with the holder, in a
    /// buffer or in flight on a channel.
    fn check_conservation(&self, cycle: u64) -> Result<(), HarnessError> {
        let router = &self.router;
        let depth = router.config().buffer_depth;
        let vcs = router.num_vcs();

        for port in (0..router.num_ports()).filter(|&p| !self.linked.contains(p)) {
            for vc in 0..vcs {
                let on_vc = |f: &&Flit| f.virtual_channel(vcs) == vc;

                let downstream = router.credits_available(port, vc)
                    + router.staged_vc(port, vc)
                    + router.egress(port).iter().filter(on_vc).count()
                    + self.sinks[port].held_credits(vc)
                    + router.credit_in(port, vc).len();
                if downstream != depth {
                    return Err(HarnessError::CreditConservation {
                        cycle,
                        side: "egress",
                        port,
                        vc,
                        total: downstream,
                        depth,
                    });
                }

                let upstream = self.senders[port].credits(vc)
                    + router.ingress(port).iter().filter(on_vc).count()
                    + router.queue_len(port, vc)
                    + router.credits_owed(port, vc)
                    + router.credit_out(port, vc).len();
                if upstream != depth {
                    return Err(HarnessError::CreditConservation {
                        cycle,
                        side: "ingress",
                        port,
                        vc,
                        total: upstream,
                        depth,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Point-to-point wire from an egress port of one router to an ingress
/// port of another, with the matching credit return path.
///
/// Both ends must use the same buffer depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Egress port on the upstream router
    pub from: usize,
    /// Ingress port on the downstream router
    pub to: usize,
}

impl Link {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// Move at most one flit downstream and one credit per VC upstream.
    pub fn service(&self, upstream: &mut Router, downstream: &mut Router) {
        if let Some(&flit) = upstream.egress(self.from).peek() {
            if downstream.ingress_mut(self.to).try_push(flit).is_ok() {
                upstream.egress_mut(self.from).try_pop();
            }
        }

        for vc in 0..upstream.num_vcs().min(downstream.num_vcs()) {
            if downstream.credit_out(self.to, vc).is_empty() {
                continue;
            }
            if upstream.credit_in_mut(self.from, vc).try_push(Credit).is_ok() {
                downstream.credit_out_mut(self.to, vc).try_pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouterConfig, RoutingConfig};
    use crate::router::routing::{Hop, SourceRouting};
    use crate::router::{packet_id, packetize};

    fn config(depth: usize, vcs: usize) -> RouterConfig {
        RouterConfig {
            local_ports: 2,
            remote_ports: 2,
            virtual_channels: vcs,
            buffer_depth: depth,
            routing: RoutingConfig::Source { max_hops: 4 },
            ..RouterConfig::default()
        }
    }

    fn encoder() -> SourceRouting {
        SourceRouting::new(2, 2, 4).unwrap()
    }

    /// Header reaching egress `port` of the first router.
    fn to_port(port: usize) -> u64 {
        let hops = if port < 2 {
            vec![Hop::local(PortMask::one_hot(port))]
        } else {
            vec![Hop::forward(port - 2), Hop::local(PortMask::one_hot(0))]
        };
        encoder().encode(&hops).unwrap()
    }

    #[test]
    fn test_unicast_stream() {
        let mut h = Harness::new(Router::new(config(4, 1)).unwrap());
        h.send(0, packetize(9, to_port(1), &[1, 2, 3]));

        let cycles = h.run_until_drained(50).unwrap();
        assert_eq!(cycles, 4);

        let got: Vec<_> = h.deliveries(1).iter().map(|d| d.flit.position).collect();
        assert_eq!(
            got,
            vec![FlitPosition::Head, FlitPosition::Body, FlitPosition::Body, FlitPosition::Tail]
        );
        // One flit per cycle, back to back
        let when: Vec<_> = h.deliveries(1).iter().map(|d| d.cycle).collect();
        assert_eq!(when, vec![1, 2, 3, 4]);
        assert_eq!(h.router().stats().egress_stalls, 0);
    }

    #[test]
    fn test_mixed_load_keeps_invariants() {
        let mut h = Harness::new(Router::new(config(2, 2)).unwrap());
        h.sink_mut(1).set_behavior(SinkBehavior { credit_delay: 3, ..SinkBehavior::default() });
        h.sink_mut(2).set_behavior(SinkBehavior { stall_every: 3, ..SinkBehavior::default() });
        h.sink_mut(3).set_behavior(SinkBehavior { credit_delay: 1, stall_every: 4, ..SinkBehavior::default() });

        let mut expected = [0usize; 4];
        for input in 0..4 {
            for i in 0..6 {
                let dest = (input + i) % 4;
                let vc = i % 2;
                let body: Vec<u64> = (0..(i % 3) as u64).collect();
                let flits = packetize(packet_id((input * 16 + i) as u32, vc, 2), to_port(dest), &body);
                expected[dest] += flits.len();
                h.send(input, flits);
            }
        }

        h.run_until_drained(2000).unwrap();
        for port in 0..4 {
            assert_eq!(h.deliveries(port).len(), expected[port], "port {}", port);
        }
        assert_eq!(h.router().stats().flits_forwarded as usize, expected.iter().sum::<usize>());
    }

    #[test]
    fn test_multicast_waits_for_held_credit() {
        let mut h = Harness::new(Router::new(config(1, 1)).unwrap());
        h.sink_mut(2).set_behavior(SinkBehavior { hold_credits: true, ..SinkBehavior::default() });

        // Spend output 2's only credit; the sink keeps it
        h.send(1, vec![Flit::single(to_port(2), 0)]);
        h.run(2).unwrap();
        assert_eq!(h.router().credits_available(2, 0), 0);

        let fork = encoder()
            .encode(&[Hop::fork(PortMask::one_hot(0), 0), Hop::local(PortMask::one_hot(1))])
            .unwrap();
        h.send(3, vec![Flit::single(fork, 1)]);

        h.run(10).unwrap();
        assert!(h.router().stats().multicast_withdrawn >= 9);
        assert_eq!(h.deliveries(2).len(), 1);
        assert!(h.deliveries(0).is_empty());

        h.sink_mut(2).release();
        h.run_until_drained(20).unwrap();
        assert_eq!(h.deliveries(0).len(), 1);
        assert_eq!(h.deliveries(2).len(), 2);
        // Both copies leave in the same cycle
        assert_eq!(h.deliveries(0)[0].cycle, h.deliveries(2)[1].cycle);
    }

    #[test]
    fn test_two_hop_source_route() {
        let mut a = Harness::new(Router::new(config(2, 1)).unwrap());
        let mut b = Harness::new(Router::new(config(2, 1)).unwrap());
        a.link_port(2);
        b.link_port(2);
        let link = Link::new(2, 2);

        let header = encoder()
            .encode(&[Hop::forward(0), Hop::local(PortMask::one_hot(1))])
            .unwrap()
            | (0x77 << 40);
        a.send(0, packetize(5, header, &[0xAA, 0xBB]));

        for _ in 0..30 {
            a.step().unwrap();
            b.step().unwrap();
            link.service(a.router_mut(), b.router_mut());
        }

        let got: Vec<_> = b.deliveries(1).iter().map(|d| d.flit.payload).collect();
        assert_eq!(got, vec![0x77 << 40, 0xAA, 0xBB]);
        assert!(a.is_drained());
        assert!(b.is_drained());
        // Every credit made it back across the link
        assert_eq!(a.router().credits_available(2, 0), 2);
    }

    #[test]
    fn test_sink_detects_interleaving() {
        let mut sink = Sink::new(1);
        sink.observe(0, 0, 1, &Flit::head(0, 1)).unwrap();
        assert_eq!(
            sink.observe(0, 0, 2, &Flit::body(0, 2)),
            Err(HarnessError::PacketInterleaved { cycle: 2, port: 0, vc: 0, open: 1, found: 2 })
        );
        sink.observe(0, 0, 3, &Flit::tail(0, 1)).unwrap();
        assert!(matches!(
            sink.observe(0, 0, 4, &Flit::tail(0, 1)),
            Err(HarnessError::OrphanFlit { .. })
        ));
    }

    #[test]
    fn test_timeout() {
        let mut h = Harness::new(Router::new(config(1, 1)).unwrap());
        h.sink_mut(1).set_behavior(SinkBehavior { hold_credits: true, ..SinkBehavior::default() });
        h.send(0, (0..3).map(|i| Flit::single(to_port(1), i)));
        assert_eq!(h.run_until_drained(10), Err(HarnessError::Timeout { ticks: 10 }));
    }
}
