//! The router and its per-tick pipeline.
//!
//! [`Router::tick`] advances the model by one clock cycle. Within a tick
//! the phases run in a fixed order:
//!
//! 1. Credit receive: at most one credit per (egress port, VC) lane.
//! 2. Ingress fill: at most one flit per ingress port into its VC queue.
//! 3. VC selection and route: each input presents its lowest non-empty VC;
//!    headers are routed, continuation flits reuse the stored route.
//! 4. Arbitration: request matrix, per-output arbiters, multicast rules.
//! 5. Crossbar: granted flits are copied into egress staging, header
//!    routing bits rewritten per output, downstream credits consumed.
//! 6. Egress drain: one staged flit per output offered to its channel.
//! 7. Input pop: each granted input drops its flit once and owes a credit.
//! 8. Credit send: one credit per lane with credits owed.
//!
//! Admission in phase 4 only sees state from phases 1-3, so a credit that
//! arrives this tick can be spent this tick but a staging slot freed in
//! phase 6 is only visible on the next one.

use smallvec::SmallVec;

use super::arbiter::Arbiter;
use super::bits::PortMask;
use super::channel::{Channel, Credit, RouterPorts};
use super::credit::CreditBank;
use super::crossbar::{self, Drain, EgressStage};
use super::flit::{Flit, FlitPosition};
use super::matrix::{self, Contender, Grants};
use super::queue::InputQueueBank;
use super::routing::{self, RouteDecision, RoutingPolicy};
use super::RouterError;
use crate::config::{ConfigError, RouterConfig};

/// Packet ownership of one (egress port, VC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputVcState {
    /// Free; the next flit must be a header
    #[default]
    AcceptingHeader,
    /// Held by the packet in flight from `input`
    InPacket { input: usize },
}

/// One input's grant in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub input: usize,
    pub vc: usize,
    /// Outputs granted this tick
    pub outputs: PortMask,
    /// Full destination mask of the packet
    pub dest: PortMask,
    pub position: FlitPosition,
    pub packet_id: u32,
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub cycle: u64,
    /// Flits taken from ingress channels
    pub received: usize,
    pub grants: SmallVec<[Grant; 8]>,
    /// Flits pushed to egress channels
    pub sent: usize,
    /// Outputs whose egress channel refused a staged flit
    pub stalls: usize,
    pub credits_received: usize,
    pub credits_returned: usize,
}

/// Cumulative router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub cycles: u64,
    pub flits_received: u64,
    /// Flits pushed to egress channels (multicast copies count separately)
    pub flits_forwarded: u64,
    /// Input grants
    pub grants: u64,
    /// Input grants fanned out to several outputs
    pub multicast_grants: u64,
    pub multicast_withdrawn: u64,
    pub multicast_voided: u64,
    pub egress_stalls: u64,
    pub credits_received: u64,
    pub credits_returned: u64,
}

/// Per-port and per-VC router state.
#[derive(Debug, Clone)]
struct RouterState {
    queues: InputQueueBank,
    credits: CreditBank,
    /// Route of the packet at the head of each input lane
    routes: Vec<Option<RouteDecision>>,
    /// Ownership of each output lane
    output_vc: Vec<OutputVcState>,
    staging: EgressStage,
}

impl RouterState {
    fn new(config: &RouterConfig) -> Self {
        let ports = config.num_ports();
        let vcs = config.virtual_channels;
        let lanes = ports * vcs;
        Self {
            queues: InputQueueBank::new(ports, vcs, config.buffer_depth),
            credits: CreditBank::new(ports, vcs, config.buffer_depth),
            routes: vec![None; lanes],
            output_vc: vec![OutputVcState::AcceptingHeader; lanes],
            staging: EgressStage::new(ports, config.egress_depth),
        }
    }

    fn reset(&mut self) {
        self.queues.clear();
        self.credits.reset();
        self.routes.iter_mut().for_each(|r| *r = None);
        self.output_vc.iter_mut().for_each(|s| *s = OutputVcState::AcceptingHeader);
        self.staging.clear();
    }
}

/// Wormhole virtual-channel router.
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    num_ports: usize,
    num_vcs: usize,
    policy: Box<dyn RoutingPolicy>,
    /// One arbiter per egress port
    arbiters: Vec<Arbiter>,
    state: RouterState,
    ports: RouterPorts<Flit>,
    stats: RouterStats,
    cycle: u64,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = routing::build_policy(&config)?;
        let num_ports = config.num_ports();
        let num_vcs = config.virtual_channels;

        log::debug!(
            "Router: {} local + {} remote ports, {} VCs, depth {}, {} routing",
            config.local_ports,
            config.remote_ports,
            num_vcs,
            config.buffer_depth,
            policy.name()
        );

        Ok(Self {
            arbiters: (0..num_ports).map(|_| Arbiter::new(num_ports, config.arbiter)).collect(),
            state: RouterState::new(&config),
            ports: RouterPorts::new(num_ports, num_vcs, config.channel_depth),
            stats: RouterStats::default(),
            cycle: 0,
            num_ports,
            num_vcs,
            policy,
            config,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    pub fn num_vcs(&self) -> usize {
        self.num_vcs
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn policy(&self) -> &dyn RoutingPolicy {
        self.policy.as_ref()
    }

    fn lane(&self, port: usize, vc: usize) -> usize {
        port * self.num_vcs + vc
    }

    // --- Channels --------------------------------------------------------

    pub fn ingress(&self, port: usize) -> &Channel<Flit> {
        &self.ports.ingress[port]
    }

    pub fn ingress_mut(&mut self, port: usize) -> &mut Channel<Flit> {
        &mut self.ports.ingress[port]
    }

    pub fn egress(&self, port: usize) -> &Channel<Flit> {
        &self.ports.egress[port]
    }

    pub fn egress_mut(&mut self, port: usize) -> &mut Channel<Flit> {
        &mut self.ports.egress[port]
    }

    /// Credits arriving from downstream of egress `port`.
    pub fn credit_in(&self, port: usize, vc: usize) -> &Channel<Credit> {
        &self.ports.credit_in[self.lane(port, vc)]
    }

    pub fn credit_in_mut(&mut self, port: usize, vc: usize) -> &mut Channel<Credit> {
        let lane = self.lane(port, vc);
        &mut self.ports.credit_in[lane]
    }

    /// Credits returned to the upstream of ingress `port`.
    pub fn credit_out(&self, port: usize, vc: usize) -> &Channel<Credit> {
        &self.ports.credit_out[self.lane(port, vc)]
    }

    pub fn credit_out_mut(&mut self, port: usize, vc: usize) -> &mut Channel<Credit> {
        let lane = self.lane(port, vc);
        &mut self.ports.credit_out[lane]
    }

    // --- State inspection ------------------------------------------------

    pub fn credits_available(&self, port: usize, vc: usize) -> usize {
        self.state.credits.available(port, vc)
    }

    pub fn credits_owed(&self, port: usize, vc: usize) -> usize {
        self.state.credits.owed(port, vc)
    }

    pub fn output_vc_state(&self, port: usize, vc: usize) -> OutputVcState {
        self.state.output_vc[self.lane(port, vc)]
    }

    pub fn queue_len(&self, port: usize, vc: usize) -> usize {
        self.state.queues.len(port, vc)
    }

    /// Flits waiting in egress staging on `port`.
    pub fn staged(&self, port: usize) -> usize {
        self.state.staging.len(port)
    }

    /// Staged flits on `port` belonging to `vc`.
    pub fn staged_vc(&self, port: usize, vc: usize) -> usize {
        self.state.staging.count_vc(port, vc, self.num_vcs)
    }

    /// Route held for the packet at the head of (port, vc).
    pub fn route(&self, port: usize, vc: usize) -> Option<RouteDecision> {
        self.state.routes[self.lane(port, vc)]
    }

    /// No flit buffered anywhere inside the router.
    pub fn is_idle(&self) -> bool {
        self.state.queues.total_len() == 0 && self.state.staging.total_len() == 0
    }

    /// Restore reset state: empty queues and channels, full credits, every
    /// output VC accepting headers. Configuration is kept.
    pub fn reset(&mut self) {
        self.state.reset();
        self.ports.clear();
        self.arbiters.iter_mut().for_each(Arbiter::reset);
        self.stats = RouterStats::default();
        self.cycle = 0;
    }

    // --- Pipeline --------------------------------------------------------

    /// Advance one clock cycle.
    pub fn tick(&mut self) -> Result<TickReport, RouterError> {
        self.cycle += 1;
        let mut report = TickReport { cycle: self.cycle, ..TickReport::default() };

        // 1. Credits from downstream
        self.receive_credits(&mut report)?;

        // 2. Ingress channels into VC queues
        self.fill_input_queues(&mut report)?;

        // 3. VC selection and route computation
        let (contenders, flits) = self.select_and_route()?;

        // 4. Arbitration
        let grants = self.arbitrate(&contenders);
        self.stats.multicast_withdrawn += grants.withdrawn as u64;
        self.stats.multicast_voided += grants.voided as u64;

        // 5. Crossbar into egress staging
        self.traverse_crossbar(&contenders, &flits, &grants, &mut report)?;

        // 6. Egress staging into egress channels
        self.drain_egress(&mut report);

        // 7. Pop granted inputs
        self.pop_granted(&contenders, &grants)?;

        // 8. Credits to upstream
        self.send_credits(&mut report);

        self.stats.cycles += 1;
        Ok(report)
    }

    fn receive_credits(&mut self, report: &mut TickReport) -> Result<(), RouterError> {
        for port in 0..self.num_ports {
            for vc in 0..self.num_vcs {
                let lane = self.lane(port, vc);
                if self.ports.credit_in[lane].try_pop().is_some() {
                    self.state.credits.receive(port, vc)?;
                    log::trace!(
                        "[{}] credit in: port {} VC {} -> {}",
                        self.cycle,
                        port,
                        vc,
                        self.state.credits.available(port, vc)
                    );
                    report.credits_received += 1;
                    self.stats.credits_received += 1;
                }
            }
        }
        Ok(())
    }

    fn fill_input_queues(&mut self, report: &mut TickReport) -> Result<(), RouterError> {
        for port in 0..self.num_ports {
            let Some(flit) = self.ports.ingress[port].try_pop() else {
                continue;
            };
            let vc = flit.virtual_channel(self.num_vcs);
            if vc >= self.num_vcs {
                log::warn!("Flit {} on port {} names VC {} of {}", flit, port, vc, self.num_vcs);
                return Err(RouterError::InvalidVirtualChannel { port, vc, num_vcs: self.num_vcs });
            }
            self.state.queues.push(port, vc, flit)?;
            log::trace!("[{}] in: port {} VC {} {}", self.cycle, port, vc, flit);
            report.received += 1;
            self.stats.flits_received += 1;
        }
        Ok(())
    }

    /// Present one flit per input and compute routes for headers.
    #[allow(clippy::type_complexity)]
    fn select_and_route(&mut self) -> Result<(Vec<Option<Contender>>, Vec<Option<Flit>>), RouterError> {
        let mut contenders = Vec::with_capacity(self.num_ports);
        let mut flits = Vec::with_capacity(self.num_ports);

        for input in 0..self.num_ports {
            let Some(vc) = self.state.queues.select_vc(input) else {
                contenders.push(None);
                flits.push(None);
                continue;
            };
            let flit = *self.state.queues.peek(input, vc)?;
            let lane = self.lane(input, vc);

            if flit.is_header() {
                let route = self.policy.resolve(flit.payload);
                log::debug!(
                    "[{}] route: port {} VC {} {} -> {}{}",
                    self.cycle,
                    input,
                    vc,
                    flit,
                    route.dest,
                    if route.multicast { " (multicast)" } else { "" }
                );
                self.state.routes[lane] = Some(route);
            }

            let contender = match self.state.routes[lane] {
                Some(route) => Some(Contender {
                    input,
                    vc,
                    dest: route.dest,
                    multicast: route.multicast,
                    is_header: flit.is_header(),
                }),
                None => {
                    log::debug!("[{}] port {} VC {}: {} has no open route", self.cycle, input, vc, flit);
                    None
                }
            };
            contenders.push(contender);
            flits.push(Some(flit));
        }

        Ok((contenders, flits))
    }

    fn arbitrate(&mut self, contenders: &[Option<Contender>]) -> Grants {
        let state = &self.state;
        let num_vcs = self.num_vcs;
        let max_packet_size = self.config.max_packet_size;

        let ready = |c: &Contender, k: usize| {
            if state.credits.available(k, c.vc) == 0 {
                return false;
            }
            let lane_free = match state.output_vc[k * num_vcs + c.vc] {
                OutputVcState::AcceptingHeader => c.is_header,
                OutputVcState::InPacket { input } => input == c.input && !c.is_header,
            };
            if !lane_free {
                return false;
            }
            let room = match max_packet_size {
                Some(n) if c.multicast && c.is_header => n,
                _ => 1,
            };
            state.staging.free_slots(k) >= room
        };

        let grants = matrix::arbitrate(contenders, &mut self.arbiters, ready);
        if log::log_enabled!(log::Level::Trace) {
            for (k, sel) in grants.select.iter().enumerate() {
                if let Some(i) = sel {
                    log::trace!("[{}] grant: output {} <- input {}", self.cycle, k, i);
                }
            }
        }
        grants
    }

    fn traverse_crossbar(
        &mut self,
        contenders: &[Option<Contender>],
        flits: &[Option<Flit>],
        grants: &Grants,
        report: &mut TickReport,
    ) -> Result<(), RouterError> {
        let outputs = crossbar::traverse(flits, &grants.select);

        for (k, out) in outputs.into_iter().enumerate() {
            let (Some(flit), Some(input)) = (out, grants.select[k]) else {
                continue;
            };
            let Some(c) = contenders[input] else {
                continue;
            };

            let forwarded = if flit.is_header() {
                let route = self.state.routes[self.lane(input, c.vc)].unwrap_or_default();
                Flit { payload: self.policy.forward_header(flit.payload, &route, k), ..flit }
            } else {
                flit
            };

            self.state.staging.push(k, forwarded)?;
            self.state.credits.consume(k, c.vc)?;
            let lane = self.lane(k, c.vc);
            self.state.output_vc[lane] = if flit.is_tail() {
                OutputVcState::AcceptingHeader
            } else {
                OutputVcState::InPacket { input }
            };
            log::debug!("[{}] xbar: port {} -> port {} VC {} {}", self.cycle, input, k, c.vc, forwarded);
        }

        for (input, outputs) in grants.granted.iter().enumerate() {
            if outputs.is_empty() {
                continue;
            }
            let (Some(c), Some(flit)) = (contenders[input], flits[input]) else {
                continue;
            };
            report.grants.push(Grant {
                input,
                vc: c.vc,
                outputs: *outputs,
                dest: c.dest,
                position: flit.position,
                packet_id: flit.packet_id,
            });
            self.stats.grants += 1;
            if outputs.count() > 1 {
                self.stats.multicast_grants += 1;
            }
        }
        Ok(())
    }

    fn drain_egress(&mut self, report: &mut TickReport) {
        for port in 0..self.num_ports {
            match self.state.staging.drain(port, &mut self.ports.egress[port]) {
                Drain::Idle => {}
                Drain::Sent(flit) => {
                    log::trace!("[{}] out: port {} {}", self.cycle, port, flit);
                    report.sent += 1;
                    self.stats.flits_forwarded += 1;
                }
                Drain::Blocked => {
                    log::debug!("[{}] egress port {} blocked", self.cycle, port);
                    report.stalls += 1;
                    self.stats.egress_stalls += 1;
                }
            }
        }
    }

    fn pop_granted(&mut self, contenders: &[Option<Contender>], grants: &Grants) -> Result<(), RouterError> {
        for (input, outputs) in grants.granted.iter().enumerate() {
            if outputs.is_empty() {
                continue;
            }
            let Some(c) = contenders[input] else {
                continue;
            };
            let flit = self.state.queues.pop(input, c.vc)?;
            self.state.credits.accrue(input, c.vc)?;
            if flit.is_tail() {
                let lane = self.lane(input, c.vc);
                self.state.routes[lane] = None;
            }
        }
        Ok(())
    }

    fn send_credits(&mut self, report: &mut TickReport) {
        for port in 0..self.num_ports {
            for vc in 0..self.num_vcs {
                if self.state.credits.owed(port, vc) == 0 {
                    continue;
                }
                let lane = self.lane(port, vc);
                if self.ports.credit_out[lane].try_push(Credit).is_ok() {
                    self.state.credits.settle(port, vc);
                    log::trace!("[{}] credit out: port {} VC {}", self.cycle, port, vc);
                    report.credits_returned += 1;
                    self.stats.credits_returned += 1;
                }
            }
        }
    }
}
