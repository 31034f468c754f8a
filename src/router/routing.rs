//! Route computation.
//!
//! A [`RoutingPolicy`] maps a header payload to a destination mask over the
//! router's egress ports and rewrites the header on its way out. Two
//! policies exist:
//!
//! - [`SourceRouting`]: the sender encodes every hop in the header. Each
//!   router consumes the nearest descriptor and shifts the rest down.
//! - [`LutRouting`]: the header carries a destination id. Each router looks
//!   it up in two-tier tables (own group / other groups), with an optional
//!   multicast form that ORs several table entries.
//!
//! Route computation only runs on Head/Single flits. Body and Tail flits
//! reuse the decision stored for their (input port, VC).
//!
//! # Source-route descriptor layout
//!
//! With `L` local and `R` remote ports, each hop is `index_width(R) + L`
//! bits, nearest hop in the low bits:
//!
//! ```text
//!  route = <Dest-N> ... <Dest-2> <Dest-1>
//!  Dest  = <remote selector : index_width(R)> <local one-hot : L>
//! ```
//!
//! The remote port `L + selector` is only requested when descriptors remain
//! after this hop; a zero remainder means the packet terminates here.

use std::fmt;

use thiserror::Error;

use super::bits::{self, PortMask};
use crate::config::{ConfigError, RouteTier, RouterConfig, RoutingConfig};

/// Routing decision for one packet at one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteDecision {
    /// Egress ports the packet must reach
    pub dest: PortMask,
    /// Packet must advance on all destinations in lock-step
    pub multicast: bool,
    /// Destinations reached as local-group deliveries
    pub local_legs: PortMask,
}

impl RouteDecision {
    pub fn unicast(port: usize) -> Self {
        Self {
            dest: PortMask::one_hot(port),
            multicast: false,
            local_legs: PortMask::EMPTY,
        }
    }
}

/// Strategy for computing destinations from a header.
pub trait RoutingPolicy: fmt::Debug + Send {
    /// Short policy name for logging.
    fn name(&self) -> &'static str;

    /// Compute the destination mask for a header payload.
    ///
    /// Malformed encodings are not rejected: they yield an empty mask and
    /// the packet simply never requests an output.
    fn resolve(&self, header: u64) -> RouteDecision;

    /// Header payload as forwarded on `output`.
    fn forward_header(&self, header: u64, route: &RouteDecision, output: usize) -> u64;
}

/// Build the policy selected by `config`.
pub fn build_policy(config: &RouterConfig) -> Result<Box<dyn RoutingPolicy>, ConfigError> {
    match &config.routing {
        RoutingConfig::Source { max_hops } => Ok(Box::new(SourceRouting::new(
            config.local_ports,
            config.remote_ports,
            *max_hops,
        )?)),
        RoutingConfig::Lut { .. } => Ok(Box::new(LutRouting::from_config(config)?)),
    }
}

// ============================================================================
// Source routing
// ============================================================================

/// One hop of a source route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hop {
    /// Local ports to deliver to at this hop
    pub local: PortMask,
    /// Remote port (index among remote ports) to forward on
    pub remote: Option<usize>,
}

impl Hop {
    pub fn local(ports: PortMask) -> Self {
        Self { local: ports, remote: None }
    }

    pub fn forward(remote: usize) -> Self {
        Self { local: PortMask::EMPTY, remote: Some(remote) }
    }

    /// Deliver locally and forward on a remote port.
    pub fn fork(local: PortMask, remote: usize) -> Self {
        Self { local, remote: Some(remote) }
    }
}

/// Error encoding a source route.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteEncodeError {
    #[error("Route needs {hops} hops, maximum is {max_hops}")]
    TooManyHops { hops: usize, max_hops: usize },

    #[error("Empty route")]
    Empty,

    #[error("Hop {hop} names local ports {mask} beyond the {local_ports} local ports")]
    LocalPortOutOfRange { hop: usize, mask: PortMask, local_ports: usize },

    #[error("Hop {hop} names remote port {remote}, only {remote_ports} exist")]
    RemotePortOutOfRange { hop: usize, remote: usize, remote_ports: usize },

    #[error("Hop {hop} must forward on a remote port to reach the next hop")]
    MissingForward { hop: usize },

    #[error("Final hop must deliver locally and not forward")]
    BadFinalHop,
}

/// Source routing: destinations are read hop by hop from the header.
#[derive(Debug, Clone)]
pub struct SourceRouting {
    local_ports: usize,
    remote_ports: usize,
    max_hops: usize,
    /// Width of the remote selector
    remote_bits: u32,
    /// Width of one hop descriptor
    hop_bits: u32,
    /// Width of the whole route field
    route_bits: u32,
}

impl SourceRouting {
    pub fn new(local_ports: usize, remote_ports: usize, max_hops: usize) -> Result<Self, ConfigError> {
        if max_hops == 0 {
            return Err(ConfigError::ZeroMaxHops);
        }
        let remote_bits = bits::index_width(remote_ports);
        let hop_bits = remote_bits + local_ports as u32;
        let route_bits = hop_bits as usize * max_hops;
        if route_bits > 64 {
            return Err(ConfigError::RouteTooWide { bits: route_bits });
        }

        Ok(Self {
            local_ports,
            remote_ports,
            max_hops,
            remote_bits,
            hop_bits,
            route_bits: route_bits as u32,
        })
    }

    pub fn hop_bits(&self) -> u32 {
        self.hop_bits
    }

    pub fn route_bits(&self) -> u32 {
        self.route_bits
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Split the route field into this hop's descriptor and the remainder.
    pub fn split(&self, header: u64) -> (u64, u64) {
        let route = bits::get_field(header, 0, self.route_bits);
        let descriptor = bits::get_field(route, 0, self.hop_bits);
        let next = route >> self.hop_bits;
        (descriptor, next)
    }

    /// Encode a route, nearest hop first.
    ///
    /// Every hop but the last must forward on a remote port; the last one
    /// must deliver locally only.
    pub fn encode(&self, hops: &[Hop]) -> Result<u64, RouteEncodeError> {
        if hops.is_empty() {
            return Err(RouteEncodeError::Empty);
        }
        if hops.len() > self.max_hops {
            return Err(RouteEncodeError::TooManyHops { hops: hops.len(), max_hops: self.max_hops });
        }

        let mut route = 0u64;
        for (idx, hop) in hops.iter().enumerate().rev() {
            let last = idx + 1 == hops.len();
            if (hop.local.bits() >> self.local_ports) != 0 {
                return Err(RouteEncodeError::LocalPortOutOfRange {
                    hop: idx,
                    mask: hop.local,
                    local_ports: self.local_ports,
                });
            }
            let selector = match (hop.remote, last) {
                (Some(_), true) => return Err(RouteEncodeError::BadFinalHop),
                (None, true) if hop.local.is_empty() => return Err(RouteEncodeError::BadFinalHop),
                (None, true) => 0,
                (None, false) => return Err(RouteEncodeError::MissingForward { hop: idx }),
                (Some(r), false) if r >= self.remote_ports => {
                    return Err(RouteEncodeError::RemotePortOutOfRange {
                        hop: idx,
                        remote: r,
                        remote_ports: self.remote_ports,
                    })
                }
                (Some(r), false) => r as u64,
            };

            let descriptor = bits::set_field(hop.local.bits(), self.local_ports as u32, self.remote_bits, selector);
            route = (route << self.hop_bits) | descriptor;
        }
        Ok(route)
    }
}

impl RoutingPolicy for SourceRouting {
    fn name(&self) -> &'static str {
        "source"
    }

    fn resolve(&self, header: u64) -> RouteDecision {
        let (descriptor, next) = self.split(header);
        let local = PortMask::from_bits(bits::get_field(descriptor, 0, self.local_ports as u32));
        let selector = bits::get_field(descriptor, self.local_ports as u32, self.remote_bits) as usize;

        let mut dest = local;
        if next != 0 && selector < self.remote_ports {
            dest.insert(self.local_ports + selector);
        }

        RouteDecision {
            dest,
            multicast: dest.count() > 1,
            local_legs: local,
        }
    }

    fn forward_header(&self, header: u64, _route: &RouteDecision, _output: usize) -> u64 {
        let (_, next) = self.split(header);
        bits::set_field(header, 0, self.route_bits, next)
    }
}

// ============================================================================
// Table (LUT) routing
// ============================================================================

/// Bit layout of LUT-routed headers.
///
/// ```text
/// unicast:   [0, ul)            local destination index
///            [ul, ul + ug)      group index
/// multicast: [0, G)             group bit-vector (G = number of groups)
///            [G, G + M)         local bit-vector (M = multicast width)
///            G + M              multicast flag
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutLayout {
    /// Width of the unicast local index
    pub unicast_local_bits: u32,
    /// Width of the unicast group index
    pub unicast_group_bits: u32,
    /// Width of the multicast group vector (one bit per group)
    pub group_bits: u32,
    /// Width of the multicast local vector
    pub multicast_local_bits: u32,
}

impl LutLayout {
    pub fn new(local_dests: usize, groups: usize, multicast_local_width: usize) -> Self {
        Self {
            unicast_local_bits: bits::index_width(local_dests),
            unicast_group_bits: bits::index_width(groups),
            group_bits: groups as u32,
            multicast_local_bits: multicast_local_width as u32,
        }
    }

    /// Width of the multicast destination field.
    pub fn multicast_width(&self) -> u32 {
        self.group_bits + self.multicast_local_bits
    }

    /// Position of the multicast flag.
    pub fn multicast_flag_bit(&self) -> u32 {
        self.multicast_width()
    }

    pub fn is_multicast(&self, header: u64) -> bool {
        bits::bit(header, self.multicast_flag_bit())
    }

    /// Unicast header for local destination `local` in group `group`.
    pub fn unicast_header(&self, local: usize, group: usize) -> u64 {
        let header = bits::set_field(0, 0, self.unicast_local_bits, local as u64);
        bits::set_field(header, self.unicast_local_bits, self.unicast_group_bits, group as u64)
    }

    /// Multicast header for a set of local destinations and groups.
    pub fn multicast_header(&self, locals: u64, groups: u64) -> u64 {
        let header = bits::set_field(0, 0, self.group_bits, groups);
        let header = bits::set_field(header, self.group_bits, self.multicast_local_bits, locals);
        header | (1u64 << self.multicast_flag_bit())
    }
}

/// Hierarchical table routing with multicast.
#[derive(Debug, Clone)]
pub struct LutRouting {
    /// This router's group
    group_id: usize,
    /// Destination masks within our group
    local_table: Vec<PortMask>,
    /// Destination masks toward each group
    remote_table: Vec<PortMask>,
    layout: LutLayout,
    /// Multicast field bits kept when forwarding a local delivery, per output
    local_keep: Vec<u64>,
    /// Multicast field bits kept when forwarding a remote delivery, per output
    remote_keep: Vec<u64>,
}

impl LutRouting {
    pub fn from_config(config: &RouterConfig) -> Result<Self, ConfigError> {
        match &config.routing {
            RoutingConfig::Lut { group_id, local_routes, remote_routes, multicast_local_width } => {
                let width = multicast_local_width.unwrap_or(local_routes.len());
                Self::new(config.num_ports(), *group_id, local_routes, remote_routes, width)
            }
            RoutingConfig::Source { .. } => Err(ConfigError::WrongRoutingMode { expected: "lut" }),
        }
    }

    pub fn new(
        num_ports: usize,
        group_id: usize,
        local_routes: &[u64],
        remote_routes: &[u64],
        multicast_local_width: usize,
    ) -> Result<Self, ConfigError> {
        if local_routes.is_empty() {
            return Err(ConfigError::EmptyRouteTable { tier: RouteTier::Local });
        }
        if remote_routes.is_empty() {
            return Err(ConfigError::EmptyRouteTable { tier: RouteTier::Remote });
        }
        if group_id >= remote_routes.len() {
            return Err(ConfigError::GroupIdOutOfRange { group_id, groups: remote_routes.len() });
        }
        if multicast_local_width > local_routes.len() {
            return Err(ConfigError::MulticastWidthTooLarge {
                width: multicast_local_width,
                entries: local_routes.len(),
            });
        }

        let check_table = |tier: RouteTier, table: &[u64]| -> Result<Vec<PortMask>, ConfigError> {
            table
                .iter()
                .enumerate()
                .map(|(index, &mask)| {
                    if num_ports < 64 && (mask >> num_ports) != 0 {
                        Err(ConfigError::RouteMaskOutOfRange { tier, index, mask, ports: num_ports })
                    } else {
                        Ok(PortMask::from_bits(mask))
                    }
                })
                .collect()
        };
        let local_table = check_table(RouteTier::Local, local_routes)?;
        let remote_table = check_table(RouteTier::Remote, remote_routes)?;

        let layout = LutLayout::new(local_table.len(), remote_table.len(), multicast_local_width);
        let unicast_bits = layout.unicast_local_bits + layout.unicast_group_bits;
        if layout.multicast_flag_bit() >= 64 {
            return Err(ConfigError::RouteTooWide { bits: layout.multicast_flag_bit() as usize + 1 });
        }
        if unicast_bits > layout.multicast_flag_bit() {
            return Err(ConfigError::LayoutOverlap {
                unicast_bits,
                flag_bit: layout.multicast_flag_bit(),
            });
        }

        let mut routing = Self {
            group_id,
            local_table,
            remote_table,
            layout,
            local_keep: Vec::new(),
            remote_keep: Vec::new(),
        };
        routing.compute_keep_masks(num_ports);
        Ok(routing)
    }

    pub fn layout(&self) -> &LutLayout {
        &self.layout
    }

    pub fn group_id(&self) -> usize {
        self.group_id
    }

    /// Precompute per-output header masks for multicast forwarding.
    ///
    /// A local delivery on output k keeps our own group bit and the local
    /// bits whose table entries include k. A remote delivery keeps the
    /// other groups whose entries include k and every local bit.
    fn compute_keep_masks(&mut self, num_ports: usize) {
        let g = self.layout.group_bits;
        let m = self.layout.multicast_local_bits as usize;
        let all_locals = bits::low_mask(self.layout.multicast_local_bits) << g;

        self.local_keep = (0..num_ports)
            .map(|k| {
                let mut keep = 1u64 << self.group_id;
                for (j, entry) in self.local_table.iter().take(m).enumerate() {
                    if entry.contains(k) {
                        keep |= 1u64 << (g as usize + j);
                    }
                }
                keep
            })
            .collect();

        self.remote_keep = (0..num_ports)
            .map(|k| {
                let mut keep = all_locals;
                for (j, entry) in self.remote_table.iter().enumerate() {
                    if j != self.group_id && entry.contains(k) {
                        keep |= 1u64 << j;
                    }
                }
                keep
            })
            .collect();
    }

    fn resolve_multicast(&self, header: u64) -> RouteDecision {
        let groups = bits::get_field(header, 0, self.layout.group_bits);
        let locals = bits::get_field(header, self.layout.group_bits, self.layout.multicast_local_bits);
        let own = 1u64 << self.group_id;
        let in_own_group = groups & own != 0;
        let other_groups = groups & !own != 0;

        let mut local_legs = PortMask::EMPTY;
        if in_own_group {
            for (j, entry) in self.local_table.iter().enumerate() {
                if bits::bit(locals, j as u32) && j < self.layout.multicast_local_bits as usize {
                    local_legs |= *entry;
                }
            }
        }

        let mut dest = local_legs;
        if other_groups {
            for (j, entry) in self.remote_table.iter().enumerate() {
                if j != self.group_id && bits::bit(groups, j as u32) {
                    dest |= *entry;
                }
            }
        }

        RouteDecision { dest, multicast: true, local_legs }
    }

    fn resolve_unicast(&self, header: u64) -> RouteDecision {
        let local = bits::get_field(header, 0, self.layout.unicast_local_bits) as usize;
        let group = bits::get_field(
            header,
            self.layout.unicast_local_bits,
            self.layout.unicast_group_bits,
        ) as usize;

        let (dest, local_legs) = if group == self.group_id {
            let dest = self.local_table.get(local).copied().unwrap_or_default();
            (dest, dest)
        } else {
            (self.remote_table.get(group).copied().unwrap_or_default(), PortMask::EMPTY)
        };

        RouteDecision {
            dest,
            multicast: dest.count() > 1,
            local_legs,
        }
    }
}

impl RoutingPolicy for LutRouting {
    fn name(&self) -> &'static str {
        "lut"
    }

    fn resolve(&self, header: u64) -> RouteDecision {
        if self.layout.is_multicast(header) {
            self.resolve_multicast(header)
        } else {
            self.resolve_unicast(header)
        }
    }

    fn forward_header(&self, header: u64, route: &RouteDecision, output: usize) -> u64 {
        if !self.layout.is_multicast(header) {
            return header;
        }
        let width = self.layout.multicast_width();
        let keep = if route.local_legs.contains(output) {
            self.local_keep[output]
        } else {
            self.remote_keep[output]
        };
        let field = bits::get_field(header, 0, width) & keep;
        bits::set_field(header, 0, width, field)
    }
}
