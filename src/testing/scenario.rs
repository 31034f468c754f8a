//! TOML traffic scenarios.
//!
//! A scenario names a router configuration, the behaviour of some sinks
//! and a list of packets with the ports they are expected to reach. It is
//! run through the [`Harness`], so every invariant is checked on every
//! tick, and then the deliveries are compared with the expectations.
//!
//! # Example Scenario
//!
//! ```toml
//! name = "multicast-starvation"
//! max_ticks = 100
//!
//! [router]
//! local_ports = 2
//! remote_ports = 2
//! buffer_depth = 1
//!
//! [router.routing]
//! mode = "source"
//! max_hops = 4
//!
//! [[sink]]
//! port = 2
//! hold_credits = true
//! release_at = 20
//!
//! [[packet]]
//! port = 3
//! tag = 2
//! hops = [{ local = [0], remote = 0 }, { local = [1] }]
//! expect = [0, 2]
//! ```
//!
//! Headers are given as raw bits (`header`), as source-route hops
//! (`hops`), as a table destination (`local`, `group`) or as a table
//! multicast (`multicast_locals`, `multicast_groups`).

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use super::harness::{Harness, HarnessError, SinkBehavior};
use crate::config::{Config, ConfigError, RouterConfig, RoutingConfig};
use crate::router::bits::index_width;
use crate::router::routing::{Hop, LutRouting, RouteEncodeError, SourceRouting};
use crate::router::{packet_id, packetize, Flit, PortMask, Router, RouterStats};

/// Failure loading or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid router configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Packet {tag}: {source}")]
    Route {
        tag: u32,
        #[source]
        source: RouteEncodeError,
    },

    #[error("Packet {tag} has no route")]
    MissingRoute { tag: u32 },

    #[error("Packet {tag} uses {given} routing, router is configured for {mode}")]
    RouteMode { tag: u32, given: &'static str, mode: &'static str },

    #[error("Packet {tag} names port {port}, router has {ports}")]
    BadPort { tag: u32, port: usize, ports: usize },

    #[error("Packet {tag} names VC {vc}, router has {vcs}")]
    BadVirtualChannel { tag: u32, vc: usize, vcs: usize },

    #[error("Packet {tag}: {field} index {index} out of range, limit {limit}")]
    DestinationOutOfRange { tag: u32, field: &'static str, index: usize, limit: usize },

    #[error("Packet tag {tag} does not fit in {bits} bits")]
    TagTooWide { tag: u32, bits: u32 },

    #[error("Packet tag {tag} used twice on VC {vc}")]
    DuplicatePacket { tag: u32, vc: usize },

    #[error("Sink port {port} out of range, router has {ports}")]
    BadSinkPort { port: usize, ports: usize },

    #[error(transparent)]
    Harness(#[from] HarnessError),
}

/// One source-route hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HopDef {
    /// Local ports to deliver to
    pub local: Vec<usize>,
    /// Remote port to forward on
    pub remote: Option<usize>,
}

impl From<&HopDef> for Hop {
    fn from(def: &HopDef) -> Self {
        Hop {
            local: def.local.iter().copied().collect(),
            remote: def.remote,
        }
    }
}

/// A packet to inject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PacketDef {
    /// Ingress port
    pub port: usize,
    /// Earliest cycle to inject at
    pub at: u64,
    /// Packet tag; the VC is appended to form the packet id
    pub tag: u32,
    pub vc: usize,
    /// Raw header payload
    pub header: Option<u64>,
    /// Source route
    pub hops: Vec<HopDef>,
    /// Table destination index
    pub local: Option<usize>,
    /// Table destination group (own group if unset)
    pub group: Option<usize>,
    /// Table multicast: local destination indices
    pub multicast_locals: Vec<usize>,
    /// Table multicast: group indices
    pub multicast_groups: Vec<usize>,
    /// Payloads of the flits after the header
    pub body: Vec<u64>,
    /// Egress ports that must receive the whole packet
    pub expect: Vec<usize>,
}

impl PacketDef {
    fn flit_count(&self) -> usize {
        self.body.len() + 1
    }
}

/// Sink settings for one egress port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SinkDef {
    pub port: usize,
    #[serde(flatten)]
    pub behavior: SinkBehavior,
    /// Cycle at which held credits start flowing again
    #[serde(default)]
    pub release_at: Option<u64>,
}

/// A traffic scenario.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub max_ticks: Option<u64>,
    #[serde(default)]
    pub router: Option<RouterConfig>,
    #[serde(default, rename = "sink")]
    pub sinks: Vec<SinkDef>,
    #[serde(default, rename = "packet")]
    pub packets: Vec<PacketDef>,
}

/// A flit seen on an egress port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDelivery {
    pub port: usize,
    pub cycle: u64,
    pub flit: Flit,
}

/// Expected and observed flit counts of one packet on one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub tag: u32,
    pub port: usize,
    pub expected: usize,
    pub got: usize,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packet {} on port {}: expected {} flits, got {}",
            self.tag, self.port, self.expected, self.got
        )
    }
}

/// Outcome of running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    pub ticks: u64,
    pub timed_out: bool,
    /// Flits the senders pushed into ingress channels
    pub injected: u64,
    pub deliveries: Vec<PortDelivery>,
    pub mismatches: Vec<Mismatch>,
    pub stats: RouterStats,
}

impl Scenario {
    /// Load a scenario from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ScenarioError> {
        let content = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ScenarioError> {
        Ok(toml::from_str(content)?)
    }

    /// Router configuration, falling back to the tool config.
    pub fn router_config(&self, defaults: &Config) -> RouterConfig {
        self.router.clone().unwrap_or_else(|| defaults.router())
    }

    /// Header payload for `packet` under `config`.
    pub fn header(&self, packet: &PacketDef, config: &RouterConfig) -> Result<u64, ScenarioError> {
        let tag = packet.tag;
        if let Some(header) = packet.header {
            return Ok(header);
        }

        let mode = match config.routing {
            RoutingConfig::Source { .. } => "source",
            RoutingConfig::Lut { .. } => "lut",
        };

        if !packet.hops.is_empty() {
            let RoutingConfig::Source { max_hops } = config.routing else {
                return Err(ScenarioError::RouteMode { tag, given: "source", mode });
            };
            let locals = packet.hops.iter().flat_map(|h| h.local.iter());
            check_indices(tag, "hops.local", locals, config.local_ports)?;
            let hops: Vec<Hop> = packet.hops.iter().map(Hop::from).collect();
            let encoder = SourceRouting::new(config.local_ports, config.remote_ports, max_hops)?;
            return encoder
                .encode(&hops)
                .map_err(|source| ScenarioError::Route { tag, source });
        }

        let multicast = !packet.multicast_locals.is_empty() || !packet.multicast_groups.is_empty();
        if multicast || packet.local.is_some() {
            let RoutingConfig::Lut { group_id, local_routes, remote_routes, .. } = &config.routing else {
                return Err(ScenarioError::RouteMode { tag, given: "lut", mode });
            };
            let lut = LutRouting::from_config(config)?;
            let layout = lut.layout();
            if multicast {
                let width = layout.multicast_local_bits as usize;
                check_indices(tag, "multicast_locals", packet.multicast_locals.iter(), width)?;
                let groups = layout.group_bits as usize;
                check_indices(tag, "multicast_groups", packet.multicast_groups.iter(), groups)?;
                let locals: PortMask = packet.multicast_locals.iter().copied().collect();
                let groups: PortMask = packet.multicast_groups.iter().copied().collect();
                return Ok(layout.multicast_header(locals.bits(), groups.bits()));
            }
            let local = packet.local.unwrap_or_default();
            check_indices(tag, "local", [local].iter(), local_routes.len())?;
            check_indices(tag, "group", packet.group.iter(), remote_routes.len())?;
            return Ok(layout.unicast_header(local, packet.group.unwrap_or(*group_id)));
        }

        Err(ScenarioError::MissingRoute { tag })
    }

    fn check_packets(&self, config: &RouterConfig) -> Result<(), ScenarioError> {
        let ports = config.num_ports();
        let vcs = config.virtual_channels;
        let mut seen = HashSet::new();

        for packet in &self.packets {
            let tag = packet.tag;
            if let Some(&port) = std::iter::once(&packet.port)
                .chain(&packet.expect)
                .find(|&&p| p >= ports)
            {
                return Err(ScenarioError::BadPort { tag, port, ports });
            }
            if packet.vc >= vcs {
                return Err(ScenarioError::BadVirtualChannel { tag, vc: packet.vc, vcs });
            }
            if vcs > 1 {
                let bits = u32::BITS - index_width(vcs);
                if tag >> bits != 0 {
                    return Err(ScenarioError::TagTooWide { tag, bits });
                }
            }
            if !seen.insert((tag, packet.vc)) {
                return Err(ScenarioError::DuplicatePacket { tag, vc: packet.vc });
            }
        }

        if let Some(sink) = self.sinks.iter().find(|s| s.port >= ports) {
            return Err(ScenarioError::BadSinkPort { port: sink.port, ports });
        }
        Ok(())
    }

    /// Run the scenario to completion or until the tick limit.
    pub fn run(&self, defaults: &Config) -> Result<ScenarioResult, ScenarioError> {
        let config = self.router_config(defaults);
        let router = Router::new(config.clone())?;
        self.check_packets(&config)?;

        let vcs = config.virtual_channels;
        let max_ticks = self.max_ticks.unwrap_or_else(|| defaults.max_ticks());
        log::info!("Running scenario '{}' ({} packets)", self.name, self.packets.len());

        let mut injections = Vec::with_capacity(self.packets.len());
        for packet in &self.packets {
            let header = self.header(packet, &config)?;
            let id = packet_id(packet.tag, packet.vc, vcs);
            injections.push((packet.at, packet.port, packetize(id, header, &packet.body)));
        }
        injections.sort_by_key(|(at, _, _)| *at);

        let mut harness = Harness::new(router);
        for sink in &self.sinks {
            harness.sink_mut(sink.port).set_behavior(sink.behavior);
        }

        let mut next = 0;
        let mut timed_out = true;
        for _ in 0..=max_ticks {
            let cycle = harness.cycle();
            while next < injections.len() && injections[next].0 <= cycle {
                let (_, port, flits) = &injections[next];
                harness.send(*port, flits.iter().copied());
                next += 1;
            }
            for sink in &self.sinks {
                if sink.release_at.map_or(false, |t| t <= cycle) {
                    harness.sink_mut(sink.port).release();
                }
            }

            if next == injections.len() && harness.is_drained() {
                timed_out = false;
                break;
            }
            if cycle >= max_ticks {
                break;
            }
            harness.step()?;
        }

        if timed_out {
            log::warn!("Scenario '{}' not drained after {} ticks", self.name, max_ticks);
        }

        let router = harness.router();
        let mut deliveries: Vec<PortDelivery> = (0..router.num_ports())
            .flat_map(|port| {
                harness
                    .deliveries(port)
                    .iter()
                    .map(move |d| PortDelivery { port, cycle: d.cycle, flit: d.flit })
            })
            .collect();
        deliveries.sort_by_key(|d| (d.cycle, d.port));

        let mut mismatches = Vec::new();
        for packet in self.packets.iter().filter(|p| !p.expect.is_empty()) {
            let id = packet_id(packet.tag, packet.vc, vcs);
            for port in 0..router.num_ports() {
                let got = deliveries
                    .iter()
                    .filter(|d| d.port == port && d.flit.packet_id == id)
                    .count();
                let expected = if packet.expect.contains(&port) { packet.flit_count() } else { 0 };
                if got != expected {
                    mismatches.push(Mismatch { tag: packet.tag, port, expected, got });
                }
            }
        }

        Ok(ScenarioResult {
            name: self.name.clone(),
            passed: !timed_out && mismatches.is_empty(),
            ticks: harness.cycle(),
            timed_out,
            injected: (0..router.num_ports()).map(|p| harness.sender(p).sent()).sum(),
            deliveries,
            mismatches,
            stats: router.stats().clone(),
        })
    }

    /// Generate a sample scenario file.
    pub fn sample_scenario() -> String {
        r#"# noc-router scenario
name = "sample"
description = "Unicast stream plus a multicast that waits for a held credit"
max_ticks = 200

[router]
local_ports = 2
remote_ports = 2
virtual_channels = 1
buffer_depth = 2

[router.routing]
mode = "source"
max_hops = 4

# Output 2 keeps its credits until cycle 10
[[sink]]
port = 2
hold_credits = true
release_at = 10

[[packet]]
port = 0
tag = 1
hops = [{ local = [1] }]
body = [0xB1, 0xB2, 0xE0]
expect = [1]

[[packet]]
port = 1
tag = 2
hops = [{ remote = 0 }, { local = [0] }]
body = [0xA0]
expect = [2]

[[packet]]
port = 3
tag = 3
at = 4
hops = [{ local = [0], remote = 0 }, { local = [1] }]
expect = [0, 2]
"#
        .to_string()
    }
}

/// First index in `indices` at or above `limit` is an error.
fn check_indices<'a>(
    tag: u32,
    field: &'static str,
    mut indices: impl Iterator<Item = &'a usize>,
    limit: usize,
) -> Result<(), ScenarioError> {
    match indices.find(|&&index| index >= limit) {
        Some(&index) => Err(ScenarioError::DestinationOutOfRange { tag, field, index, limit }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> ScenarioResult {
        Scenario::parse(text).unwrap().run(&Config::default()).unwrap()
    }

    #[test]
    fn test_sample_scenario_passes() {
        let result = run(&Scenario::sample_scenario());
        assert!(result.passed, "{:?}", result.mismatches);
        assert_eq!(result.injected, 7);
        assert_eq!(result.deliveries.len(), 8);

        // Multicast copies only leave after output 2's credits come back
        let copies: Vec<_> = result.deliveries.iter().filter(|d| d.flit.packet_id == 3).collect();
        assert_eq!(copies.len(), 2);
        assert_eq!(copies[0].cycle, copies[1].cycle);
        assert!(copies[0].cycle > 10);
    }

    #[test]
    fn test_bundled_scenarios_pass() {
        let bundled = [
            include_str!("../../scenarios/unicast.toml"),
            include_str!("../../scenarios/contention.toml"),
            include_str!("../../scenarios/multicast_starvation.toml"),
            include_str!("../../scenarios/lut_multicast.toml"),
            include_str!("../../scenarios/virtual_channels.toml"),
        ];
        for text in bundled {
            let result = run(text);
            assert!(result.passed, "{}: {:?}", result.name, result.mismatches);
        }
    }

    #[test]
    fn test_mismatch_reported() {
        let result = run(r#"
            name = "wrong-port"
            [router]
            local_ports = 2
            remote_ports = 2
            [[packet]]
            port = 0
            tag = 1
            hops = [{ local = [1] }]
            expect = [0]
        "#);
        assert!(!result.passed);
        assert_eq!(
            result.mismatches,
            vec![
                Mismatch { tag: 1, port: 0, expected: 1, got: 0 },
                Mismatch { tag: 1, port: 1, expected: 0, got: 1 },
            ]
        );
    }

    #[test]
    fn test_timeout_reported() {
        let result = run(r#"
            name = "stuck"
            max_ticks = 20
            [router]
            local_ports = 2
            remote_ports = 2
            buffer_depth = 1
            [[sink]]
            port = 1
            hold_credits = true
            [[packet]]
            port = 0
            tag = 1
            hops = [{ local = [1] }]
            body = [1, 2]
        "#);
        assert!(result.timed_out);
        assert!(!result.passed);
        assert_eq!(result.ticks, 20);
    }

    #[test]
    fn test_lut_headers() {
        let scenario = Scenario::parse(r#"
            name = "lut"
            [router]
            local_ports = 2
            remote_ports = 2
            [router.routing]
            mode = "lut"
            group_id = 1
            local_routes = [1, 2]
            remote_routes = [4, 0, 8]
        "#)
        .unwrap();
        let config = scenario.router_config(&Config::default());

        let unicast = PacketDef { local: Some(1), ..PacketDef::default() };
        assert_eq!(scenario.header(&unicast, &config).unwrap(), 0b01_1);

        let multicast = PacketDef {
            multicast_locals: vec![0],
            multicast_groups: vec![0, 2],
            ..PacketDef::default()
        };
        assert_eq!(scenario.header(&multicast, &config).unwrap(), 0b1_01_101);

        let hops = PacketDef { hops: vec![HopDef::default()], ..PacketDef::default() };
        assert!(matches!(
            scenario.header(&hops, &config),
            Err(ScenarioError::RouteMode { given: "source", mode: "lut", .. })
        ));
    }

    #[test]
    fn test_invalid_packets() {
        let base = r#"
            name = "bad"
            [router]
            local_ports = 1
            remote_ports = 1
        "#;
        let err = |packets: &str| {
            Scenario::parse(&format!("{}{}", base, packets))
                .unwrap()
                .run(&Config::default())
                .unwrap_err()
        };

        assert!(matches!(
            err("[[packet]]\nport = 5\ntag = 1\nheader = 1\n"),
            ScenarioError::BadPort { port: 5, .. }
        ));
        assert!(matches!(
            err("[[packet]]\ntag = 1\nvc = 1\nheader = 1\n"),
            ScenarioError::BadVirtualChannel { vc: 1, .. }
        ));
        assert!(matches!(
            err("[[packet]]\ntag = 1\nheader = 1\n[[packet]]\ntag = 1\nheader = 1\n"),
            ScenarioError::DuplicatePacket { tag: 1, .. }
        ));
        assert!(matches!(err("[[packet]]\ntag = 4\n"), ScenarioError::MissingRoute { tag: 4 }));
        assert!(matches!(
            err("[[packet]]\ntag = 1\nhops = [{ remote = 0 }]\n"),
            ScenarioError::Route { tag: 1, .. }
        ));
        assert!(matches!(
            err("[[packet]]\ntag = 1\nhops = [{ local = [70] }]\n"),
            ScenarioError::DestinationOutOfRange { field: "hops.local", index: 70, limit: 1, .. }
        ));
    }

    #[test]
    fn test_lut_destinations_out_of_range() {
        let base = r#"
            name = "lut-range"
            [router]
            local_ports = 2
            remote_ports = 2
            [router.routing]
            mode = "lut"
            group_id = 1
            local_routes = [1, 2]
            remote_routes = [4, 0, 8]
            multicast_local_width = 1
        "#;
        let err = |packet: &str| {
            Scenario::parse(&format!("{}[[packet]]\ntag = 1\n{}\n", base, packet))
                .unwrap()
                .run(&Config::default())
                .unwrap_err()
        };

        // Far past any port; must not reach the port mask
        assert!(matches!(
            err("multicast_locals = [70]"),
            ScenarioError::DestinationOutOfRange { field: "multicast_locals", index: 70, limit: 1, .. }
        ));
        // In the table but outside the multicast width
        assert!(matches!(
            err("multicast_locals = [1]"),
            ScenarioError::DestinationOutOfRange { field: "multicast_locals", index: 1, limit: 1, .. }
        ));
        assert!(matches!(
            err("multicast_groups = [0, 3]"),
            ScenarioError::DestinationOutOfRange { field: "multicast_groups", index: 3, limit: 3, .. }
        ));
        assert!(matches!(
            err("local = 2"),
            ScenarioError::DestinationOutOfRange { field: "local", index: 2, limit: 2, .. }
        ));
        assert!(matches!(
            err("local = 0\ngroup = 5"),
            ScenarioError::DestinationOutOfRange { field: "group", index: 5, limit: 3, .. }
        ));
    }

    #[test]
    fn test_tag_must_fit_beside_vc() {
        let text = |tag: u32| {
            format!(
                r#"
                name = "tags"
                [router]
                local_ports = 1
                remote_ports = 1
                virtual_channels = 2
                [[packet]]
                tag = {}
                header = 1
                "#,
                tag
            )
        };

        // Shifting this tag past the VC bit would alias packet id 0
        let err = Scenario::parse(&text(1 << 31)).unwrap().run(&Config::default()).unwrap_err();
        assert!(matches!(err, ScenarioError::TagTooWide { bits: 31, .. }));

        assert!(Scenario::parse(&text((1 << 31) - 1)).unwrap().run(&Config::default()).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = Scenario::from_file(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(matches!(err, ScenarioError::Io { .. }));
    }
}
