//! Configuration for noc-router.
//!
//! Two layers live here:
//!
//! - [`RouterConfig`]: the parameters of one router (ports, VCs, buffer
//!   depths, routing mode and tables). Read once at construction and
//!   validated by [`RouterConfig::validate`].
//! - [`Config`]: tool-level settings for the `noc-router` binary, loaded
//!   from multiple sources in priority order:
//!   1. Environment variables (`NOC_ROUTER_MAX_TICKS`, `NOC_ROUTER_LOG`)
//!   2. Project-local config file (`./noc-router.toml`)
//!   3. User config file (`~/.config/noc-router/config.toml`)
//!   4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # noc-router.toml
//!
//! # Stop scenarios that have not drained after this many ticks
//! max_ticks = 10000
//!
//! # env_logger filter used when RUST_LOG is unset
//! log_filter = "noc_router=debug"
//!
//! # Router used by scenarios that do not define their own
//! [router]
//! local_ports = 2
//! remote_ports = 2
//! buffer_depth = 4
//!
//! [router.routing]
//! mode = "source"
//! max_hops = 8
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::router::routing;
use crate::router::ArbiterKind;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Widest port mask a flit route can name.
pub const MAX_PORTS: usize = 64;

/// Upper bound on virtual channels per port.
pub const MAX_VIRTUAL_CHANNELS: usize = 256;

/// Default tick limit for scenario runs.
pub const DEFAULT_MAX_TICKS: u64 = 10_000;

/// Which routing table an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTier {
    Local,
    Remote,
}

impl fmt::Display for RouteTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTier::Local => write!(f, "local"),
            RouteTier::Remote => write!(f, "remote"),
        }
    }
}

/// Invalid router configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Router needs at least one port")]
    NoPorts,

    #[error("{ports} ports exceed the maximum of {}", MAX_PORTS)]
    TooManyPorts { ports: usize },

    #[error("Router needs at least one virtual channel")]
    ZeroVirtualChannels,

    #[error("{vcs} virtual channels exceed the maximum of {}", MAX_VIRTUAL_CHANNELS)]
    TooManyVirtualChannels { vcs: usize },

    #[error("Buffer depth must be non-zero")]
    ZeroBufferDepth,

    #[error("Egress staging depth must be non-zero")]
    ZeroEgressDepth,

    #[error("Channel depth must be non-zero")]
    ZeroChannelDepth,

    #[error("Max packet size {max_packet_size} must be in 1..={egress_depth} (egress staging depth)")]
    InvalidMaxPacketSize { max_packet_size: usize, egress_depth: usize },

    #[error("Source routing needs at least one hop")]
    ZeroMaxHops,

    #[error("Routing field needs {bits} bits, payload has 64")]
    RouteTooWide { bits: usize },

    #[error("Expected {expected} routing mode")]
    WrongRoutingMode { expected: &'static str },

    #[error("The {tier} route table is empty")]
    EmptyRouteTable { tier: RouteTier },

    #[error("Group id {group_id} is outside the {groups}-entry remote table")]
    GroupIdOutOfRange { group_id: usize, groups: usize },

    #[error("Entry {index} of the {tier} route table ({mask:#x}) names ports beyond {ports}")]
    RouteMaskOutOfRange { tier: RouteTier, index: usize, mask: u64, ports: usize },

    #[error("Multicast local width {width} exceeds the {entries}-entry local table")]
    MulticastWidthTooLarge { width: usize, entries: usize },

    #[error("Unicast header needs {unicast_bits} bits, overlapping the multicast flag at bit {flag_bit}")]
    LayoutOverlap { unicast_bits: u32, flag_bit: u32 },
}

/// Routing mode and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingConfig {
    /// Hop-by-hop descriptors carried in the header
    Source {
        #[serde(default = "default_max_hops")]
        max_hops: usize,
    },
    /// Two-tier lookup tables with multicast
    Lut {
        /// This router's group
        group_id: usize,
        /// Port masks for destinations within our group
        local_routes: Vec<u64>,
        /// Port masks toward each group
        remote_routes: Vec<u64>,
        /// Local entries addressable by multicast (all of them if unset)
        #[serde(default)]
        multicast_local_width: Option<usize>,
    },
}

fn default_max_hops() -> usize {
    8
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig::Source { max_hops: default_max_hops() }
    }
}

/// Parameters of one router.
///
/// Ports `0..local_ports` are local; the remote ports follow. Ingress and
/// egress port numbering is the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Local ports (cores, DMAs)
    pub local_ports: usize,
    /// Remote ports (links to neighbouring routers)
    pub remote_ports: usize,
    /// Virtual channels per port
    pub virtual_channels: usize,
    /// Input buffer slots per (port, VC); also the initial credit count
    pub buffer_depth: usize,
    /// Egress staging slots per output
    pub egress_depth: usize,
    /// Longest packet in flits. When set, a multicast header waits for
    /// this many free staging slots on every destination.
    pub max_packet_size: Option<usize>,
    /// Capacity of each ingress, egress and credit channel
    pub channel_depth: usize,
    /// Per-output arbitration policy
    pub arbiter: ArbiterKind,
    /// Routing mode
    pub routing: RoutingConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_ports: 1,
            remote_ports: 4,
            virtual_channels: 1,
            buffer_depth: 4,
            egress_depth: 1,
            max_packet_size: None,
            channel_depth: 1,
            arbiter: ArbiterKind::RoundRobin,
            routing: RoutingConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Total ports (local + remote).
    pub fn num_ports(&self) -> usize {
        self.local_ports + self.remote_ports
    }

    /// Check every parameter, including the routing tables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ports = self.num_ports();
        if ports == 0 {
            return Err(ConfigError::NoPorts);
        }
        if ports > MAX_PORTS {
            return Err(ConfigError::TooManyPorts { ports });
        }
        if self.virtual_channels == 0 {
            return Err(ConfigError::ZeroVirtualChannels);
        }
        if self.virtual_channels > MAX_VIRTUAL_CHANNELS {
            return Err(ConfigError::TooManyVirtualChannels { vcs: self.virtual_channels });
        }
        if self.buffer_depth == 0 {
            return Err(ConfigError::ZeroBufferDepth);
        }
        if self.egress_depth == 0 {
            return Err(ConfigError::ZeroEgressDepth);
        }
        if self.channel_depth == 0 {
            return Err(ConfigError::ZeroChannelDepth);
        }
        if let Some(max_packet_size) = self.max_packet_size {
            if max_packet_size == 0 || max_packet_size > self.egress_depth {
                return Err(ConfigError::InvalidMaxPacketSize {
                    max_packet_size,
                    egress_depth: self.egress_depth,
                });
            }
        }

        routing::build_policy(self).map(|_| ())
    }
}

/// noc-router tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Tick limit for scenario runs.
    pub max_ticks: Option<u64>,

    /// env_logger filter applied when RUST_LOG is unset.
    pub log_filter: Option<String>,

    /// Router used by scenarios without a `[router]` table.
    pub router: Option<RouterConfig>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `noc-router.toml`
    /// 3. User config `~/.config/noc-router/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    pub fn max_ticks(&self) -> u64 {
        self.max_ticks.unwrap_or(DEFAULT_MAX_TICKS)
    }

    pub fn log_filter(&self) -> String {
        self.log_filter.clone().unwrap_or_else(|| "warn".to_string())
    }

    /// Router configuration, falling back to [`RouterConfig::default`].
    pub fn router(&self) -> RouterConfig {
        self.router.clone().unwrap_or_default()
    }

    fn load_user_config() -> Option<Self> {
        Self::load_from_file(&Self::user_config_path()?)
    }

    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("noc-router.toml"))
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.max_ticks.is_some() {
            self.max_ticks = other.max_ticks;
        }
        if other.log_filter.is_some() {
            self.log_filter = other.log_filter;
        }
        if other.router.is_some() {
            self.router = other.router;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("NOC_ROUTER_MAX_TICKS") {
            match value.parse() {
                Ok(ticks) => {
                    log::info!("Using NOC_ROUTER_MAX_TICKS from environment: {}", ticks);
                    self.max_ticks = Some(ticks);
                }
                Err(e) => log::warn!("Ignoring NOC_ROUTER_MAX_TICKS={:?}: {}", value, e),
            }
        }
        if let Ok(filter) = std::env::var("NOC_ROUTER_LOG") {
            log::info!("Using NOC_ROUTER_LOG from environment: {}", filter);
            self.log_filter = Some(filter);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("noc-router").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# noc-router configuration
# Place this file at ~/.config/noc-router/config.toml or ./noc-router.toml

# Stop scenarios that have not drained after this many ticks
max_ticks = 10000

# Log filter used when RUST_LOG is unset
# log_filter = "noc_router=debug"

# Default router for scenarios without their own [router] table
[router]
local_ports = 2
remote_ports = 2
virtual_channels = 2
buffer_depth = 4
egress_depth = 1
channel_depth = 1
arbiter = "round_robin"

[router.routing]
mode = "source"
max_hops = 8

# Table routing instead:
# [router.routing]
# mode = "lut"
# group_id = 0
# local_routes = [0x1, 0x2]
# remote_routes = [0x0, 0x4, 0x8]
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.max_ticks(), DEFAULT_MAX_TICKS);
        assert_eq!(config.log_filter(), "warn");
        assert_eq!(config.router(), RouterConfig::default());
        assert!(RouterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            max_ticks: Some(100),
            log_filter: None,
            router: Some(RouterConfig::default()),
        };

        let overlay = Config {
            max_ticks: None,
            log_filter: Some("debug".to_string()),
            router: Some(RouterConfig { buffer_depth: 2, ..RouterConfig::default() }),
        };

        base.merge(overlay);

        // max_ticks unchanged (overlay was None)
        assert_eq!(base.max_ticks, Some(100));
        assert_eq!(base.log_filter, Some("debug".to_string()));
        // router replaced wholesale
        assert_eq!(base.router().buffer_depth, 2);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        let router = config.router();
        assert_eq!(router.num_ports(), 4);
        assert_eq!(router.virtual_channels, 2);
        assert_eq!(router.routing, RoutingConfig::Source { max_hops: 8 });
        router.validate().unwrap();
    }

    #[test]
    fn test_lut_routing_parses() {
        let text = r#"
            local_ports = 2
            remote_ports = 2
            [routing]
            mode = "lut"
            group_id = 1
            local_routes = [1, 2]
            remote_routes = [4, 0, 8]
        "#;
        let router: RouterConfig = toml::from_str(text).unwrap();
        assert_eq!(
            router.routing,
            RoutingConfig::Lut {
                group_id: 1,
                local_routes: vec![1, 2],
                remote_routes: vec![4, 0, 8],
                multicast_local_width: None,
            }
        );
        // Omitted fields take defaults
        assert_eq!(router.buffer_depth, 4);
        router.validate().unwrap();
    }

    #[test]
    fn test_validation_errors() {
        let base = RouterConfig::default();

        let bad = RouterConfig { local_ports: 0, remote_ports: 0, ..base.clone() };
        assert_eq!(bad.validate(), Err(ConfigError::NoPorts));

        let bad = RouterConfig { local_ports: 60, remote_ports: 5, ..base.clone() };
        assert_eq!(bad.validate(), Err(ConfigError::TooManyPorts { ports: 65 }));

        let bad = RouterConfig { virtual_channels: 0, ..base.clone() };
        assert_eq!(bad.validate(), Err(ConfigError::ZeroVirtualChannels));

        let bad = RouterConfig { buffer_depth: 0, ..base.clone() };
        assert_eq!(bad.validate(), Err(ConfigError::ZeroBufferDepth));

        let bad = RouterConfig { max_packet_size: Some(4), egress_depth: 2, ..base.clone() };
        assert_eq!(
            bad.validate(),
            Err(ConfigError::InvalidMaxPacketSize { max_packet_size: 4, egress_depth: 2 })
        );

        let bad = RouterConfig { routing: RoutingConfig::Source { max_hops: 30 }, ..base.clone() };
        assert!(matches!(bad.validate(), Err(ConfigError::RouteTooWide { .. })));

        let bad = RouterConfig {
            routing: RoutingConfig::Lut {
                group_id: 0,
                local_routes: vec![1],
                remote_routes: vec![0x40],
                multicast_local_width: None,
            },
            ..base
        };
        assert!(matches!(bad.validate(), Err(ConfigError::RouteMaskOutOfRange { .. })));
    }
}
