mod file;

pub use file::AgentSpec;

use std::env;
use std::error;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use file::ServerConfigSpec;

use crate::reflector::PeerType;
use crate::rib::{Asn, HealthStatus};
use crate::utils::{host_port_from_url, parse_server_list};

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    /// Timer combination the protocol cannot run with. [reason]
    InvalidTimer(String),
    /// Unusable ASN. [reason]
    InvalidAsn(String),
    /// Unusable peer or local address. [reason]
    InvalidAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Config Error: ")?;
        use ConfigError::*;
        match self {
            Io(reason) => write!(f, "{}", reason),
            Parse(reason) => write!(f, "{}", reason),
            InvalidTimer(reason) => write!(f, "invalid timer: {}", reason),
            InvalidAsn(reason) => write!(f, "invalid ASN: {}", reason),
            InvalidAddress(reason) => write!(f, "invalid address: {}", reason),
        }
    }
}

impl error::Error for ConfigError {}

/// In-memory representation of a peer, with server-wide defaults applied
#[derive(Debug)]
pub struct PeerConfig {
    /// Remote AS; 0 accepts whatever ASN the peer's OPEN carries
    pub asn: Asn,
    /// host:port the peering session dials
    pub address: String,
    pub name: String,
    pub enabled: bool,
    pub passive: bool,
    pub hold_time: u64,
    pub peer_type: PeerType,
    pub local_asn: Asn,
    pub local_router_id: String,
}

impl PeerConfig {
    /// Does the configured ASN allow this OPEN-announced one
    pub fn accepts_asn(&self, asn: Asn) -> bool {
        self.asn == 0 || self.asn == asn
    }
}

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub sweep_interval: u64,
    pub stale_after: u64,
    pub health_threshold: HealthStatus,
    pub capability_filters: Vec<String>,
    pub broadcast: bool,
    pub broadcast_ttl: u8,
    pub broadcast_timeout: u64,
}

#[derive(Clone, Debug)]
pub struct BalancerConfig {
    pub max_paths: usize,
    pub strategy: String,
}

#[derive(Clone, Debug)]
pub struct ReflectorConfig {
    pub enabled: bool,
    pub cluster_id: String,
    pub policy_path: Option<String>,
}

/// Environment inputs, read once at startup
#[derive(Debug, Default)]
pub struct EnvOverrides {
    pub agent_servers: Option<String>,
    pub asn: Option<String>,
    pub hold_time: Option<String>,
    pub keepalive_interval: Option<String>,
    pub connect_retry_time: Option<String>,
    pub api_port: Option<String>,
}

impl EnvOverrides {
    pub fn from_system() -> Self {
        Self {
            agent_servers: env::var("AGENT_SERVERS").ok(),
            asn: env::var("BGP_ASN").ok(),
            hold_time: env::var("BGP_HOLD_TIME").ok(),
            keepalive_interval: env::var("BGP_KEEPALIVE_INTERVAL").ok(),
            connect_retry_time: env::var("BGP_CONNECT_RETRY_TIME").ok(),
            api_port: env::var("MCP_SERVER_PORT").ok(),
        }
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    pub local_asn: Asn,
    pub router_id: String,
    pub listen_address: IpAddr,
    pub listen_port: u16,
    pub api_port: u16,
    /// Next hop advertised for locally registered agents
    pub local_url: String,
    pub hold_time: u64,
    pub keepalive_interval: u64,
    pub connect_retry_time: u64,
    pub default_local_pref: u32,
    pub refresh_interval: u64,
    pub policy_path: Option<String>,
    pub policy_history: usize,
    pub peers: Vec<Arc<PeerConfig>>,
    pub agents: Vec<AgentSpec>,
    pub discovery: DiscoveryConfig,
    pub balancer: BalancerConfig,
    pub reflector: ReflectorConfig,
}

impl ServerConfig {
    /// Parse a TOML config file (if given), apply environment overrides,
    /// and validate. Invalid configuration refuses to start the server.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let spec = match path {
            Some(path) => ServerConfigSpec::from_file(path)?,
            None => ServerConfigSpec::empty(),
        };
        Self::from_spec(spec, EnvOverrides::from_system())
    }

    fn from_spec(spec: ServerConfigSpec, overrides: EnvOverrides) -> Result<Self, ConfigError> {
        let listen_port = spec.listen_port;
        let api_port = match overrides.api_port {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidAddress(format!("MCP_SERVER_PORT '{}'", raw)))?,
            None => spec.api_port,
        };
        let local_asn = match overrides.asn {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidAsn(format!("BGP_ASN '{}'", raw)))?,
            // Derived from the peering port when not configured
            None => spec
                .local_asn
                .unwrap_or(64512 + u32::from(listen_port) % 1000),
        };
        let hold_time = parse_timer(overrides.hold_time, "BGP_HOLD_TIME", spec.hold_time)?;
        let keepalive_interval = parse_timer(
            overrides.keepalive_interval,
            "BGP_KEEPALIVE_INTERVAL",
            spec.keepalive_interval,
        )?;
        let connect_retry_time = parse_timer(
            overrides.connect_retry_time,
            "BGP_CONNECT_RETRY_TIME",
            spec.connect_retry_time,
        )?;

        if local_asn == 0 {
            return Err(ConfigError::InvalidAsn("local ASN must be non-zero".to_string()));
        }
        if hold_time != 0 {
            if keepalive_interval == 0 {
                return Err(ConfigError::InvalidTimer(
                    "keepalive interval must be non-zero when hold time is set".to_string(),
                ));
            }
            if hold_time < 3 * keepalive_interval {
                return Err(ConfigError::InvalidTimer(format!(
                    "hold time {}s must be at least 3x keepalive interval {}s",
                    hold_time, keepalive_interval
                )));
            }
        }
        if connect_retry_time == 0 {
            return Err(ConfigError::InvalidTimer(
                "connect retry time must be non-zero".to_string(),
            ));
        }

        let router_id = spec
            .router_id
            .unwrap_or_else(|| format!("as{}", local_asn));
        let local_url = spec
            .local_url
            .unwrap_or_else(|| format!("http://{}:{}", spec.listen_address, api_port));

        let mut peers: Vec<Arc<PeerConfig>> = Vec::with_capacity(spec.peers.len());
        for (index, peer) in spec.peers.iter().enumerate() {
            if peer.address.trim().is_empty() {
                return Err(ConfigError::InvalidAddress(format!(
                    "peer #{} has an empty address",
                    index + 1
                )));
            }
            peers.push(Arc::new(PeerConfig {
                asn: peer.asn,
                address: peer.address.clone(),
                name: peer
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("peer{}", index + 1)),
                enabled: peer.enabled,
                passive: peer.passive,
                hold_time: peer.hold_time.unwrap_or(hold_time),
                peer_type: peer.peer_type,
                local_asn,
                local_router_id: router_id.clone(),
            }));
        }

        // Seed peers from AGENT_SERVERS; ordinal names server1, server2, ...
        if let Some(raw) = overrides.agent_servers {
            for (index, url) in parse_server_list(&raw).iter().enumerate() {
                let address = host_port_from_url(url).ok_or_else(|| {
                    ConfigError::InvalidAddress(format!("AGENT_SERVERS entry '{}'", url))
                })?;
                if peers.iter().any(|p| p.address == address) {
                    continue;
                }
                peers.push(Arc::new(PeerConfig {
                    asn: 0,
                    address,
                    name: format!("server{}", index + 1),
                    enabled: true,
                    passive: false,
                    hold_time,
                    peer_type: PeerType::Ebgp,
                    local_asn,
                    local_router_id: router_id.clone(),
                }));
            }
        }

        let health_threshold = spec
            .discovery
            .health_threshold
            .parse::<HealthStatus>()
            .map_err(ConfigError::Parse)?;

        Ok(Self {
            local_asn,
            router_id: router_id.clone(),
            listen_address: spec.listen_address,
            listen_port,
            api_port,
            local_url,
            hold_time,
            keepalive_interval,
            connect_retry_time,
            default_local_pref: spec.default_local_pref,
            refresh_interval: spec.refresh_interval,
            policy_path: spec.policy_path,
            policy_history: spec.policy_history,
            peers,
            agents: spec.agents,
            discovery: DiscoveryConfig {
                sweep_interval: spec.discovery.sweep_interval,
                stale_after: spec.discovery.stale_after,
                health_threshold,
                capability_filters: spec.discovery.capability_filters,
                broadcast: spec.discovery.broadcast,
                broadcast_ttl: spec.discovery.broadcast_ttl,
                broadcast_timeout: spec.discovery.broadcast_timeout,
            },
            balancer: BalancerConfig {
                max_paths: spec.balancer.max_paths,
                strategy: spec.balancer.strategy,
            },
            reflector: ReflectorConfig {
                enabled: spec.reflector.enabled,
                cluster_id: spec
                    .reflector
                    .cluster_id
                    .unwrap_or_else(|| format!("rr-{}", router_id)),
                policy_path: spec.reflector.policy_path,
            },
        })
    }

    pub fn find_peer(&self, asn: Asn) -> Option<Arc<PeerConfig>> {
        self.peers
            .iter()
            .find(|p| p.asn == asn)
            .map(Arc::clone)
    }
}

fn parse_timer(raw: Option<String>, name: &str, fallback: u64) -> Result<u64, ConfigError> {
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidTimer(format!("{} '{}'", name, raw))),
        None => Ok(fallback),
    }
}
