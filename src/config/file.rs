use std::fs::File;
use std::io::Read;
use std::net::IpAddr;

use serde::Deserialize;

use super::ConfigError;
use crate::reflector::PeerType;
use crate::rib::Asn;

struct Defaults {}

impl Defaults {
    fn enabled() -> bool {
        true
    }

    fn passive() -> bool {
        false
    }

    fn listen_address() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    fn listen_port() -> u16 {
        1790
    }

    fn api_port() -> u16 {
        4210
    }

    fn hold_time() -> u64 {
        90
    }

    fn keepalive_interval() -> u64 {
        30
    }

    fn connect_retry_time() -> u64 {
        30
    }

    fn local_pref() -> u32 {
        100
    }

    fn refresh_interval() -> u64 {
        300
    }

    fn peer_type() -> PeerType {
        PeerType::Ebgp
    }

    fn sweep_interval() -> u64 {
        30
    }

    fn stale_after() -> u64 {
        300
    }

    fn health_threshold() -> String {
        "unhealthy".to_string()
    }

    fn broadcast() -> bool {
        true
    }

    fn broadcast_ttl() -> u8 {
        5
    }

    fn broadcast_timeout() -> u64 {
        5
    }

    fn max_paths() -> usize {
        4
    }

    fn strategy() -> String {
        "round-robin".to_string()
    }

    fn policy_history() -> usize {
        1000
    }
}

/// Config (toml) representation of a peer
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    /// 0 accepts whatever ASN the peer's OPEN carries (seed-server peers)
    #[serde(default)]
    pub(super) asn: Asn,
    /// host:port the peering session dials
    pub(super) address: String,
    pub(super) name: Option<String>,
    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,
    // Only listen for incoming sessions; don't dial out
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,
    // Defers to the server-wide value when absent
    pub(super) hold_time: Option<u64>,
    #[serde(default = "Defaults::peer_type")]
    pub(super) peer_type: PeerType,
}

/// Static local agent declared in the config file
#[derive(Clone, Debug, Deserialize)]
pub struct AgentSpec {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub local_pref: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct DiscoverySpec {
    #[serde(default = "Defaults::sweep_interval")]
    pub(super) sweep_interval: u64,
    #[serde(default = "Defaults::stale_after")]
    pub(super) stale_after: u64,
    /// Minimum acceptable health for learned routes
    #[serde(default = "Defaults::health_threshold")]
    pub(super) health_threshold: String,
    #[serde(default)]
    pub(super) capability_filters: Vec<String>,
    #[serde(default = "Defaults::broadcast")]
    pub(super) broadcast: bool,
    #[serde(default = "Defaults::broadcast_ttl")]
    pub(super) broadcast_ttl: u8,
    #[serde(default = "Defaults::broadcast_timeout")]
    pub(super) broadcast_timeout: u64,
}

impl Default for DiscoverySpec {
    fn default() -> Self {
        Self {
            sweep_interval: Defaults::sweep_interval(),
            stale_after: Defaults::stale_after(),
            health_threshold: Defaults::health_threshold(),
            capability_filters: Vec::new(),
            broadcast: Defaults::broadcast(),
            broadcast_ttl: Defaults::broadcast_ttl(),
            broadcast_timeout: Defaults::broadcast_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct BalancerSpec {
    #[serde(default = "Defaults::max_paths")]
    pub(super) max_paths: usize,
    #[serde(default = "Defaults::strategy")]
    pub(super) strategy: String,
}

impl Default for BalancerSpec {
    fn default() -> Self {
        Self {
            max_paths: Defaults::max_paths(),
            strategy: Defaults::strategy(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(super) struct ReflectorSpec {
    #[serde(default)]
    pub(super) enabled: bool,
    pub(super) cluster_id: Option<String>,
    // JSON array of reflector policies (accept = reflect, reject = no-reflect)
    pub(super) policy_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    // Local AS; when absent it is derived from the listen port
    pub(super) local_asn: Option<Asn>,
    pub(super) router_id: Option<String>,
    #[serde(default = "Defaults::listen_address")]
    pub(super) listen_address: IpAddr,
    // Peering listener
    #[serde(default = "Defaults::listen_port")]
    pub(super) listen_port: u16,
    // Control-plane listener
    #[serde(default = "Defaults::api_port")]
    pub(super) api_port: u16,
    // Advertised next hop for locally registered agents
    pub(super) local_url: Option<String>,
    #[serde(default = "Defaults::hold_time")]
    pub(super) hold_time: u64,
    #[serde(default = "Defaults::keepalive_interval")]
    pub(super) keepalive_interval: u64,
    #[serde(default = "Defaults::connect_retry_time")]
    pub(super) connect_retry_time: u64,
    #[serde(default = "Defaults::local_pref")]
    pub(super) default_local_pref: u32,
    #[serde(default = "Defaults::refresh_interval")]
    pub(super) refresh_interval: u64,
    // Path to a JSON array of policies; absent loads the built-in defaults
    pub(super) policy_path: Option<String>,
    // Policy decision history ring size
    #[serde(default = "Defaults::policy_history")]
    pub(super) policy_history: usize,
    #[serde(default)]
    pub(super) peers: Vec<PeerConfigSpec>,
    #[serde(default)]
    pub(super) agents: Vec<AgentSpec>,
    #[serde(default)]
    pub(super) discovery: DiscoverySpec,
    #[serde(default)]
    pub(super) balancer: BalancerSpec,
    #[serde(default)]
    pub(super) reflector: ReflectorSpec,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> Result<Self, ConfigError> {
        let mut file = File::open(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|err| ConfigError::Io(err.to_string()))?;
        Self::from_str(&contents)
    }

    pub(super) fn from_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub(super) fn empty() -> Self {
        Self::from_str("").expect("Empty spec parses from defaults")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = ServerConfigSpec::from_str(
            r#"
            local_asn = 65001
            listen_port = 1179
            local_url = "http://127.0.0.1:4111"

            [discovery]
            sweep_interval = 10
            health_threshold = "degraded"

            [balancer]
            strategy = "least-connections"

            [[peers]]
            asn = 65002
            address = "127.0.0.2:1179"
            peer_type = "ibgp-client"
            hold_time = 30

            [[peers]]
            address = "127.0.0.3:1179"
            passive = true

            [[agents]]
            agent_id = "coder"
            capabilities = ["coding"]
            local_pref = 150
            "#,
        )
        .unwrap();

        assert_eq!(config.local_asn, Some(65001));
        assert_eq!(config.listen_port, 1179);
        assert_eq!(config.hold_time, 90);
        assert_eq!(config.discovery.sweep_interval, 10);
        assert_eq!(config.balancer.strategy, "least-connections");
        assert_eq!(config.peers.len(), 2);

        let client = &config.peers[0];
        assert_eq!(client.asn, 65002);
        assert_eq!(client.peer_type, PeerType::IbgpClient);
        assert_eq!(client.hold_time, Some(30));

        let passive = &config.peers[1];
        assert_eq!(passive.asn, 0);
        assert!(passive.passive);
        assert_eq!(passive.peer_type, PeerType::Ebgp);

        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].local_pref, Some(150));
    }

    #[test]
    fn test_empty_spec_uses_defaults() {
        let config = ServerConfigSpec::empty();
        assert_eq!(config.hold_time, 90);
        assert_eq!(config.keepalive_interval, 30);
        assert_eq!(config.connect_retry_time, 30);
        assert_eq!(config.discovery.stale_after, 300);
        assert_eq!(config.balancer.max_paths, 4);
        assert!(!config.reflector.enabled);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        assert!(matches!(
            ServerConfigSpec::from_str("local_asn = \"not-a-number\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
