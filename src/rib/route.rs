use std::collections::HashMap;
use std::fmt;
use std::slice::Iter;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Autonomous System Number identifying an agent server
pub type Asn = u32;
/// Opaque agent identifier, unique within an AS
pub type AgentId = String;

pub const DEFAULT_LOCAL_PREF: u32 = 100;
pub const DEFAULT_MED: u32 = 0;
pub const MAX_AS_PATH_LENGTH: usize = 10;

/// Path attribute names set by route reflectors
pub const ATTR_ORIGINATOR_ID: &str = "originatorId";
pub const ATTR_CLUSTER_ID: &str = "clusterId";
/// Community appended to every reflected route
pub const REFLECTED_COMMUNITY: &str = "rr:reflected";

/// Agent health, as carried in the `health:*` community.
/// Ordering is by preference: Healthy > Degraded > Unhealthy
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Healthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        write!(f, "{}", word)
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "unhealthy" => Ok(HealthStatus::Unhealthy),
            _ => Err(format!("Unsupported health status: '{}'", value)),
        }
    }
}

/// Communities are `namespace:value` tags (E.g. "health:degraded", "as:65001")
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CommunityList(pub Vec<String>);

impl CommunityList {
    pub fn iter(&self) -> Iter<String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, community: &str) -> bool {
        self.0.iter().any(|c| c == community)
    }

    /// Add a community, keeping the list duplicate-free
    pub fn add(&mut self, community: &str) {
        if !self.contains(community) {
            self.0.push(community.to_string());
        }
    }

    pub fn remove(&mut self, community: &str) {
        self.0.retain(|c| c != community);
    }

    /// Values carried under a namespace prefix
    /// E.g. with_namespace("capability") -> ["coding", "weather"]
    pub fn with_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a str> {
        self.0.iter().filter_map(move |c| {
            c.split_once(':')
                .filter(|(ns, _)| *ns == namespace)
                .map(|(_, value)| value)
        })
    }

    /// Health carried in the `health:*` community; absent means healthy
    pub fn health(&self) -> HealthStatus {
        self.with_namespace("health")
            .next()
            .and_then(|value| value.parse().ok())
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl From<Vec<String>> for CommunityList {
    fn from(communities: Vec<String>) -> Self {
        let mut list = CommunityList::default();
        for community in &communities {
            list.add(community);
        }
        list
    }
}

impl fmt::Display for CommunityList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// The central record: how to reach an agent, and how preferred the path is
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub agent_id: AgentId,
    pub capabilities: Vec<String>,
    /// Ordered ASN hops, leftmost is the most recent advertiser
    pub as_path: Vec<Asn>,
    /// URL at which the agent is reachable
    pub next_hop: String,
    #[serde(default = "default_local_pref")]
    pub local_pref: u32,
    #[serde(default)]
    pub med: u32,
    #[serde(default)]
    pub communities: CommunityList,
    pub origin_time: DateTime<Utc>,
    #[serde(default)]
    pub path_attributes: HashMap<String, Value>,
}

fn default_local_pref() -> u32 {
    DEFAULT_LOCAL_PREF
}

impl Route {
    pub fn new(agent_id: &str, capabilities: Vec<String>, next_hop: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            capabilities,
            as_path: Vec::new(),
            next_hop: next_hop.to_string(),
            local_pref: DEFAULT_LOCAL_PREF,
            med: DEFAULT_MED,
            communities: CommunityList::default(),
            origin_time: Utc::now(),
            path_attributes: HashMap::new(),
        }
    }

    /// Most recent advertiser (leftmost AS-path entry)
    pub fn first_as(&self) -> Option<Asn> {
        self.as_path.first().copied()
    }

    pub fn contains_as(&self, asn: Asn) -> bool {
        self.as_path.contains(&asn)
    }

    /// Loop iff any ASN appears more than once
    pub fn has_as_loop(&self) -> bool {
        self.as_path
            .iter()
            .enumerate()
            .any(|(idx, asn)| self.as_path[..idx].contains(asn))
    }

    /// Prepend an ASN unless it is already the leftmost hop
    pub fn prepend_as(&mut self, asn: Asn) {
        if self.first_as() != Some(asn) {
            self.as_path.insert(0, asn);
        }
    }

    pub fn health(&self) -> HealthStatus {
        self.communities.health()
    }

    /// Case-insensitive capability membership
    pub fn has_capability(&self, capability: &str) -> bool {
        let wanted = capability.to_lowercase();
        self.capabilities.iter().any(|c| c.to_lowercase() == wanted)
    }

    /// A route is malformed if it is missing the fields every
    /// advertisement must carry
    pub fn is_malformed(&self) -> bool {
        self.agent_id.is_empty() || self.as_path.is_empty() || self.capabilities.is_empty()
    }

    pub fn set_attribute(&mut self, name: &str, value: Value) {
        self.path_attributes.insert(name.to_string(), value);
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.path_attributes.get(name)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let path = self
            .as_path
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<String>>()
            .join(" ");
        write!(
            f,
            "<Route {} via {} path=[{}] lp={} med={}>",
            self.agent_id, self.next_hop, path, self.local_pref, self.med
        )
    }
}
