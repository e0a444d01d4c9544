//! Network view of remotely advertised agents: capability and ASN indexes
//! over the routes learned from peers, with staleness sweeping and
//! capability lookups. The consumer side of the control plane.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use log::{debug, trace};
use serde::Serialize;

use crate::config::DiscoveryConfig;
use crate::rib::{AgentId, Asn, HealthStatus, Route};

/// A remote agent as currently known
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAgentRecord {
    pub agent_id: AgentId,
    pub capabilities: Vec<String>,
    pub health: HealthStatus,
    pub local_pref: u32,
    pub med: u32,
    pub as_path: Vec<Asn>,
    pub next_hop: String,
    /// Most recent advertiser
    pub source_asn: Asn,
    pub last_updated: DateTime<Utc>,
}

impl NetworkAgentRecord {
    pub fn from_route(route: &Route) -> Self {
        Self {
            agent_id: route.agent_id.clone(),
            capabilities: route.capabilities.clone(),
            health: route.health(),
            local_pref: route.local_pref,
            med: route.med,
            as_path: route.as_path.clone(),
            next_hop: route.next_hop.clone(),
            source_asn: route.first_as().unwrap_or(0),
            last_updated: Utc::now(),
        }
    }

    /// Differences that warrant replacing the stored record
    fn differs_from(&self, other: &NetworkAgentRecord) -> bool {
        let mine: HashSet<String> = self.capabilities.iter().map(|c| c.to_lowercase()).collect();
        let theirs: HashSet<String> = other
            .capabilities
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        mine != theirs
            || self.health != other.health
            || self.local_pref != other.local_pref
            || self.med != other.med
            || self.as_path.len() != other.as_path.len()
    }
}

/// Candidate ordering for lookups: higher localPref, shorter path, lower
/// MED, most recently seen
pub fn rank_candidates(records: Vec<NetworkAgentRecord>) -> Vec<NetworkAgentRecord> {
    records
        .into_iter()
        .sorted_by(|a, b| {
            b.local_pref
                .cmp(&a.local_pref)
                .then_with(|| a.as_path.len().cmp(&b.as_path.len()))
                .then_with(|| a.med.cmp(&b.med))
                .then_with(|| b.last_updated.cmp(&a.last_updated))
        })
        .collect()
}

#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    Discovered(NetworkAgentRecord),
    Changed(NetworkAgentRecord),
    Lost { agent_id: AgentId, source_asn: Asn },
}

pub struct DiscoveryManager {
    local_asn: Asn,
    config: DiscoveryConfig,
    by_capability: HashMap<String, HashSet<AgentId>>,
    by_asn: HashMap<Asn, HashSet<AgentId>>,
    by_agent: HashMap<AgentId, NetworkAgentRecord>,
    /// Routes dropped on ingress for being malformed
    dropped_malformed: u64,
}

impl DiscoveryManager {
    pub fn new(local_asn: Asn, config: DiscoveryConfig) -> Self {
        Self {
            local_asn,
            config,
            by_capability: HashMap::new(),
            by_asn: HashMap::new(),
            by_agent: HashMap::new(),
            dropped_malformed: 0,
        }
    }

    fn passes_filters(&mut self, route: &Route) -> bool {
        if route.is_malformed() {
            self.dropped_malformed += 1;
            trace!("Discovery dropped malformed route for '{}'", route.agent_id);
            return false;
        }
        // Our own advertisements echoed back
        if route.first_as() == Some(self.local_asn) {
            return false;
        }
        if route.health() < self.config.health_threshold {
            return false;
        }
        if !self.config.capability_filters.is_empty() {
            let matched = route.capabilities.iter().any(|capability| {
                let lowered = capability.to_lowercase();
                self.config
                    .capability_filters
                    .iter()
                    .any(|filter| lowered.contains(&filter.to_lowercase()))
            });
            if !matched {
                return false;
            }
        }
        true
    }

    fn index(&mut self, record: &NetworkAgentRecord) {
        for capability in &record.capabilities {
            self.by_capability
                .entry(capability.to_lowercase())
                .or_insert_with(HashSet::new)
                .insert(record.agent_id.clone());
        }
        self.by_asn
            .entry(record.source_asn)
            .or_insert_with(HashSet::new)
            .insert(record.agent_id.clone());
    }

    fn unindex(&mut self, record: &NetworkAgentRecord) {
        for capability in &record.capabilities {
            if let Some(agents) = self.by_capability.get_mut(&capability.to_lowercase()) {
                agents.remove(&record.agent_id);
                if agents.is_empty() {
                    self.by_capability.remove(&capability.to_lowercase());
                }
            }
        }
        if let Some(agents) = self.by_asn.get_mut(&record.source_asn) {
            agents.remove(&record.agent_id);
            if agents.is_empty() {
                self.by_asn.remove(&record.source_asn);
            }
        }
    }

    /// Consume an advertisement. Returns the event to publish, if any.
    pub fn observe_route(&mut self, route: &Route) -> Option<DiscoveryEvent> {
        if !self.passes_filters(route) {
            return None;
        }
        let incoming = NetworkAgentRecord::from_route(route);
        match self.by_agent.get(&route.agent_id) {
            Some(existing) if existing.differs_from(&incoming) => {
                let existing = existing.clone();
                self.unindex(&existing);
                self.index(&incoming);
                self.by_agent
                    .insert(route.agent_id.clone(), incoming.clone());
                Some(DiscoveryEvent::Changed(incoming))
            }
            Some(_) => {
                // Same view; just refresh the staleness clock
                if let Some(record) = self.by_agent.get_mut(&route.agent_id) {
                    record.last_updated = Utc::now();
                }
                None
            }
            None => {
                self.index(&incoming);
                self.by_agent
                    .insert(route.agent_id.clone(), incoming.clone());
                debug!(
                    "Discovered '{}' via AS{} [{}]",
                    incoming.agent_id,
                    incoming.source_asn,
                    incoming.capabilities.join(",")
                );
                Some(DiscoveryEvent::Discovered(incoming))
            }
        }
    }

    /// Withdraw one agent from the network view
    pub fn remove_agent(&mut self, agent_id: &str) -> Option<DiscoveryEvent> {
        let record = self.by_agent.remove(agent_id)?;
        self.unindex(&record);
        Some(DiscoveryEvent::Lost {
            agent_id: record.agent_id,
            source_asn: record.source_asn,
        })
    }

    /// Peer went away: drop everything it sourced
    pub fn remove_peer(&mut self, asn: Asn) -> Vec<DiscoveryEvent> {
        let agent_ids: Vec<AgentId> = self
            .by_asn
            .get(&asn)
            .map(|agents| agents.iter().cloned().collect())
            .unwrap_or_default();
        agent_ids
            .iter()
            .filter_map(|agent_id| self.remove_agent(agent_id))
            .collect()
    }

    /// Staleness sweep: records silent past the threshold are dropped
    pub fn sweep(&mut self) -> Vec<DiscoveryEvent> {
        let cutoff = Utc::now() - Duration::seconds(self.config.stale_after as i64);
        let stale: Vec<AgentId> = self
            .by_agent
            .values()
            .filter(|record| record.last_updated < cutoff)
            .map(|record| record.agent_id.clone())
            .collect();
        if !stale.is_empty() {
            debug!("Discovery sweep removing {} stale agents", stale.len());
        }
        stale
            .iter()
            .filter_map(|agent_id| self.remove_agent(agent_id))
            .collect()
    }

    /// Cached capability lookup, best candidates first
    pub fn find_by_capability(
        &self,
        capability: &str,
        health_filter: Option<HealthStatus>,
        max_results: usize,
    ) -> Vec<NetworkAgentRecord> {
        let minimum = health_filter.unwrap_or(HealthStatus::Unhealthy);
        let matches = self
            .by_capability
            .get(&capability.to_lowercase())
            .into_iter()
            .flatten()
            .filter_map(|agent_id| self.by_agent.get(agent_id))
            .filter(|record| record.health >= minimum)
            .cloned()
            .collect();
        rank_candidates(matches)
            .into_iter()
            .take(max_results)
            .collect()
    }

    pub fn get(&self, agent_id: &str) -> Option<NetworkAgentRecord> {
        self.by_agent.get(agent_id).cloned()
    }

    pub fn agents_for_asn(&self, asn: Asn) -> Vec<NetworkAgentRecord> {
        self.by_asn
            .get(&asn)
            .into_iter()
            .flatten()
            .filter_map(|agent_id| self.by_agent.get(agent_id))
            .cloned()
            .collect()
    }

    pub fn records(&self) -> Vec<NetworkAgentRecord> {
        self.by_agent.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_agent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_agent.is_empty()
    }

    pub fn dropped_malformed(&self) -> u64 {
        self.dropped_malformed
    }

    pub fn broadcast_enabled(&self) -> bool {
        self.config.broadcast
    }

    pub fn broadcast_ttl(&self) -> u8 {
        self.config.broadcast_ttl
    }

    pub fn broadcast_timeout(&self) -> u64 {
        self.config.broadcast_timeout
    }
}
