//! Local agent registry and route synthesis: the producer side of the
//! control plane. Registered agents become routes with the local AS as
//! origin; a periodic refresher re-reads dynamic agents through their
//! callbacks and unregisters the ones that are gone.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::rib::{AgentId, Asn, HealthStatus, Route};

/// Staleness penalty cap on the derived MED
const STALENESS_CAP: u32 = 50;

#[derive(Debug)]
pub enum AdvertiseError {
    /// No locally registered agent by that id. [agent id]
    UnknownAgent(AgentId),
    /// Registration payload is unusable. [reason]
    InvalidRegistration(String),
}

impl fmt::Display for AdvertiseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AdvertiseError::*;
        match self {
            UnknownAgent(agent_id) => write!(f, "No local agent named '{}'", agent_id),
            InvalidRegistration(reason) => write!(f, "Invalid registration: {}", reason),
        }
    }
}

impl error::Error for AdvertiseError {}

/// Registration payload; also the API DTO
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Absent means health is unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_pref: Option<u32>,
}

/// Partial update; unset fields keep their current values
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    pub capabilities: Option<Vec<String>>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub health_status: Option<HealthStatus>,
    pub local_pref: Option<u32>,
}

/// Current state reported by a dynamic-agent callback
#[derive(Clone, Debug)]
pub struct AgentState {
    pub capabilities: Vec<String>,
    pub health_status: Option<HealthStatus>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

/// Supplier the refresher invokes to obtain an agent's current state.
/// Returning None means the agent no longer exists.
#[async_trait]
pub trait AgentStateSource: Send + Sync {
    async fn current_state(&self, agent_id: &str) -> Option<AgentState>;
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAgent {
    pub agent_id: AgentId,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub health_status: Option<HealthStatus>,
    pub local_pref: u32,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Result of one refresher pass
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub refreshed: Vec<Route>,
    pub removed: Vec<AgentId>,
}

pub struct AdvertisementManager {
    local_asn: Asn,
    local_url: String,
    default_local_pref: u32,
    agents: HashMap<AgentId, LocalAgent>,
    callbacks: HashMap<AgentId, Arc<dyn AgentStateSource>>,
}

impl AdvertisementManager {
    pub fn new(local_asn: Asn, local_url: &str, default_local_pref: u32) -> Self {
        Self {
            local_asn,
            local_url: local_url.to_string(),
            default_local_pref,
            agents: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    pub fn register(&mut self, registration: AgentRegistration) -> Result<Route, AdvertiseError> {
        if registration.agent_id.trim().is_empty() {
            return Err(AdvertiseError::InvalidRegistration(
                "agent id must be non-empty".to_string(),
            ));
        }
        if registration.capabilities.is_empty() {
            return Err(AdvertiseError::InvalidRegistration(format!(
                "agent '{}' must advertise at least one capability",
                registration.agent_id
            )));
        }
        let now = Utc::now();
        let agent = LocalAgent {
            agent_id: registration.agent_id.clone(),
            capabilities: registration.capabilities,
            version: registration.version,
            description: registration.description,
            metadata: registration.metadata,
            health_status: registration.health_status,
            local_pref: registration.local_pref.unwrap_or(self.default_local_pref),
            last_seen: now,
            registered_at: now,
        };
        let route = self.route_for(&agent);
        if self
            .agents
            .insert(registration.agent_id.clone(), agent)
            .is_some()
        {
            debug!("Local agent '{}' re-registered", registration.agent_id);
        } else {
            info!("Local agent '{}' registered", registration.agent_id);
        }
        Ok(route)
    }

    /// Partial update; bumps last_seen
    pub fn update(&mut self, agent_id: &str, patch: AgentPatch) -> Result<Route, AdvertiseError> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AdvertiseError::UnknownAgent(agent_id.to_string()))?;
        if let Some(capabilities) = patch.capabilities {
            agent.capabilities = capabilities;
        }
        if let Some(version) = patch.version {
            agent.version = Some(version);
        }
        if let Some(description) = patch.description {
            agent.description = Some(description);
        }
        if let Some(metadata) = patch.metadata {
            agent.metadata = Some(metadata);
        }
        if let Some(health) = patch.health_status {
            agent.health_status = Some(health);
        }
        if let Some(local_pref) = patch.local_pref {
            agent.local_pref = local_pref;
        }
        agent.last_seen = Utc::now();
        let agent = self.agents.get(agent_id).expect("Agent just updated");
        Ok(self.route_for(agent))
    }

    /// Remove an agent; the caller sends the withdrawal
    pub fn unregister(&mut self, agent_id: &str) -> Result<(), AdvertiseError> {
        self.callbacks.remove(agent_id);
        match self.agents.remove(agent_id) {
            Some(_) => {
                info!("Local agent '{}' unregistered", agent_id);
                Ok(())
            }
            None => Err(AdvertiseError::UnknownAgent(agent_id.to_string())),
        }
    }

    /// Attach a dynamic-state supplier consulted by the refresher
    pub fn register_callback(&mut self, agent_id: &str, source: Arc<dyn AgentStateSource>) {
        self.callbacks.insert(agent_id.to_string(), source);
    }

    /// Re-read every dynamic agent. Agents whose callback reports them
    /// gone are unregistered and returned in `removed`.
    pub async fn refresh(&mut self) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();
        let callbacks: Vec<(AgentId, Arc<dyn AgentStateSource>)> = self
            .callbacks
            .iter()
            .map(|(id, source)| (id.clone(), source.clone()))
            .collect();
        for (agent_id, source) in callbacks {
            match source.current_state(&agent_id).await {
                Some(state) => {
                    if let Some(agent) = self.agents.get_mut(&agent_id) {
                        agent.capabilities = state.capabilities;
                        agent.health_status = state.health_status;
                        agent.version = state.version;
                        agent.description = state.description;
                        agent.metadata = state.metadata;
                        agent.last_seen = Utc::now();
                    }
                    if let Some(agent) = self.agents.get(&agent_id) {
                        outcome.refreshed.push(self.route_for(agent));
                    }
                }
                None => {
                    debug!("Refresher: '{}' no longer exists upstream", agent_id);
                    if self.unregister(&agent_id).is_ok() {
                        outcome.removed.push(agent_id);
                    }
                }
            }
        }
        outcome
    }

    pub fn get(&self, agent_id: &str) -> Option<LocalAgent> {
        self.agents.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<LocalAgent> {
        self.agents.values().cloned().collect()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Routes for every local agent (session-established full advertisement)
    pub fn routes(&self) -> Vec<Route> {
        self.agents.values().map(|a| self.route_for(a)).collect()
    }

    pub fn route_for_agent(&self, agent_id: &str) -> Option<Route> {
        self.agents.get(agent_id).map(|a| self.route_for(a))
    }

    /// Derive the advertised route for a local agent
    fn route_for(&self, agent: &LocalAgent) -> Route {
        let mut route = Route::new(&agent.agent_id, agent.capabilities.clone(), &self.local_url);
        route.as_path = vec![self.local_asn];
        route.local_pref = agent.local_pref;
        route.med = derived_med(agent.health_status, agent.last_seen);
        for capability in &agent.capabilities {
            route
                .communities
                .add(&format!("capability:{}", capability.to_lowercase()));
        }
        if let Some(health) = agent.health_status {
            route.communities.add(&format!("health:{}", health));
        }
        route.communities.add(&format!("as:{}", self.local_asn));
        if let Some(version) = &agent.version {
            route.set_attribute("agent-version", json!(version));
        }
        if let Some(description) = &agent.description {
            route.set_attribute("agent-description", json!(description));
        }
        if let Some(metadata) = &agent.metadata {
            route.set_attribute("agent-metadata", metadata.clone());
        }
        route.set_attribute("advertisement-time", json!(Utc::now().to_rfc3339()));
        route.set_attribute("advertiser-asn", json!(self.local_asn));
        route
    }
}

/// Health maps to a MED base (healthy 0, degraded 50, unhealthy 100,
/// unknown 25) plus one point per minute since the agent was last seen,
/// capped
fn derived_med(health: Option<HealthStatus>, last_seen: DateTime<Utc>) -> u32 {
    let base = match health {
        Some(HealthStatus::Healthy) => 0,
        Some(HealthStatus::Degraded) => 50,
        Some(HealthStatus::Unhealthy) => 100,
        None => 25,
    };
    let minutes = (Utc::now() - last_seen).num_minutes().max(0) as u32;
    base + minutes.min(STALENESS_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn manager() -> AdvertisementManager {
        AdvertisementManager::new(65001, "http://127.0.0.1:4111", 100)
    }

    fn registration(agent_id: &str) -> AgentRegistration {
        AgentRegistration {
            agent_id: agent_id.to_string(),
            capabilities: vec!["coding".to_string()],
            version: Some("1.2.0".to_string()),
            description: None,
            metadata: None,
            health_status: Some(HealthStatus::Healthy),
            local_pref: None,
        }
    }

    #[test]
    fn test_register_derives_route() {
        let mut manager = manager();
        let route = manager.register(registration("coder")).unwrap();
        assert_eq!(route.as_path, vec![65001]);
        assert_eq!(route.next_hop, "http://127.0.0.1:4111");
        assert_eq!(route.local_pref, 100);
        assert_eq!(route.med, 0);
        assert!(route.communities.contains("capability:coding"));
        assert!(route.communities.contains("health:healthy"));
        assert!(route.communities.contains("as:65001"));
        assert_eq!(route.attribute("agent-version").unwrap(), "1.2.0");
        assert_eq!(route.attribute("advertiser-asn").unwrap(), 65001);
    }

    #[test]
    fn test_register_validation() {
        let mut manager = manager();
        let mut bad = registration("");
        assert!(matches!(
            manager.register(bad.clone()),
            Err(AdvertiseError::InvalidRegistration(_))
        ));
        bad.agent_id = "coder".to_string();
        bad.capabilities = vec![];
        assert!(matches!(
            manager.register(bad),
            Err(AdvertiseError::InvalidRegistration(_))
        ));
    }

    #[test]
    fn test_med_from_health_and_staleness() {
        assert_eq!(derived_med(Some(HealthStatus::Healthy), Utc::now()), 0);
        assert_eq!(derived_med(Some(HealthStatus::Degraded), Utc::now()), 50);
        assert_eq!(derived_med(Some(HealthStatus::Unhealthy), Utc::now()), 100);
        assert_eq!(derived_med(None, Utc::now()), 25);

        let ten_minutes_ago = Utc::now() - Duration::minutes(10);
        assert_eq!(derived_med(Some(HealthStatus::Healthy), ten_minutes_ago), 10);
        let hours_ago = Utc::now() - Duration::hours(3);
        // Penalty caps at +50
        assert_eq!(derived_med(Some(HealthStatus::Healthy), hours_ago), 50);
        assert_eq!(derived_med(Some(HealthStatus::Unhealthy), hours_ago), 150);
    }

    #[test]
    fn test_partial_update() {
        let mut manager = manager();
        manager.register(registration("coder")).unwrap();
        let route = manager
            .update(
                "coder",
                AgentPatch {
                    health_status: Some(HealthStatus::Degraded),
                    local_pref: Some(150),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(route.local_pref, 150);
        assert!(route.communities.contains("health:degraded"));
        // Untouched fields survive
        assert_eq!(route.attribute("agent-version").unwrap(), "1.2.0");

        assert!(matches!(
            manager.update("ghost", AgentPatch::default()),
            Err(AdvertiseError::UnknownAgent(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let mut manager = manager();
        manager.register(registration("coder")).unwrap();
        assert!(manager.unregister("coder").is_ok());
        assert!(manager.is_empty());
        assert!(matches!(
            manager.unregister("coder"),
            Err(AdvertiseError::UnknownAgent(_))
        ));
    }

    struct ScriptedSource {
        state: Option<AgentState>,
    }

    #[async_trait]
    impl AgentStateSource for ScriptedSource {
        async fn current_state(&self, _agent_id: &str) -> Option<AgentState> {
            self.state.clone()
        }
    }

    #[tokio::test]
    async fn test_refresh_updates_and_removes() {
        let mut manager = manager();
        manager.register(registration("coder")).unwrap();
        manager.register(registration("ghost")).unwrap();

        manager.register_callback(
            "coder",
            Arc::new(ScriptedSource {
                state: Some(AgentState {
                    capabilities: vec!["coding".to_string(), "review".to_string()],
                    health_status: Some(HealthStatus::Degraded),
                    version: Some("1.3.0".to_string()),
                    description: None,
                    metadata: None,
                }),
            }),
        );
        manager.register_callback("ghost", Arc::new(ScriptedSource { state: None }));

        let outcome = manager.refresh().await;
        assert_eq!(outcome.refreshed.len(), 1);
        assert_eq!(outcome.removed, vec!["ghost".to_string()]);
        assert!(manager.get("ghost").is_none());

        let refreshed = &outcome.refreshed[0];
        assert!(refreshed.has_capability("review"));
        assert!(refreshed.communities.contains("health:degraded"));
        assert_eq!(manager.get("coder").unwrap().version.unwrap(), "1.3.0");
    }
}
