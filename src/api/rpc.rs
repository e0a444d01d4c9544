//! Control surface: one RPC method per control-plane operation. The HTTP
//! adapter that fronts these for REST clients lives outside the core.

use std::collections::HashMap;

use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::advertise::{AgentRegistration, LocalAgent};
use crate::balancer::{BalancerDecision, PathHealth};
use crate::discovery::NetworkAgentRecord;
use crate::message::UpdateMessage;
use crate::policy::{DecisionRecord, Policy, PolicyStatsSnapshot};
use crate::rib::{AgentId, Asn, HealthStatus, Route};
use crate::session::SessionSummary;
use crate::utils::format_time_as_elapsed;

/// Externalized view of a route, for API reads
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedRoute {
    pub agent_id: AgentId,
    pub capabilities: Vec<String>,
    pub next_hop: String,
    pub as_path: String,
    pub local_pref: u32,
    pub med: u32,
    pub communities: Vec<String>,
    pub received_at: i64,
    pub age: String,
}

impl From<&Route> for LearnedRoute {
    fn from(route: &Route) -> Self {
        Self {
            agent_id: route.agent_id.clone(),
            capabilities: route.capabilities.clone(),
            next_hop: route.next_hop.clone(),
            as_path: route
                .as_path
                .iter()
                .map(std::string::ToString::to_string)
                .collect::<Vec<String>>()
                .join(" "),
            local_pref: route.local_pref,
            med: route.med,
            communities: route.communities.iter().cloned().collect(),
            received_at: route.origin_time.timestamp(),
            age: format_time_as_elapsed(route.origin_time),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverParams {
    pub capability: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub health_filter: Option<HealthStatus>,
    /// Seconds to wait for broadcast responses
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_max_results() -> usize {
    10
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectRequest {
    pub agent_id: AgentId,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
}

/// Outcome of a dry-run policy evaluation
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTestResult {
    pub agent_id: AgentId,
    pub outcome: String,
    pub policy: Option<String>,
    pub local_pref: u32,
    pub med: u32,
    pub communities: Vec<String>,
}

#[rpc(server)]
pub trait Api {
    // Peers & sessions
    #[method(name = "show_peers")]
    async fn show_peers(&self) -> RpcResult<Vec<SessionSummary>>;
    #[method(name = "add_peer")]
    async fn add_peer(&self, asn: Asn, address: String) -> RpcResult<()>;
    #[method(name = "remove_peer")]
    async fn remove_peer(&self, asn: Asn) -> RpcResult<bool>;
    /// Kick an immediate session attempt toward a configured peer
    #[method(name = "connect_peer")]
    async fn connect_peer(&self, asn: Asn) -> RpcResult<bool>;
    #[method(name = "show_sessions")]
    async fn show_sessions(&self) -> RpcResult<Vec<SessionSummary>>;
    #[method(name = "send_keepalive")]
    async fn send_keepalive(&self, asn: Asn) -> RpcResult<bool>;
    #[method(name = "send_notification")]
    async fn send_notification(&self, asn: Asn, reason: String) -> RpcResult<bool>;

    // Routes
    #[method(name = "show_routes")]
    async fn show_routes(&self) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "show_routes_for_peer")]
    async fn show_routes_for_peer(&self, asn: Asn) -> RpcResult<Vec<LearnedRoute>>;
    #[method(name = "update_routes")]
    async fn update_routes(&self, update: UpdateMessage) -> RpcResult<()>;
    #[method(name = "withdraw_routes")]
    async fn withdraw_routes(&self, sender_asn: Asn, agent_ids: Vec<AgentId>) -> RpcResult<()>;
    #[method(name = "validate_rib")]
    async fn validate_rib(&self) -> RpcResult<Vec<String>>;

    // Agents
    #[method(name = "discover_agents")]
    async fn discover_agents(&self, params: DiscoverParams) -> RpcResult<Vec<NetworkAgentRecord>>;
    #[method(name = "advertise_agent")]
    async fn advertise_agent(&self, registration: AgentRegistration) -> RpcResult<LearnedRoute>;
    #[method(name = "show_local_agents")]
    async fn show_local_agents(&self) -> RpcResult<Vec<LocalAgent>>;
    #[method(name = "unregister_agent")]
    async fn unregister_agent(&self, agent_id: AgentId) -> RpcResult<bool>;

    // Policies
    #[method(name = "show_policies")]
    async fn show_policies(&self) -> RpcResult<Vec<Policy>>;
    #[method(name = "add_policy")]
    async fn add_policy(&self, policy: Policy) -> RpcResult<()>;
    #[method(name = "update_policy")]
    async fn update_policy(&self, name: String, policy: Policy) -> RpcResult<()>;
    #[method(name = "remove_policy")]
    async fn remove_policy(&self, name: String) -> RpcResult<bool>;
    #[method(name = "toggle_policy")]
    async fn toggle_policy(&self, name: String, enabled: bool) -> RpcResult<bool>;
    #[method(name = "policy_stats")]
    async fn policy_stats(&self) -> RpcResult<PolicyStatsSnapshot>;
    #[method(name = "policy_decisions")]
    async fn policy_decisions(&self, limit: Option<usize>) -> RpcResult<Vec<DecisionRecord>>;
    #[method(name = "import_policies")]
    async fn import_policies(&self, policies: Value) -> RpcResult<usize>;
    #[method(name = "export_policies")]
    async fn export_policies(&self) -> RpcResult<Value>;
    #[method(name = "test_policies")]
    async fn test_policies(&self, routes: Vec<Route>) -> RpcResult<Vec<PolicyTestResult>>;

    // Balancer
    #[method(name = "select_path")]
    async fn select_path(&self, request: SelectRequest) -> RpcResult<Option<BalancerDecision>>;
    #[method(name = "report_completion")]
    async fn report_completion(
        &self,
        next_hop: String,
        success: bool,
        elapsed_ms: f64,
    ) -> RpcResult<()>;
    #[method(name = "balancer_health")]
    async fn balancer_health(&self) -> RpcResult<HashMap<String, PathHealth>>;
    #[method(name = "balancer_decisions")]
    async fn balancer_decisions(&self, limit: Option<usize>) -> RpcResult<Vec<BalancerDecision>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learned_route_projection() {
        let mut route = Route::new("coder", vec!["coding".to_string()], "http://a:4111");
        route.as_path = vec![65001, 65002];
        route.communities.add("as:65001");
        let learned = LearnedRoute::from(&route);
        assert_eq!(learned.as_path, "65001 65002");
        assert_eq!(learned.communities, vec!["as:65001".to_string()]);
    }

    #[test]
    fn test_discover_params_defaults() {
        let params: DiscoverParams =
            serde_json::from_str(r#"{"capability":"coding"}"#).unwrap();
        assert_eq!(params.max_results, 10);
        assert!(params.health_filter.is_none());
        assert!(params.timeout.is_none());
    }
}
