use std::collections::HashMap;
use std::net::SocketAddr;

use jsonrpsee::core::{async_trait, Error, RpcResult};
use jsonrpsee::http_server::{HttpServerBuilder, HttpServerHandle};
use log::info;
use serde_json::Value;
use tokio::sync::oneshot;

use super::rpc::{ApiServer, DiscoverParams, LearnedRoute, PolicyTestResult, SelectRequest};
use super::{ApiCommand, ApiTx};
use crate::advertise::{AgentRegistration, LocalAgent};
use crate::balancer::{BalancerDecision, PathHealth};
use crate::discovery::NetworkAgentRecord;
use crate::message::UpdateMessage;
use crate::policy::{DecisionRecord, Policy, PolicyStatsSnapshot};
use crate::rib::{AgentId, Asn, Route};
use crate::session::SessionSummary;

const DEFAULT_DECISION_LIMIT: usize = 100;

/// RPC front end; every call is relayed into the routing core over the
/// command channel and answered via a oneshot
pub struct ApiHandler {
    tx: ApiTx,
}

impl ApiHandler {
    pub fn new(tx: ApiTx) -> Self {
        Self { tx }
    }

    fn send(&self, command: ApiCommand) -> RpcResult<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::Custom("Routing core is shutting down".to_string()))
    }
}

async fn answer<T>(rx: oneshot::Receiver<T>) -> RpcResult<T> {
    rx.await
        .map_err(|_| Error::Custom("Routing core dropped the request".to_string()))
}

#[async_trait]
impl ApiServer for ApiHandler {
    async fn show_peers(&self) -> RpcResult<Vec<SessionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetPeers(reply))?;
        answer(rx).await
    }

    async fn add_peer(&self, asn: Asn, address: String) -> RpcResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::AddPeer { asn, address, reply })?;
        answer(rx).await
    }

    async fn remove_peer(&self, asn: Asn) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::RemovePeer { asn, reply })?;
        answer(rx).await
    }

    async fn connect_peer(&self, asn: Asn) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::ConnectPeer { asn, reply })?;
        answer(rx).await
    }

    async fn show_sessions(&self) -> RpcResult<Vec<SessionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetSessions(reply))?;
        answer(rx).await
    }

    async fn send_keepalive(&self, asn: Asn) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::SendKeepalive { asn, reply })?;
        answer(rx).await
    }

    async fn send_notification(&self, asn: Asn, reason: String) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::SendNotification { asn, reason, reply })?;
        answer(rx).await
    }

    async fn show_routes(&self) -> RpcResult<Vec<LearnedRoute>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetRoutes(reply))?;
        answer(rx).await
    }

    async fn show_routes_for_peer(&self, asn: Asn) -> RpcResult<Vec<LearnedRoute>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetRoutesForPeer { asn, reply })?;
        answer(rx).await
    }

    async fn update_routes(&self, update: UpdateMessage) -> RpcResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::InjectUpdate { update, reply })?;
        answer(rx).await?.map_err(Error::Custom)
    }

    async fn withdraw_routes(&self, sender_asn: Asn, agent_ids: Vec<AgentId>) -> RpcResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::WithdrawRoutes {
            sender_asn,
            agent_ids,
            reply,
        })?;
        answer(rx).await
    }

    async fn validate_rib(&self) -> RpcResult<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::ValidateRib(reply))?;
        answer(rx).await
    }

    async fn discover_agents(&self, params: DiscoverParams) -> RpcResult<Vec<NetworkAgentRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::DiscoverAgents { params, reply })?;
        answer(rx).await
    }

    async fn advertise_agent(&self, registration: AgentRegistration) -> RpcResult<LearnedRoute> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::AdvertiseAgent {
            registration,
            reply,
        })?;
        answer(rx).await?.map_err(Error::Custom)
    }

    async fn show_local_agents(&self) -> RpcResult<Vec<LocalAgent>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetLocalAgents(reply))?;
        answer(rx).await
    }

    async fn unregister_agent(&self, agent_id: AgentId) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::UnregisterAgent { agent_id, reply })?;
        answer(rx).await
    }

    async fn show_policies(&self) -> RpcResult<Vec<Policy>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetPolicies(reply))?;
        answer(rx).await
    }

    async fn add_policy(&self, policy: Policy) -> RpcResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::AddPolicy { policy, reply })?;
        answer(rx).await?.map_err(Error::Custom)
    }

    async fn update_policy(&self, name: String, policy: Policy) -> RpcResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::UpdatePolicy {
            name,
            policy,
            reply,
        })?;
        answer(rx).await?.map_err(Error::Custom)
    }

    async fn remove_policy(&self, name: String) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::RemovePolicy { name, reply })?;
        answer(rx).await
    }

    async fn toggle_policy(&self, name: String, enabled: bool) -> RpcResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::TogglePolicy {
            name,
            enabled,
            reply,
        })?;
        answer(rx).await
    }

    async fn policy_stats(&self) -> RpcResult<PolicyStatsSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetPolicyStats(reply))?;
        answer(rx).await
    }

    async fn policy_decisions(&self, limit: Option<usize>) -> RpcResult<Vec<DecisionRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetPolicyDecisions {
            limit: limit.unwrap_or(DEFAULT_DECISION_LIMIT),
            reply,
        })?;
        answer(rx).await
    }

    async fn import_policies(&self, policies: Value) -> RpcResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::ImportPolicies {
            bundle: policies,
            reply,
        })?;
        answer(rx).await?.map_err(Error::Custom)
    }

    async fn export_policies(&self) -> RpcResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::ExportPolicies(reply))?;
        answer(rx).await
    }

    async fn test_policies(&self, routes: Vec<Route>) -> RpcResult<Vec<PolicyTestResult>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::TestPolicies { routes, reply })?;
        answer(rx).await
    }

    async fn select_path(&self, request: SelectRequest) -> RpcResult<Option<BalancerDecision>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::SelectPath { request, reply })?;
        answer(rx).await?.map_err(Error::Custom)
    }

    async fn report_completion(
        &self,
        next_hop: String,
        success: bool,
        elapsed_ms: f64,
    ) -> RpcResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::ReportCompletion {
            next_hop,
            success,
            elapsed_ms,
            reply,
        })?;
        answer(rx).await
    }

    async fn balancer_health(&self) -> RpcResult<HashMap<String, PathHealth>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetBalancerHealth(reply))?;
        answer(rx).await
    }

    async fn balancer_decisions(&self, limit: Option<usize>) -> RpcResult<Vec<BalancerDecision>> {
        let (reply, rx) = oneshot::channel();
        self.send(ApiCommand::GetBalancerDecisions {
            limit: limit.unwrap_or(DEFAULT_DECISION_LIMIT),
            reply,
        })?;
        answer(rx).await
    }
}

/// Start the control-plane HTTP listener
pub async fn serve_api(addr: SocketAddr, tx: ApiTx) -> Result<HttpServerHandle, Error> {
    let server = HttpServerBuilder::default().build(addr).await?;
    let local_addr = server.local_addr()?;
    let handle = server.start(ApiHandler::new(tx).into_rpc())?;
    info!("Control plane listening on {}", local_addr);
    Ok(handle)
}
