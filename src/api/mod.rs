mod handler;
mod rpc;

pub use handler::{serve_api, ApiHandler};
pub use rpc::{ApiServer, DiscoverParams, LearnedRoute, PolicyTestResult, SelectRequest};

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::advertise::{AgentRegistration, LocalAgent};
use crate::balancer::{BalancerDecision, PathHealth};
use crate::discovery::NetworkAgentRecord;
use crate::message::UpdateMessage;
use crate::policy::{DecisionRecord, Policy, PolicyStatsSnapshot};
use crate::rib::{AgentId, Asn, Route};
use crate::session::SessionSummary;

type Reply<T> = oneshot::Sender<T>;

/// Commands carried from the control surface into the routing core.
/// Every variant carries its reply channel; the core owns all state.
pub enum ApiCommand {
    GetPeers(Reply<Vec<SessionSummary>>),
    AddPeer {
        asn: Asn,
        address: String,
        reply: Reply<()>,
    },
    RemovePeer {
        asn: Asn,
        reply: Reply<bool>,
    },
    ConnectPeer {
        asn: Asn,
        reply: Reply<bool>,
    },
    GetSessions(Reply<Vec<SessionSummary>>),
    SendKeepalive {
        asn: Asn,
        reply: Reply<bool>,
    },
    SendNotification {
        asn: Asn,
        reason: String,
        reply: Reply<bool>,
    },
    GetRoutes(Reply<Vec<LearnedRoute>>),
    GetRoutesForPeer {
        asn: Asn,
        reply: Reply<Vec<LearnedRoute>>,
    },
    InjectUpdate {
        update: UpdateMessage,
        reply: Reply<Result<(), String>>,
    },
    WithdrawRoutes {
        sender_asn: Asn,
        agent_ids: Vec<AgentId>,
        reply: Reply<()>,
    },
    ValidateRib(Reply<Vec<String>>),
    DiscoverAgents {
        params: DiscoverParams,
        reply: Reply<Vec<NetworkAgentRecord>>,
    },
    AdvertiseAgent {
        registration: AgentRegistration,
        reply: Reply<Result<LearnedRoute, String>>,
    },
    GetLocalAgents(Reply<Vec<LocalAgent>>),
    UnregisterAgent {
        agent_id: AgentId,
        reply: Reply<bool>,
    },
    GetPolicies(Reply<Vec<Policy>>),
    AddPolicy {
        policy: Policy,
        reply: Reply<Result<(), String>>,
    },
    UpdatePolicy {
        name: String,
        policy: Policy,
        reply: Reply<Result<(), String>>,
    },
    RemovePolicy {
        name: String,
        reply: Reply<bool>,
    },
    TogglePolicy {
        name: String,
        enabled: bool,
        reply: Reply<bool>,
    },
    GetPolicyStats(Reply<PolicyStatsSnapshot>),
    GetPolicyDecisions {
        limit: usize,
        reply: Reply<Vec<DecisionRecord>>,
    },
    ImportPolicies {
        bundle: Value,
        reply: Reply<Result<usize, String>>,
    },
    ExportPolicies(Reply<Value>),
    TestPolicies {
        routes: Vec<Route>,
        reply: Reply<Vec<PolicyTestResult>>,
    },
    SelectPath {
        request: SelectRequest,
        reply: Reply<Result<Option<BalancerDecision>, String>>,
    },
    ReportCompletion {
        next_hop: String,
        success: bool,
        elapsed_ms: f64,
        reply: Reply<()>,
    },
    GetBalancerHealth(Reply<HashMap<String, PathHealth>>),
    GetBalancerDecisions {
        limit: usize,
        reply: Reply<Vec<BalancerDecision>>,
    },
}

pub type ApiTx = mpsc::UnboundedSender<ApiCommand>;
pub type ApiRx = mpsc::UnboundedReceiver<ApiCommand>;
