//! Policy engine: deterministic match/modify/filter of routes on import and
//! export. Policies are evaluated in descending priority order; the first
//! matching policy decides. A `modify` action admits the route with its
//! modifications applied and consults no further policy. With no match the
//! route is accepted unchanged.

mod matcher;
mod stats;

pub use matcher::{AsnMatch, PolicyMatch, StringMatch, TimeWindow};
pub use stats::{
    DecisionRecord, Direction, Outcome, PolicyStats, PolicyStatsSnapshot, DEFAULT_HISTORY_SIZE,
};

use std::error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::rib::{Asn, HealthStatus, Route};

#[derive(Debug)]
pub enum PolicyError {
    /// Policy submitted without a name
    MissingName,
    /// No installed policy by that name. [name]
    UnknownPolicy(String),
    /// Bundle failed to parse or validate; nothing was replaced. [reason]
    InvalidBundle(String),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use PolicyError::*;
        match self {
            MissingName => write!(f, "Policy is missing a name"),
            UnknownPolicy(name) => write!(f, "No policy named '{}'", name),
            InvalidBundle(reason) => write!(f, "Policy bundle rejected: {}", reason),
        }
    }
}

impl error::Error for PolicyError {}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Accept,
    Reject,
    Modify,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalanceHint {
    pub method: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAction {
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_local_pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_med: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_med: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_communities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_communities: Vec<String>,
    // Hints consumed by the balancer and observability, carried verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_alternatives: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balance: Option<LoadBalanceHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_asn: Option<Vec<Asn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avoid_asn: Option<Vec<Asn>>,
    #[serde(default)]
    pub log_decision: bool,
    #[serde(default)]
    pub alert_on_match: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_tag: Option<String>,
}

impl PolicyAction {
    pub fn accept() -> Self {
        Self::of_kind(ActionKind::Accept)
    }

    pub fn reject() -> Self {
        Self::of_kind(ActionKind::Reject)
    }

    pub fn modify() -> Self {
        Self::of_kind(ActionKind::Modify)
    }

    fn of_kind(action: ActionKind) -> Self {
        Self {
            action,
            set_local_pref: None,
            set_med: None,
            add_med: None,
            add_communities: Vec::new(),
            remove_communities: Vec::new(),
            max_alternatives: None,
            load_balance: None,
            rate_limit: None,
            prefer_asn: None,
            avoid_asn: None,
            log_decision: false,
            alert_on_match: false,
            metrics_tag: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub priority: i64,
    #[serde(default, rename = "match")]
    pub matcher: PolicyMatch,
    pub action: PolicyAction,
}

fn default_enabled() -> bool {
    true
}

impl Policy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::MissingName);
        }
        Ok(())
    }
}

/// Outcome of running a route through the engine
#[derive(Clone, Debug)]
pub enum PolicyOutcome {
    /// Route admitted; the deciding policy, if any
    Accept { policy: Option<String> },
    /// Route filtered out by the named policy
    Reject { policy: String },
    /// Route admitted with modifications applied
    Modify { route: Box<Route>, policy: String },
}

impl PolicyOutcome {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, PolicyOutcome::Reject { .. })
    }
}

/// Built-in defaults installed when no policy file is configured
pub fn default_policies() -> Vec<Policy> {
    vec![
        Policy {
            name: "demote-degraded".to_string(),
            enabled: true,
            priority: 50,
            matcher: PolicyMatch {
                health_status: Some(HealthStatus::Degraded),
                ..Default::default()
            },
            action: PolicyAction {
                set_local_pref: Some(50),
                ..PolicyAction::modify()
            },
        },
        Policy {
            name: "baseline-accept".to_string(),
            enabled: true,
            priority: 0,
            matcher: PolicyMatch::default(),
            action: PolicyAction::accept(),
        },
    ]
}

/// The policy engine. Installed policies are immutable values; mutation is
/// replacement. Held behind a lock by the owner; evaluation is CPU-only.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    /// Sorted by descending priority
    policies: Vec<Arc<Policy>>,
    stats: PolicyStats,
}

impl PolicyEngine {
    pub fn new(policies: Vec<Policy>) -> Result<Self, PolicyError> {
        let mut engine = Self {
            policies: Vec::with_capacity(policies.len()),
            stats: PolicyStats::default(),
        };
        for policy in policies {
            engine.add_policy(policy)?;
        }
        Ok(engine)
    }

    pub fn with_history_size(policies: Vec<Policy>, history_size: usize) -> Result<Self, PolicyError> {
        let mut engine = Self::new(policies)?;
        engine.stats = PolicyStats::new(history_size);
        Ok(engine)
    }

    fn sort(&mut self) {
        self.policies.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Install or replace a policy. Replacement resets the per-policy
    /// counter: the counter describes the installed object.
    pub fn add_policy(&mut self, policy: Policy) -> Result<(), PolicyError> {
        policy.validate()?;
        if self.policies.iter().any(|p| p.name == policy.name) {
            self.policies.retain(|p| p.name != policy.name);
            self.stats.reset_policy(&policy.name);
            debug!("Replacing policy '{}'", policy.name);
        }
        self.policies.push(Arc::new(policy));
        self.sort();
        Ok(())
    }

    pub fn remove_policy(&mut self, name: &str) -> Result<(), PolicyError> {
        let before = self.policies.len();
        self.policies.retain(|p| p.name != name);
        if self.policies.len() == before {
            return Err(PolicyError::UnknownPolicy(name.to_string()));
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), PolicyError> {
        let position = self
            .policies
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| PolicyError::UnknownPolicy(name.to_string()))?;
        let mut updated = (*self.policies[position]).clone();
        updated.enabled = enabled;
        self.policies[position] = Arc::new(updated);
        Ok(())
    }

    pub fn list(&self) -> Vec<Policy> {
        self.policies.iter().map(|p| (**p).clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Policy> {
        self.policies
            .iter()
            .find(|p| p.name == name)
            .map(|p| (**p).clone())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Atomically replace the installed set from a JSON array.
    /// All-or-nothing: any parse or validation failure leaves the
    /// existing policies untouched.
    pub fn import_bundle(&mut self, bundle: &str) -> Result<usize, PolicyError> {
        let parsed: Vec<Policy> = serde_json::from_str(bundle)
            .map_err(|err| PolicyError::InvalidBundle(err.to_string()))?;
        for policy in &parsed {
            policy
                .validate()
                .map_err(|err| PolicyError::InvalidBundle(err.to_string()))?;
        }
        let count = parsed.len();
        self.policies = parsed.into_iter().map(Arc::new).collect();
        self.sort();
        info!("Imported policy bundle [{} policies]", count);
        Ok(count)
    }

    pub fn export_bundle(&self) -> serde_json::Value {
        serde_json::to_value(self.list()).unwrap_or_else(|_| serde_json::json!([]))
    }

    fn decide(&self, route: &Route) -> PolicyOutcome {
        let now = Utc::now();
        for policy in self.policies.iter().filter(|p| p.enabled) {
            if !policy.matcher.matches(route, now) {
                continue;
            }
            if policy.action.log_decision || policy.action.alert_on_match {
                info!(
                    "Policy '{}' matched {} [tag={}]",
                    policy.name,
                    route.agent_id,
                    policy.action.metrics_tag.as_deref().unwrap_or("-")
                );
            }
            return match policy.action.action {
                ActionKind::Accept => PolicyOutcome::Accept {
                    policy: Some(policy.name.clone()),
                },
                ActionKind::Reject => PolicyOutcome::Reject {
                    policy: policy.name.clone(),
                },
                ActionKind::Modify => PolicyOutcome::Modify {
                    route: Box::new(apply_modifications(route, &policy.action)),
                    policy: policy.name.clone(),
                },
            };
        }
        PolicyOutcome::Accept { policy: None }
    }

    /// Run a route through the engine, recording statistics
    pub fn evaluate(&mut self, route: &Route, direction: Direction) -> PolicyOutcome {
        let started = Instant::now();
        let outcome = self.decide(route);
        let elapsed = started.elapsed().as_secs_f64() * 1_000_000.0;
        let (policy, kind) = match &outcome {
            PolicyOutcome::Accept { policy: Some(name) } => (Some(name.as_str()), Outcome::Accepted),
            PolicyOutcome::Accept { policy: None } => (None, Outcome::Defaulted),
            PolicyOutcome::Reject { policy } => (Some(policy.as_str()), Outcome::Rejected),
            PolicyOutcome::Modify { policy, .. } => (Some(policy.as_str()), Outcome::Modified),
        };
        self.stats
            .record(policy, kind, direction, &route.agent_id, elapsed);
        outcome
    }

    /// Evaluate without touching statistics (dry runs / the test endpoint)
    pub fn evaluate_quiet(&self, route: &Route) -> PolicyOutcome {
        self.decide(route)
    }

    /// Import convenience: admitted route (possibly modified), or None
    pub fn apply_import(&mut self, route: &Route) -> Option<Route> {
        match self.evaluate(route, Direction::Import) {
            PolicyOutcome::Accept { .. } => Some(route.clone()),
            PolicyOutcome::Modify { route, .. } => Some(*route),
            PolicyOutcome::Reject { policy } => {
                trace!("Import of {} rejected by '{}'", route.agent_id, policy);
                None
            }
        }
    }

    /// Export path: enforce egress loop prevention, run export policy,
    /// prepend the local ASN. None means "do not advertise to this peer".
    pub fn export_for_peer(&mut self, route: &Route, peer: Asn, local_asn: Asn) -> Option<Route> {
        if route.contains_as(peer) {
            trace!(
                "Not advertising {} to AS{}: peer already on path",
                route.agent_id,
                peer
            );
            return None;
        }
        let mut exported = match self.evaluate(route, Direction::Export) {
            PolicyOutcome::Accept { .. } => route.clone(),
            PolicyOutcome::Modify { route, .. } => *route,
            PolicyOutcome::Reject { policy } => {
                trace!("Export of {} rejected by '{}'", route.agent_id, policy);
                return None;
            }
        };
        exported.prepend_as(local_asn);
        if exported.has_as_loop() || exported.as_path.len() > crate::rib::MAX_AS_PATH_LENGTH {
            warn!("Export of {} dropped: path invalid after prepend", route.agent_id);
            return None;
        }
        Some(exported)
    }

    pub fn stats(&self) -> &PolicyStats {
        &self.stats
    }
}

fn apply_modifications(route: &Route, action: &PolicyAction) -> Route {
    let mut modified = route.clone();
    if let Some(local_pref) = action.set_local_pref {
        modified.local_pref = local_pref;
    }
    if let Some(med) = action.set_med {
        modified.med = med;
    }
    if let Some(bump) = action.add_med {
        modified.med = modified.med.saturating_add(bump);
    }
    for community in &action.add_communities {
        modified.communities.add(community);
    }
    for community in &action.remove_communities {
        modified.communities.remove(community);
    }
    modified
}
