//! Multi-path load balancing across equal-cost routes to an agent.
//! Selection picks one of the healthy-or-degraded candidate paths with a
//! named strategy; completion reports feed per-path health back in.

mod strategy;

pub use strategy::Strategy;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::rib::{AgentId, HealthStatus, Route};

/// EWMA smoothing factor for response times
const RESPONSE_TIME_ALPHA: f64 = 0.2;
const DECISION_HISTORY_SIZE: usize = 1000;

const UNHEALTHY_SUCCESS_RATE: f64 = 0.5;
const UNHEALTHY_RESPONSE_MS: f64 = 10_000.0;
const DEGRADED_SUCCESS_RATE: f64 = 0.8;
const DEGRADED_RESPONSE_MS: f64 = 5_000.0;

/// Health bookkeeping for one path (keyed by next hop)
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathHealth {
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub current_connections: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub status: HealthStatus,
}

impl Default for PathHealth {
    fn default() -> Self {
        Self {
            response_time_ms: 0.0,
            success_rate: 1.0,
            current_connections: 0,
            total_requests: 0,
            failed_requests: 0,
            status: HealthStatus::Healthy,
        }
    }
}

impl PathHealth {
    fn recompute_status(&mut self) -> bool {
        let status = if self.success_rate < UNHEALTHY_SUCCESS_RATE
            || self.response_time_ms > UNHEALTHY_RESPONSE_MS
        {
            HealthStatus::Unhealthy
        } else if self.success_rate < DEGRADED_SUCCESS_RATE
            || self.response_time_ms > DEGRADED_RESPONSE_MS
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let changed = status != self.status;
        self.status = status;
        changed
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerDecision {
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub next_hop: String,
    pub strategy: Strategy,
    pub candidate_count: usize,
}

/// Health transition surfaced to the event bus
#[derive(Clone, Debug)]
pub struct HealthTransition {
    pub next_hop: String,
    pub status: HealthStatus,
}

pub struct MultiPathBalancer {
    max_paths: usize,
    default_strategy: Strategy,
    paths: HashMap<String, PathHealth>,
    round_robin: HashMap<AgentId, usize>,
    history: VecDeque<BalancerDecision>,
}

impl MultiPathBalancer {
    pub fn new(max_paths: usize, default_strategy: Strategy) -> Self {
        Self {
            max_paths,
            default_strategy,
            paths: HashMap::new(),
            round_robin: HashMap::new(),
            history: VecDeque::with_capacity(DECISION_HISTORY_SIZE),
        }
    }

    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    /// Pick a path for one request. `candidates` are the Loc-RIB
    /// alternatives for the agent; unhealthy paths are excluded and the
    /// pool is capped at `max_paths`. Selection counts as a request start.
    pub fn select(
        &mut self,
        agent_id: &str,
        candidates: Vec<Route>,
        required_capabilities: &[String],
        strategy_override: Option<Strategy>,
        weights: Option<&[f64]>,
    ) -> Option<BalancerDecision> {
        let pool: Vec<(Route, PathHealth)> = candidates
            .into_iter()
            .take(self.max_paths)
            .map(|route| {
                let health = self
                    .paths
                    .entry(route.next_hop.clone())
                    .or_insert_with(PathHealth::default)
                    .clone();
                (route, health)
            })
            .filter(|(_, health)| health.status != HealthStatus::Unhealthy)
            .collect();
        if pool.is_empty() {
            return None;
        }

        let strategy = strategy_override.unwrap_or(self.default_strategy);
        let round_robin_index = {
            let counter = self.round_robin.entry(agent_id.to_string()).or_insert(0);
            let current = *counter;
            *counter = counter.wrapping_add(1);
            current
        };
        let picked = strategy::pick_index(
            strategy,
            &pool,
            required_capabilities,
            weights,
            round_robin_index,
            &mut rand::thread_rng(),
        );
        let next_hop = pool[picked].0.next_hop.clone();

        let health = self
            .paths
            .get_mut(&next_hop)
            .expect("Path health entry exists");
        health.current_connections += 1;
        health.total_requests += 1;

        let decision = BalancerDecision {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            next_hop,
            strategy,
            candidate_count: pool.len(),
        };
        if self.history.len() == DECISION_HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(decision.clone());
        Some(decision)
    }

    /// Report the outcome of a request started by `select`. Returns a
    /// transition when the path's status changed.
    pub fn report_completion(
        &mut self,
        next_hop: &str,
        success: bool,
        elapsed_ms: f64,
    ) -> Option<HealthTransition> {
        let health = self.paths.get_mut(next_hop)?;
        health.current_connections = health.current_connections.saturating_sub(1);
        if !success {
            health.failed_requests += 1;
        }
        if health.total_requests > 0 {
            health.success_rate =
                1.0 - (health.failed_requests as f64 / health.total_requests as f64);
        }
        health.response_time_ms = if health.response_time_ms == 0.0 {
            elapsed_ms
        } else {
            RESPONSE_TIME_ALPHA * elapsed_ms + (1.0 - RESPONSE_TIME_ALPHA) * health.response_time_ms
        };
        if health.recompute_status() {
            debug!("Path {} is now {}", next_hop, health.status);
            return Some(HealthTransition {
                next_hop: next_hop.to_string(),
                status: health.status,
            });
        }
        None
    }

    pub fn path_health(&self, next_hop: &str) -> Option<PathHealth> {
        self.paths.get(next_hop).cloned()
    }

    pub fn health_snapshot(&self) -> HashMap<String, PathHealth> {
        self.paths.clone()
    }

    pub fn recent_decisions(&self, limit: usize) -> Vec<BalancerDecision> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(strategy: Strategy) -> MultiPathBalancer {
        MultiPathBalancer::new(4, strategy)
    }

    fn route(next_hop: &str) -> Route {
        Route::new("coder", vec!["coding".to_string()], next_hop)
    }

    #[test]
    fn test_least_connections_seed_scenario() {
        let mut balancer = balancer(Strategy::LeastConnections);
        // Pre-load connection counts [3, 1, 2]
        for (next_hop, connections) in [("http://a", 3), ("http://b", 1), ("http://c", 2)] {
            let mut health = PathHealth::default();
            health.current_connections = connections;
            balancer.paths.insert(next_hop.to_string(), health);
        }
        let candidates = vec![route("http://a"), route("http://b"), route("http://c")];

        let decision = balancer
            .select("coder", candidates.clone(), &[], None, None)
            .unwrap();
        assert_eq!(decision.next_hop, "http://b");

        // Completion takes b back to [3, 1, 2] with the in-flight select
        // counted; report drops it to [3, 0+1-1=1... ] -> still fewest
        balancer.report_completion("http://b", true, 25.0);
        let decision = balancer.select("coder", candidates, &[], None, None).unwrap();
        assert_eq!(decision.next_hop, "http://b");
    }

    #[test]
    fn test_selection_tracks_connections_and_history() {
        let mut balancer = balancer(Strategy::RoundRobin);
        let candidates = vec![route("http://a"), route("http://b")];
        let first = balancer
            .select("coder", candidates.clone(), &[], None, None)
            .unwrap();
        let second = balancer.select("coder", candidates, &[], None, None).unwrap();
        assert_ne!(first.next_hop, second.next_hop);
        assert_eq!(balancer.recent_decisions(10).len(), 2);
        assert_eq!(
            balancer.path_health(&first.next_hop).unwrap().current_connections,
            1
        );
    }

    #[test]
    fn test_unhealthy_paths_are_excluded() {
        let mut balancer = balancer(Strategy::RoundRobin);
        let mut dead = PathHealth::default();
        dead.success_rate = 0.2;
        dead.recompute_status();
        assert_eq!(dead.status, HealthStatus::Unhealthy);
        balancer.paths.insert("http://a".to_string(), dead);

        for _ in 0..4 {
            let decision = balancer
                .select(
                    "coder",
                    vec![route("http://a"), route("http://b")],
                    &[],
                    None,
                    None,
                )
                .unwrap();
            assert_eq!(decision.next_hop, "http://b");
        }
    }

    #[test]
    fn test_no_viable_candidates() {
        let mut balancer = balancer(Strategy::Random);
        assert!(balancer.select("coder", vec![], &[], None, None).is_none());
    }

    #[test]
    fn test_completion_updates_health() {
        let mut balancer = balancer(Strategy::RoundRobin);
        let candidates = vec![route("http://a")];
        balancer.select("coder", candidates.clone(), &[], None, None).unwrap();
        let transition = balancer.report_completion("http://a", true, 100.0);
        assert!(transition.is_none());
        let health = balancer.path_health("http://a").unwrap();
        assert_eq!(health.current_connections, 0);
        assert!((health.response_time_ms - 100.0).abs() < f64::EPSILON);

        // EWMA: 0.2 * 600 + 0.8 * 100 = 200
        balancer.select("coder", candidates, &[], None, None).unwrap();
        balancer.report_completion("http://a", true, 600.0);
        let health = balancer.path_health("http://a").unwrap();
        assert!((health.response_time_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_transitions_emit() {
        let mut balancer = balancer(Strategy::RoundRobin);
        let candidates = vec![route("http://a")];
        // Two failures out of two requests: success rate 0.0
        balancer.select("coder", candidates.clone(), &[], None, None).unwrap();
        let transition = balancer.report_completion("http://a", false, 50.0);
        assert!(matches!(
            transition,
            Some(HealthTransition {
                status: HealthStatus::Unhealthy,
                ..
            })
        ));
        // Unhealthy paths never get selected again until they recover
        assert!(balancer.select("coder", candidates, &[], None, None).is_none());
    }

    #[test]
    fn test_slow_path_goes_degraded() {
        let mut balancer = balancer(Strategy::LatencyBased);
        balancer
            .select("coder", vec![route("http://a")], &[], None, None)
            .unwrap();
        let transition = balancer.report_completion("http://a", true, 7_000.0);
        assert!(matches!(
            transition,
            Some(HealthTransition {
                status: HealthStatus::Degraded,
                ..
            })
        ));
    }
}
