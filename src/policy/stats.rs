//! Decision accounting for the policy engine: per-policy counters, outcome
//! totals, a rolling average of decision time, and a bounded history.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_HISTORY_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Accepted,
    Rejected,
    Modified,
    /// No policy matched; accepted unchanged
    Defaulted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            Outcome::Accepted => "accepted",
            Outcome::Rejected => "rejected",
            Outcome::Modified => "modified",
            Outcome::Defaulted => "defaulted",
        };
        write!(f, "{}", word)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Import,
    Export,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Import => write!(f, "import"),
            Direction::Export => write!(f, "export"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    /// Name of the deciding policy; None for a default accept
    pub policy: Option<String>,
    pub outcome: Outcome,
    pub direction: Direction,
}

/// One history ring buffer for the whole engine; entries carry the deciding
/// policy's name. Per-policy decision counts are kept separately.
#[derive(Debug)]
pub struct PolicyStats {
    decisions_by_policy: HashMap<String, u64>,
    totals_by_outcome: HashMap<String, u64>,
    total_decisions: u64,
    avg_decision_micros: f64,
    history: VecDeque<DecisionRecord>,
    history_size: usize,
}

impl PolicyStats {
    pub fn new(history_size: usize) -> Self {
        Self {
            decisions_by_policy: HashMap::new(),
            totals_by_outcome: HashMap::new(),
            total_decisions: 0,
            avg_decision_micros: 0.0,
            history: VecDeque::with_capacity(history_size.min(DEFAULT_HISTORY_SIZE)),
            history_size,
        }
    }

    pub fn record(
        &mut self,
        policy: Option<&str>,
        outcome: Outcome,
        direction: Direction,
        agent_id: &str,
        elapsed_micros: f64,
    ) {
        if let Some(name) = policy {
            *self
                .decisions_by_policy
                .entry(name.to_string())
                .or_insert(0) += 1;
        }
        *self
            .totals_by_outcome
            .entry(outcome.to_string())
            .or_insert(0) += 1;
        self.total_decisions += 1;
        self.avg_decision_micros +=
            (elapsed_micros - self.avg_decision_micros) / self.total_decisions as f64;

        if self.history.len() == self.history_size {
            self.history.pop_front();
        }
        self.history.push_back(DecisionRecord {
            timestamp: Utc::now(),
            agent_id: agent_id.to_string(),
            policy: policy.map(str::to_string),
            outcome,
            direction,
        });
    }

    pub fn decisions_for(&self, policy: &str) -> u64 {
        self.decisions_by_policy.get(policy).copied().unwrap_or(0)
    }

    pub fn total_for(&self, outcome: Outcome) -> u64 {
        self.totals_by_outcome
            .get(&outcome.to_string())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_decisions(&self) -> u64 {
        self.total_decisions
    }

    pub fn avg_decision_micros(&self) -> f64 {
        self.avg_decision_micros
    }

    /// Counters describe the installed policy object; a replaced policy
    /// starts from zero
    pub fn reset_policy(&mut self, policy: &str) {
        self.decisions_by_policy.remove(policy);
    }

    pub fn recent_decisions(&self, limit: usize) -> Vec<DecisionRecord> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn snapshot(&self) -> PolicyStatsSnapshot {
        PolicyStatsSnapshot {
            decisions_by_policy: self.decisions_by_policy.clone(),
            totals_by_outcome: self.totals_by_outcome.clone(),
            total_decisions: self.total_decisions,
            avg_decision_micros: self.avg_decision_micros,
            history_len: self.history.len(),
        }
    }
}

impl Default for PolicyStats {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatsSnapshot {
    pub decisions_by_policy: HashMap<String, u64>,
    pub totals_by_outcome: HashMap<String, u64>,
    pub total_decisions: u64,
    pub avg_decision_micros: f64,
    pub history_len: usize,
}
