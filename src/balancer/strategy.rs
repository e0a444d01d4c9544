//! Selection strategies over the candidate pool. Every strategy receives
//! the already-health-filtered candidates and returns an index into them.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::PathHealth;
use crate::rib::{HealthStatus, Route};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RoundRobin,
    CapabilityAware,
    LatencyBased,
    Weighted,
    LeastConnections,
    Random,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            Strategy::RoundRobin => "round-robin",
            Strategy::CapabilityAware => "capability-aware",
            Strategy::LatencyBased => "latency-based",
            Strategy::Weighted => "weighted",
            Strategy::LeastConnections => "least-connections",
            Strategy::Random => "random",
        };
        write!(f, "{}", word)
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "round-robin" => Ok(Strategy::RoundRobin),
            "capability-aware" => Ok(Strategy::CapabilityAware),
            "latency-based" => Ok(Strategy::LatencyBased),
            "weighted" => Ok(Strategy::Weighted),
            "least-connections" => Ok(Strategy::LeastConnections),
            "random" => Ok(Strategy::Random),
            _ => Err(format!("Unsupported strategy: '{}'", value)),
        }
    }
}

/// Fraction of `required` capabilities a candidate offers, and how focused
/// the candidate is on them
fn capability_score(route: &Route, required: &[String]) -> f64 {
    if required.is_empty() || route.capabilities.is_empty() {
        return 0.0;
    }
    let matched = required
        .iter()
        .filter(|capability| route.has_capability(capability))
        .count() as f64;
    let coverage = matched / required.len() as f64;
    let focus = matched / route.capabilities.len() as f64;
    0.7 * coverage + 0.3 * focus
}

pub(super) fn pick_index<R: Rng>(
    strategy: Strategy,
    candidates: &[(Route, PathHealth)],
    required: &[String],
    weights: Option<&[f64]>,
    round_robin_index: usize,
    rng: &mut R,
) -> usize {
    debug_assert!(!candidates.is_empty());
    match strategy {
        Strategy::RoundRobin => round_robin_index % candidates.len(),
        Strategy::CapabilityAware => candidates
            .iter()
            .enumerate()
            .max_by(|(_, (a, _)), (_, (b, _))| {
                capability_score(a, required)
                    .partial_cmp(&capability_score(b, required))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(index, _)| index)
            .unwrap_or(0),
        Strategy::LatencyBased => candidates
            .iter()
            .enumerate()
            .min_by(|(_, (_, a)), (_, (_, b))| {
                a.response_time_ms
                    .partial_cmp(&b.response_time_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(index, _)| index)
            .unwrap_or(0),
        Strategy::Weighted => {
            let weight_of = |index: usize, health: &PathHealth| -> f64 {
                let pattern = weights
                    .and_then(|w| w.get(index))
                    .copied()
                    .unwrap_or(1.0)
                    .max(0.0);
                let degraded_penalty = if health.status == HealthStatus::Degraded {
                    0.5
                } else {
                    1.0
                };
                pattern * health.success_rate * degraded_penalty
            };
            let total: f64 = candidates
                .iter()
                .enumerate()
                .map(|(index, (_, health))| weight_of(index, health))
                .sum();
            if total <= 0.0 {
                return rng.gen_range(0..candidates.len());
            }
            let mut draw = rng.gen_range(0.0..total);
            let mut last_viable = 0;
            for (index, (_, health)) in candidates.iter().enumerate() {
                let weight = weight_of(index, health);
                if weight <= 0.0 {
                    continue;
                }
                last_viable = index;
                draw -= weight;
                if draw <= 0.0 {
                    return index;
                }
            }
            last_viable
        }
        Strategy::LeastConnections => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, (_, health))| health.current_connections)
            .map(|(index, _)| index)
            .unwrap_or(0),
        Strategy::Random => rng.gen_range(0..candidates.len()),
    }
}
