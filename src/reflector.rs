//! Route reflection for iBGP-style peer groups, following the RFC 4456
//! client/non-client matrix. Reflected routes are stamped with the
//! originating peer, the reflector's cluster, and a marker community.

use std::fmt;

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::policy::{ActionKind, Policy};
use crate::rib::{Asn, Route, ATTR_CLUSTER_ID, ATTR_ORIGINATOR_ID, REFLECTED_COMMUNITY};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerType {
    Ebgp,
    IbgpClient,
    IbgpNonClient,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            PeerType::Ebgp => "ebgp",
            PeerType::IbgpClient => "ibgp-client",
            PeerType::IbgpNonClient => "ibgp-non-client",
        };
        write!(f, "{}", word)
    }
}

/// Reflection matrix: which peer classes receive a route learned from
/// `source`. The source peer itself is always excluded.
fn reflects_to(source: PeerType, target: PeerType) -> bool {
    use PeerType::*;
    match source {
        Ebgp => matches!(target, IbgpClient | IbgpNonClient),
        IbgpClient => matches!(target, Ebgp | IbgpNonClient),
        IbgpNonClient => matches!(target, IbgpClient),
    }
}

pub struct RouteReflector {
    cluster_id: String,
    /// Reflector-policy extensions: accept = reflect, reject = no-reflect
    policies: Vec<Policy>,
}

impl RouteReflector {
    pub fn new(cluster_id: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            policies: Vec::new(),
        }
    }

    pub fn with_policies(cluster_id: &str, mut policies: Vec<Policy>) -> Self {
        policies.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            cluster_id: cluster_id.to_string(),
            policies,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Peers that should receive a route learned from `source_asn`
    pub fn targets_for(
        &self,
        source_asn: Asn,
        source_type: PeerType,
        peers: &[(Asn, PeerType)],
    ) -> Vec<Asn> {
        peers
            .iter()
            .filter(|(asn, _)| *asn != source_asn)
            .filter(|(_, peer_type)| reflects_to(source_type, *peer_type))
            .map(|(asn, _)| *asn)
            .collect()
    }

    /// Run reflector policies and decorate the route for re-advertisement.
    /// None means a policy decided `no-reflect`.
    pub fn reflect(&self, route: &Route, originator_address: &str) -> Option<Route> {
        let now = chrono::Utc::now();
        let mut reflected = route.clone();
        for policy in self.policies.iter().filter(|p| p.enabled) {
            if !policy.matcher.matches(route, now) {
                continue;
            }
            match policy.action.action {
                ActionKind::Reject => {
                    trace!(
                        "Reflection of {} suppressed by '{}'",
                        route.agent_id,
                        policy.name
                    );
                    return None;
                }
                ActionKind::Modify => {
                    if let Some(local_pref) = policy.action.set_local_pref {
                        reflected.local_pref = local_pref;
                    }
                    if let Some(med) = policy.action.set_med {
                        reflected.med = med;
                    }
                    for community in &policy.action.add_communities {
                        reflected.communities.add(community);
                    }
                    for community in &policy.action.remove_communities {
                        reflected.communities.remove(community);
                    }
                }
                ActionKind::Accept => {}
            }
            break;
        }

        if reflected.attribute(ATTR_ORIGINATOR_ID).is_none() {
            reflected.set_attribute(ATTR_ORIGINATOR_ID, json!(originator_address));
        }
        reflected.set_attribute(ATTR_CLUSTER_ID, json!(self.cluster_id.clone()));
        reflected.communities.add(REFLECTED_COMMUNITY);
        Some(reflected)
    }
}
