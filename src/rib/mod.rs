pub mod decision;
mod route;

pub use route::{
    AgentId, Asn, CommunityList, HealthStatus, Route, ATTR_CLUSTER_ID, ATTR_ORIGINATOR_ID,
    DEFAULT_LOCAL_PREF, DEFAULT_MED, MAX_AS_PATH_LENGTH, REFLECTED_COMMUNITY,
};

use std::collections::HashMap;
use std::error;
use std::fmt;

use chrono::{Duration, Utc};
use log::{debug, warn};
use regex::Regex;

/// Age after which `validate` flags a route as a stale candidate.
/// Deletion stays with the discovery sweeper.
const STALE_CANDIDATE_HOURS: i64 = 24;

#[derive(Debug)]
pub enum RibError {
    /// AS path carries a duplicate ASN (loop). [agent id]
    PathLoop(AgentId),
    /// AS path exceeds the maximum length. [agent id, length]
    PathTooLong(AgentId, usize),
    /// Route for an egress table already carries the target peer's ASN. [agent id, peer]
    EgressLoop(AgentId, Asn),
    /// Capability query pattern did not compile. [reason]
    InvalidPattern(String),
}

impl fmt::Display for RibError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RibError::*;
        match self {
            PathLoop(agent_id) => write!(f, "Duplicate ASN in AS path for '{}'", agent_id),
            PathTooLong(agent_id, len) => write!(
                f,
                "AS path for '{}' has {} hops (max {})",
                agent_id, len, MAX_AS_PATH_LENGTH
            ),
            EgressLoop(agent_id, peer) => write!(
                f,
                "Route for '{}' already carries peer AS{} in its path",
                agent_id, peer
            ),
            InvalidPattern(reason) => write!(f, "Invalid capability pattern: {}", reason),
        }
    }
}

impl error::Error for RibError {}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RibTable {
    AdjRibIn,
    LocRib,
    AdjRibOut,
}

impl fmt::Display for RibTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            RibTable::AdjRibIn => "Adj-RIB-In",
            RibTable::LocRib => "Loc-RIB",
            RibTable::AdjRibOut => "Adj-RIB-Out",
        };
        write!(f, "{}", word)
    }
}

/// A consistency finding from [`Rib::validate`]
#[derive(Clone, Debug)]
pub struct RibViolation {
    pub table: RibTable,
    pub peer: Option<Asn>,
    pub agent_id: AgentId,
    pub detail: String,
}

impl fmt::Display for RibViolation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(
                f,
                "[{} AS{}] {}: {}",
                self.table, peer, self.agent_id, self.detail
            ),
            None => write!(f, "[{}] {}: {}", self.table, self.agent_id, self.detail),
        }
    }
}

/// Routing Information Base: the three route tables.
///
/// Adj-RIB-In holds routes exactly as received per peer (pre-policy),
/// Loc-RIB holds the single best route per agent id, Adj-RIB-Out holds the
/// post-export-policy routes to announce per peer. All queries hand out
/// cloned snapshots, never interior references.
#[derive(Debug, Default)]
pub struct Rib {
    adj_rib_in: HashMap<(Asn, AgentId), Route>,
    loc_rib: HashMap<AgentId, Route>,
    adj_rib_out: HashMap<(Asn, AgentId), Route>,
    /// Inserts rejected for path-loop/path-length violations
    rejected_inserts: u64,
}

impl Rib {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_path(route: &Route) -> Result<(), RibError> {
        if route.has_as_loop() {
            return Err(RibError::PathLoop(route.agent_id.clone()));
        }
        if route.as_path.len() > MAX_AS_PATH_LENGTH {
            return Err(RibError::PathTooLong(
                route.agent_id.clone(),
                route.as_path.len(),
            ));
        }
        Ok(())
    }

    // ---- Adj-RIB-In ----

    /// Store a route as received from a peer, overwriting any prior route
    /// for that (peer, agent id) without merging
    pub fn insert_from_peer(&mut self, peer: Asn, route: Route) -> Result<(), RibError> {
        if let Err(err) = Self::check_path(&route) {
            self.rejected_inserts += 1;
            warn!("Rejected insert from AS{}: {}", peer, err);
            return Err(err);
        }
        self.adj_rib_in.insert((peer, route.agent_id.clone()), route);
        Ok(())
    }

    pub fn withdraw_from_peer(&mut self, peer: Asn, agent_id: &str) -> bool {
        self.adj_rib_in
            .remove(&(peer, agent_id.to_string()))
            .is_some()
    }

    /// Remove every route learned from a peer, returning the count removed
    pub fn drop_all_from_peer(&mut self, peer: Asn) -> usize {
        let before = self.adj_rib_in.len();
        self.adj_rib_in.retain(|(asn, _), _| *asn != peer);
        let removed = before - self.adj_rib_in.len();
        debug!("Removed {} routes from Adj-RIB-In for AS{}", removed, peer);
        removed
    }

    /// All (source peer, route) alternatives known for one agent id
    pub fn alternatives_for(&self, agent_id: &str) -> Vec<(Asn, Route)> {
        self.adj_rib_in
            .iter()
            .filter(|((_, id), _)| id == agent_id)
            .map(|((asn, _), route)| (*asn, route.clone()))
            .collect()
    }

    pub fn agent_ids_from_peer(&self, peer: Asn) -> Vec<AgentId> {
        self.adj_rib_in
            .keys()
            .filter(|(asn, _)| *asn == peer)
            .map(|(_, agent_id)| agent_id.clone())
            .collect()
    }

    pub fn routes_from_peer(&self, peer: Asn) -> Vec<Route> {
        self.adj_rib_in
            .iter()
            .filter(|((asn, _), _)| *asn == peer)
            .map(|(_, route)| route.clone())
            .collect()
    }

    pub fn routes_received_from(&self, peer: Asn) -> u64 {
        self.adj_rib_in.keys().filter(|(asn, _)| *asn == peer).count() as u64
    }

    // ---- Loc-RIB ----

    pub fn install_best(&mut self, route: Route) -> Result<(), RibError> {
        if let Err(err) = Self::check_path(&route) {
            self.rejected_inserts += 1;
            warn!("Rejected Loc-RIB install: {}", err);
            return Err(err);
        }
        self.loc_rib.insert(route.agent_id.clone(), route);
        Ok(())
    }

    pub fn remove_best(&mut self, agent_id: &str) -> Option<Route> {
        self.loc_rib.remove(agent_id)
    }

    pub fn lookup_best(&self, agent_id: &str) -> Option<Route> {
        self.loc_rib.get(agent_id).cloned()
    }

    pub fn list_all_best(&self) -> Vec<Route> {
        self.loc_rib.values().cloned().collect()
    }

    pub fn best_count(&self) -> usize {
        self.loc_rib.len()
    }

    // ---- Adj-RIB-Out ----

    /// Store a post-export route to announce to a peer. Anti-loop on
    /// egress: the route must not already carry the peer's ASN.
    pub fn insert_for_peer(&mut self, peer: Asn, route: Route) -> Result<(), RibError> {
        if route.contains_as(peer) {
            self.rejected_inserts += 1;
            return Err(RibError::EgressLoop(route.agent_id.clone(), peer));
        }
        Self::check_path(&route)?;
        self.adj_rib_out.insert((peer, route.agent_id.clone()), route);
        Ok(())
    }

    pub fn remove_for_peer(&mut self, peer: Asn, agent_id: &str) -> bool {
        self.adj_rib_out
            .remove(&(peer, agent_id.to_string()))
            .is_some()
    }

    pub fn drop_all_for_peer(&mut self, peer: Asn) -> usize {
        let before = self.adj_rib_out.len();
        self.adj_rib_out.retain(|(asn, _), _| *asn != peer);
        before - self.adj_rib_out.len()
    }

    pub fn list_for_peer(&self, peer: Asn) -> Vec<Route> {
        self.adj_rib_out
            .iter()
            .filter(|((asn, _), _)| *asn == peer)
            .map(|(_, route)| route.clone())
            .collect()
    }

    pub fn lookup_for_peer(&self, peer: Asn, agent_id: &str) -> Option<Route> {
        self.adj_rib_out.get(&(peer, agent_id.to_string())).cloned()
    }

    /// Peers whose Adj-RIB-Out currently announces this agent id
    pub fn peers_announcing(&self, agent_id: &str) -> Vec<Asn> {
        self.adj_rib_out
            .keys()
            .filter(|(_, id)| id == agent_id)
            .map(|(asn, _)| *asn)
            .collect()
    }

    pub fn routes_sent_to(&self, peer: Asn) -> u64 {
        self.adj_rib_out.keys().filter(|(asn, _)| *asn == peer).count() as u64
    }

    // ---- Queries (over the installed best routes) ----

    pub fn find_by_capability(&self, capability: &str) -> Vec<Route> {
        self.loc_rib
            .values()
            .filter(|route| route.has_capability(capability))
            .cloned()
            .collect()
    }

    pub fn find_by_as(&self, asn: Asn) -> Vec<Route> {
        self.loc_rib
            .values()
            .filter(|route| route.contains_as(asn))
            .cloned()
            .collect()
    }

    pub fn find_by_community(&self, community: &str) -> Vec<Route> {
        self.loc_rib
            .values()
            .filter(|route| route.communities.contains(community))
            .cloned()
            .collect()
    }

    pub fn find_by_capability_pattern(&self, pattern: &str) -> Result<Vec<Route>, RibError> {
        let re = Regex::new(&pattern.to_lowercase())
            .map_err(|err| RibError::InvalidPattern(err.to_string()))?;
        Ok(self
            .loc_rib
            .values()
            .filter(|route| {
                route
                    .capabilities
                    .iter()
                    .any(|c| re.is_match(&c.to_lowercase()))
            })
            .cloned()
            .collect())
    }

    pub fn rejected_inserts(&self) -> u64 {
        self.rejected_inserts
    }

    /// Surface path-loop and path-length violations anywhere in the tables,
    /// and flag routes older than 24h as stale candidates. Never deletes.
    pub fn validate(&self) -> Vec<RibViolation> {
        let mut violations = Vec::new();
        let stale_cutoff = Utc::now() - Duration::hours(STALE_CANDIDATE_HOURS);

        let tables: [(RibTable, Box<dyn Iterator<Item = (Option<Asn>, &Route)> + '_>); 3] = [
            (
                RibTable::AdjRibIn,
                Box::new(self.adj_rib_in.iter().map(|((asn, _), r)| (Some(*asn), r))),
            ),
            (
                RibTable::LocRib,
                Box::new(self.loc_rib.values().map(|r| (None, r))),
            ),
            (
                RibTable::AdjRibOut,
                Box::new(self.adj_rib_out.iter().map(|((asn, _), r)| (Some(*asn), r))),
            ),
        ];
        for (table, routes) in tables {
            for (peer, route) in routes {
                if route.has_as_loop() {
                    violations.push(RibViolation {
                        table,
                        peer,
                        agent_id: route.agent_id.clone(),
                        detail: "duplicate ASN in AS path".to_string(),
                    });
                }
                if route.as_path.len() > MAX_AS_PATH_LENGTH {
                    violations.push(RibViolation {
                        table,
                        peer,
                        agent_id: route.agent_id.clone(),
                        detail: format!("AS path length {}", route.as_path.len()),
                    });
                }
                if route.origin_time < stale_cutoff {
                    violations.push(RibViolation {
                        table,
                        peer,
                        agent_id: route.agent_id.clone(),
                        detail: "stale candidate (older than 24h)".to_string(),
                    });
                }
            }
        }
        violations
    }

    pub fn clear(&mut self) {
        self.adj_rib_in.clear();
        self.loc_rib.clear();
        self.adj_rib_out.clear();
    }
}

impl fmt::Display for Rib {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Rib in={} loc={} out={}>",
            self.adj_rib_in.len(),
            self.loc_rib.len(),
            self.adj_rib_out.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(agent_id: &str, path: Vec<Asn>) -> Route {
        let mut route = Route::new(agent_id, vec!["coding".to_string()], "http://a:4111");
        route.as_path = path;
        route
    }

    #[test]
    fn test_insert_overwrites_without_merge() {
        let mut rib = Rib::new();
        rib.insert_from_peer(65001, route("coder", vec![65001])).unwrap();
        let mut replacement = route("coder", vec![65001, 65002]);
        replacement.local_pref = 200;
        rib.insert_from_peer(65001, replacement).unwrap();
        let alternatives = rib.alternatives_for("coder");
        assert_eq!(alternatives.len(), 1);
        assert_eq!(alternatives[0].1.local_pref, 200);
        assert_eq!(alternatives[0].1.as_path, vec![65001, 65002]);
    }

    #[test]
    fn test_insert_rejects_loop() {
        let mut rib = Rib::new();
        let err = rib
            .insert_from_peer(65001, route("coder", vec![65001, 65002, 65001]))
            .unwrap_err();
        assert!(matches!(err, RibError::PathLoop(_)));
        assert!(rib.alternatives_for("coder").is_empty());
        assert_eq!(rib.rejected_inserts(), 1);
    }

    #[test]
    fn test_insert_rejects_long_path() {
        let mut rib = Rib::new();
        let path: Vec<Asn> = (1..=(MAX_AS_PATH_LENGTH as u32 + 1)).collect();
        let err = rib.insert_from_peer(65001, route("coder", path)).unwrap_err();
        assert!(matches!(err, RibError::PathTooLong(_, _)));
    }

    #[test]
    fn test_withdraw_and_drop_all() {
        let mut rib = Rib::new();
        rib.insert_from_peer(65001, route("coder", vec![65001])).unwrap();
        rib.insert_from_peer(65001, route("tester", vec![65001])).unwrap();
        rib.insert_from_peer(65002, route("coder", vec![65002])).unwrap();

        assert!(rib.withdraw_from_peer(65001, "coder"));
        assert!(!rib.withdraw_from_peer(65001, "coder"));
        assert_eq!(rib.drop_all_from_peer(65001), 1);
        assert_eq!(rib.alternatives_for("coder").len(), 1);
    }

    #[test]
    fn test_egress_anti_loop() {
        let mut rib = Rib::new();
        let err = rib
            .insert_for_peer(65002, route("coder", vec![65000, 65002]))
            .unwrap_err();
        assert!(matches!(err, RibError::EgressLoop(_, 65002)));
        assert!(rib.list_for_peer(65002).is_empty());

        rib.insert_for_peer(65002, route("coder", vec![65000, 65003])).unwrap();
        assert_eq!(rib.peers_announcing("coder"), vec![65002]);
    }

    #[test]
    fn test_capability_queries() {
        let mut rib = Rib::new();
        let mut weather = route("forecaster", vec![65001]);
        weather.capabilities = vec!["Weather".to_string()];
        rib.install_best(weather).unwrap();
        rib.install_best(route("coder", vec![65002])).unwrap();

        assert_eq!(rib.find_by_capability("weather").len(), 1);
        assert_eq!(rib.find_by_capability("WEATHER").len(), 1);
        assert_eq!(rib.find_by_as(65002).len(), 1);
        let matched = rib.find_by_capability_pattern("^cod.*").unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].agent_id, "coder");
        assert!(rib.find_by_capability_pattern("[invalid").is_err());
    }

    #[test]
    fn test_validate_flags_stale() {
        let mut rib = Rib::new();
        let mut old = route("coder", vec![65001]);
        old.origin_time = Utc::now() - Duration::hours(25);
        rib.install_best(old).unwrap();
        let violations = rib.validate();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].detail.contains("stale"));
        // validate flags but never deletes
        assert!(rib.lookup_best("coder").is_some());
    }
}
