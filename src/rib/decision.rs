//! Best-path selection across the alternatives for one agent id.
//!
//! The ordered tie-break mirrors the BGP decision process, minus the
//! origin-type step: localPref, AS-path length, MED, next-hop, most-recent
//! advertiser. The result is fully deterministic for any candidate set.

use std::cmp::Ordering;

use super::{Asn, Route};

/// Compare two routes for preference; `Ordering::Greater` means `a` wins.
///
/// 1. Highest localPref
/// 2. Shortest AS path
/// 3. Lowest MED
/// 4. Lexicographically lowest next hop
/// 5. Lowest most-recent advertiser ASN
pub fn compare(a: &Route, b: &Route) -> Ordering {
    a.local_pref
        .cmp(&b.local_pref)
        .then_with(|| b.as_path.len().cmp(&a.as_path.len()))
        .then_with(|| b.med.cmp(&a.med))
        .then_with(|| b.next_hop.cmp(&a.next_hop))
        .then_with(|| {
            b.first_as()
                .unwrap_or(Asn::MAX)
                .cmp(&a.first_as().unwrap_or(Asn::MAX))
        })
}

/// Pick the best route from a candidate set. Empty input means the agent id
/// has no surviving alternative and any installed route should be removed.
pub fn select_best(candidates: Vec<Route>) -> Option<Route> {
    candidates.into_iter().reduce(|best, candidate| {
        if compare(&candidate, &best) == Ordering::Greater {
            candidate
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: Vec<Asn>, local_pref: u32, med: u32, next_hop: &str) -> Route {
        let mut route = Route::new("coder", vec!["coding".to_string()], next_hop);
        route.as_path = path;
        route.local_pref = local_pref;
        route.med = med;
        route
    }

    #[test]
    fn test_local_pref_beats_path_length() {
        let short = route(vec![65001], 100, 0, "http://a:4111");
        let long = route(vec![65002, 65003], 200, 0, "http://b:4111");
        let best = select_best(vec![short, long]).unwrap();
        assert_eq!(best.local_pref, 200);
        assert_eq!(best.as_path, vec![65002, 65003]);
    }

    #[test]
    fn test_shorter_path_wins_at_equal_pref() {
        let short = route(vec![65001], 100, 50, "http://a:4111");
        let long = route(vec![65002, 65003], 100, 0, "http://b:4111");
        let best = select_best(vec![long, short]).unwrap();
        assert_eq!(best.as_path, vec![65001]);
    }

    #[test]
    fn test_lower_med_wins() {
        let high = route(vec![65001], 100, 50, "http://a:4111");
        let low = route(vec![65002], 100, 10, "http://b:4111");
        let best = select_best(vec![high, low]).unwrap();
        assert_eq!(best.med, 10);
    }

    #[test]
    fn test_next_hop_breaks_ties() {
        let b = route(vec![65001], 100, 0, "http://b:4111");
        let a = route(vec![65002], 100, 0, "http://a:4111");
        let best = select_best(vec![b, a]).unwrap();
        assert_eq!(best.next_hop, "http://a:4111");
    }

    #[test]
    fn test_first_as_is_final_tiebreak() {
        let higher = route(vec![65002], 100, 0, "http://a:4111");
        let lower = route(vec![65001], 100, 0, "http://a:4111");
        let best = select_best(vec![higher, lower]).unwrap();
        assert_eq!(best.as_path, vec![65001]);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(select_best(vec![]).is_none());
    }

    #[test]
    fn test_selection_is_order_independent() {
        let a = route(vec![65001, 65002], 100, 10, "http://a:4111");
        let b = route(vec![65003], 100, 20, "http://b:4111");
        let c = route(vec![65004], 150, 0, "http://c:4111");
        let forward = select_best(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let reverse = select_best(vec![c, b, a]).unwrap();
        assert_eq!(forward.next_hop, reverse.next_hop);
        assert_eq!(forward.local_pref, 150);
    }

    // No alternative may strictly beat the installed route on the
    // decision tuple
    #[test]
    fn test_winner_dominates() {
        let candidates = vec![
            route(vec![65001], 100, 0, "http://a:4111"),
            route(vec![65002], 100, 5, "http://b:4111"),
            route(vec![65003, 65004], 200, 0, "http://c:4111"),
            route(vec![65005], 50, 0, "http://d:4111"),
        ];
        let best = select_best(candidates.clone()).unwrap();
        for candidate in &candidates {
            assert_ne!(compare(candidate, &best), Ordering::Greater);
        }
    }
}
