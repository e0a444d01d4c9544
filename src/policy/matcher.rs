//! Match clauses for policies. A policy matches a route iff every specified
//! clause holds; unspecified clauses are trivially true.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::rib::{Asn, HealthStatus, Route};

/// Exact value or set membership
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StringMatch {
    Exact(String),
    AnyOf(Vec<String>),
}

impl StringMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            StringMatch::Exact(wanted) => wanted == value,
            StringMatch::AnyOf(wanted) => wanted.iter().any(|w| w == value),
        }
    }
}

/// ASN clause, evaluated against every hop of the AS path
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AsnMatch {
    Any(Asn),
    AnyOf(Vec<Asn>),
    Range { min: Asn, max: Asn },
}

impl AsnMatch {
    fn matches(&self, as_path: &[Asn]) -> bool {
        match self {
            AsnMatch::Any(wanted) => as_path.contains(wanted),
            AsnMatch::AnyOf(wanted) => as_path.iter().any(|asn| wanted.contains(asn)),
            AsnMatch::Range { min, max } => as_path.iter().any(|asn| asn >= min && asn <= max),
        }
    }
}

/// Minutes-since-midnight window; `start > end` wraps across midnight
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TimeWindow {
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

impl TimeWindow {
    fn contains(&self, now: DateTime<Utc>) -> bool {
        let (start, end) = match (parse_hhmm(&self.start), parse_hhmm(&self.end)) {
            (Some(start), Some(end)) => (start, end),
            // An unparseable window never matches
            _ => return false,
        };
        let minute_of_day = now.hour() * 60 + now.minute();
        if start <= end {
            minute_of_day >= start && minute_of_day <= end
        } else {
            minute_of_day >= start || minute_of_day <= end
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyMatch {
    pub agent_id: Option<StringMatch>,
    /// Required: the route must offer every listed capability
    pub capabilities: Option<Vec<String>>,
    /// Any-of: at least one listed capability present
    pub capabilities_any: Option<Vec<String>>,
    pub asn: Option<AsnMatch>,
    pub health_status: Option<HealthStatus>,
    pub min_local_pref: Option<u32>,
    pub max_local_pref: Option<u32>,
    pub min_med: Option<u32>,
    pub max_med: Option<u32>,
    pub min_as_path_length: Option<usize>,
    pub max_as_path_length: Option<usize>,
    /// Lowercase day names ("monday" .. "sunday")
    pub days_of_week: Option<Vec<String>>,
    pub time_of_day: Option<TimeWindow>,
}

impl PolicyMatch {
    pub fn matches(&self, route: &Route, now: DateTime<Utc>) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if !agent_id.matches(&route.agent_id) {
                return false;
            }
        }
        if let Some(required) = &self.capabilities {
            if !required.iter().all(|c| route.has_capability(c)) {
                return false;
            }
        }
        if let Some(any_of) = &self.capabilities_any {
            if !any_of.iter().any(|c| route.has_capability(c)) {
                return false;
            }
        }
        if let Some(asn) = &self.asn {
            if !asn.matches(&route.as_path) {
                return false;
            }
        }
        if let Some(health) = self.health_status {
            if route.health() != health {
                return false;
            }
        }
        if let Some(min) = self.min_local_pref {
            if route.local_pref < min {
                return false;
            }
        }
        if let Some(max) = self.max_local_pref {
            if route.local_pref > max {
                return false;
            }
        }
        if let Some(min) = self.min_med {
            if route.med < min {
                return false;
            }
        }
        if let Some(max) = self.max_med {
            if route.med > max {
                return false;
            }
        }
        if let Some(min) = self.min_as_path_length {
            if route.as_path.len() < min {
                return false;
            }
        }
        if let Some(max) = self.max_as_path_length {
            if route.as_path.len() > max {
                return false;
            }
        }
        if let Some(days) = &self.days_of_week {
            let today = now.weekday().to_string().to_lowercase();
            // chrono renders "Mon"; accept both short and long forms
            if !days
                .iter()
                .any(|d| d.to_lowercase().starts_with(today.as_str()))
            {
                return false;
            }
        }
        if let Some(window) = &self.time_of_day {
            if !window.contains(now) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn route() -> Route {
        let mut route = Route::new(
            "coder",
            vec!["coding".to_string(), "review".to_string()],
            "http://a:4111",
        );
        route.as_path = vec![65001, 65002];
        route.communities.add("health:degraded");
        route
    }

    #[test]
    fn test_empty_match_is_trivially_true() {
        assert!(PolicyMatch::default().matches(&route(), Utc::now()));
    }

    #[test]
    fn test_agent_id_clauses() {
        let exact = PolicyMatch {
            agent_id: Some(StringMatch::Exact("coder".to_string())),
            ..Default::default()
        };
        assert!(exact.matches(&route(), Utc::now()));
        let set = PolicyMatch {
            agent_id: Some(StringMatch::AnyOf(vec![
                "tester".to_string(),
                "coder".to_string(),
            ])),
            ..Default::default()
        };
        assert!(set.matches(&route(), Utc::now()));
        let miss = PolicyMatch {
            agent_id: Some(StringMatch::Exact("tester".to_string())),
            ..Default::default()
        };
        assert!(!miss.matches(&route(), Utc::now()));
    }

    #[test]
    fn test_capability_clauses() {
        let all = PolicyMatch {
            capabilities: Some(vec!["coding".to_string(), "review".to_string()]),
            ..Default::default()
        };
        assert!(all.matches(&route(), Utc::now()));
        let missing = PolicyMatch {
            capabilities: Some(vec!["coding".to_string(), "weather".to_string()]),
            ..Default::default()
        };
        assert!(!missing.matches(&route(), Utc::now()));
        let any = PolicyMatch {
            capabilities_any: Some(vec!["weather".to_string(), "review".to_string()]),
            ..Default::default()
        };
        assert!(any.matches(&route(), Utc::now()));
    }

    #[test]
    fn test_asn_clauses() {
        let single = PolicyMatch {
            asn: Some(AsnMatch::Any(65002)),
            ..Default::default()
        };
        assert!(single.matches(&route(), Utc::now()));
        let range = PolicyMatch {
            asn: Some(AsnMatch::Range {
                min: 64512,
                max: 65534,
            }),
            ..Default::default()
        };
        assert!(range.matches(&route(), Utc::now()));
        let miss = PolicyMatch {
            asn: Some(AsnMatch::AnyOf(vec![65100, 65101])),
            ..Default::default()
        };
        assert!(!miss.matches(&route(), Utc::now()));
    }

    #[test]
    fn test_health_clause() {
        let degraded = PolicyMatch {
            health_status: Some(HealthStatus::Degraded),
            ..Default::default()
        };
        assert!(degraded.matches(&route(), Utc::now()));
        let healthy = PolicyMatch {
            health_status: Some(HealthStatus::Healthy),
            ..Default::default()
        };
        assert!(!healthy.matches(&route(), Utc::now()));
    }

    #[test]
    fn test_bounds() {
        let bounds = PolicyMatch {
            min_local_pref: Some(100),
            max_med: Some(0),
            max_as_path_length: Some(2),
            ..Default::default()
        };
        assert!(bounds.matches(&route(), Utc::now()));
        let too_long = PolicyMatch {
            max_as_path_length: Some(1),
            ..Default::default()
        };
        assert!(!too_long.matches(&route(), Utc::now()));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let window = PolicyMatch {
            time_of_day: Some(TimeWindow {
                start: "22:00".to_string(),
                end: "06:00".to_string(),
            }),
            ..Default::default()
        };
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 1, 5, 5, 0, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        assert!(window.matches(&route(), late));
        assert!(window.matches(&route(), early));
        assert!(!window.matches(&route(), midday));
    }

    #[test]
    fn test_day_of_week() {
        // 2026-01-05 is a Monday
        let monday = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let weekdays = PolicyMatch {
            days_of_week: Some(vec!["monday".to_string(), "tuesday".to_string()]),
            ..Default::default()
        };
        assert!(weekdays.matches(&route(), monday));
        let weekend = PolicyMatch {
            days_of_week: Some(vec!["saturday".to_string(), "sunday".to_string()]),
            ..Default::default()
        };
        assert!(!weekend.matches(&route(), monday));
    }
}
