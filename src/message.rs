//! Wire messages exchanged between peered agent servers.
//!
//! One JSON object per message; the `type` tag selects the variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rib::{AgentId, Asn, Route};

/// Protocol version carried in OPEN; sessions require an exact match
pub const PROTOCOL_VERSION: u32 = 1;

pub const CAP_AGENT_ROUTING: &str = "agent-routing";
pub const CAP_PATH_VECTOR: &str = "path-vector";
pub const CAP_ROUTE_REFRESH: &str = "route-refresh";
pub const CAP_DISCOVERY_BROADCAST: &str = "discovery-broadcast";

/// Capabilities this implementation advertises in every OPEN
pub fn local_capabilities() -> Vec<String> {
    vec![
        CAP_AGENT_ROUTING.to_string(),
        CAP_PATH_VECTOR.to_string(),
        CAP_ROUTE_REFRESH.to_string(),
        CAP_DISCOVERY_BROADCAST.to_string(),
    ]
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "OPEN")]
    Open(OpenMessage),
    #[serde(rename = "UPDATE")]
    Update(UpdateMessage),
    #[serde(rename = "KEEPALIVE")]
    Keepalive(KeepaliveMessage),
    #[serde(rename = "NOTIFICATION")]
    Notification(NotificationMessage),
    #[serde(rename = "ROUTE_REFRESH")]
    RouteRefresh(RouteRefreshMessage),
    #[serde(rename = "DISCOVERY_REQUEST")]
    DiscoveryRequest(DiscoveryRequestMessage),
    #[serde(rename = "DISCOVERY_RESPONSE")]
    DiscoveryResponse(DiscoveryResponseMessage),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Open(_) => "OPEN",
            Message::Update(_) => "UPDATE",
            Message::Keepalive(_) => "KEEPALIVE",
            Message::Notification(_) => "NOTIFICATION",
            Message::RouteRefresh(_) => "ROUTEREFRESH",
            Message::DiscoveryRequest(_) => "DISCOVERYREQUEST",
            Message::DiscoveryResponse(_) => "DISCOVERYRESPONSE",
        }
    }

    pub fn sender_asn(&self) -> Asn {
        match self {
            Message::Open(open) => open.asn,
            Message::Update(update) => update.sender_asn,
            Message::Keepalive(keepalive) => keepalive.sender_asn,
            Message::Notification(notification) => notification.sender_asn,
            Message::RouteRefresh(refresh) => refresh.sender_asn,
            Message::DiscoveryRequest(request) => request.sender_asn,
            Message::DiscoveryResponse(response) => response.sender_asn,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenMessage {
    pub version: u32,
    pub asn: Asn,
    /// Seconds; 0 disables keepalives for the session
    pub hold_time: u64,
    pub router_id: String,
    pub capabilities: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "senderASN")]
    pub sender_asn: Asn,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advertised_routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub withdrawn_routes: Vec<AgentId>,
}

impl UpdateMessage {
    pub fn advertise(sender_asn: Asn, routes: Vec<Route>) -> Self {
        Self {
            timestamp: Utc::now(),
            sender_asn,
            advertised_routes: routes,
            withdrawn_routes: Vec::new(),
        }
    }

    pub fn withdraw(sender_asn: Asn, agent_ids: Vec<AgentId>) -> Self {
        Self {
            timestamp: Utc::now(),
            sender_asn,
            advertised_routes: Vec::new(),
            withdrawn_routes: agent_ids,
        }
    }

    /// Empty/absent lists make the UPDATE a no-op in both directions
    pub fn is_noop(&self) -> bool {
        self.advertised_routes.is_empty() && self.withdrawn_routes.is_empty()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepaliveMessage {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "senderASN")]
    pub sender_asn: Asn,
}

impl KeepaliveMessage {
    pub fn new(sender_asn: Asn) -> Self {
        Self {
            timestamp: Utc::now(),
            sender_asn,
        }
    }
}

/// Advisory only; the receiver logs it and may tear the session down
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    #[serde(rename = "senderASN")]
    pub sender_asn: Asn,
    pub reason: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRefreshMessage {
    #[serde(rename = "senderASN")]
    pub sender_asn: Asn,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequestMessage {
    #[serde(rename = "senderASN")]
    pub sender_asn: Asn,
    pub request_id: String,
    pub capability: String,
    /// Hop-count budget; decremented on re-broadcast, dropped at zero
    pub ttl: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponseMessage {
    #[serde(rename = "senderASN")]
    pub sender_asn: Asn,
    pub request_id: String,
    pub routes: Vec<Route>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::Route;

    #[test]
    fn test_message_tagging() {
        let keepalive = Message::Keepalive(KeepaliveMessage::new(65001));
        let encoded = serde_json::to_value(&keepalive).unwrap();
        assert_eq!(encoded.get("type").unwrap(), "KEEPALIVE");
        assert_eq!(encoded.get("senderASN").unwrap(), 65001);
    }

    #[test]
    fn test_update_roundtrip() {
        let mut route = Route::new("coder", vec!["coding".to_string()], "http://a:4111");
        route.as_path = vec![65001];
        let update = Message::Update(UpdateMessage::advertise(65001, vec![route]));
        let encoded = serde_json::to_string(&update).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Message::Update(update) => {
                assert_eq!(update.sender_asn, 65001);
                assert_eq!(update.advertised_routes.len(), 1);
                assert!(update.withdrawn_routes.is_empty());
            }
            other => panic!("Expected UPDATE, got {}", other.kind()),
        }
    }

    #[test]
    fn test_update_absent_lists_are_noop() {
        let raw = r#"{"type":"UPDATE","timestamp":"2026-01-01T00:00:00Z","senderASN":65002}"#;
        let decoded: Message = serde_json::from_str(raw).unwrap();
        match decoded {
            Message::Update(update) => assert!(update.is_noop()),
            other => panic!("Expected UPDATE, got {}", other.kind()),
        }
    }

    #[test]
    fn test_open_wire_fields() {
        let open = Message::Open(OpenMessage {
            version: PROTOCOL_VERSION,
            asn: 65001,
            hold_time: 90,
            router_id: "server1".to_string(),
            capabilities: local_capabilities(),
        });
        let encoded = serde_json::to_value(&open).unwrap();
        assert_eq!(encoded.get("holdTime").unwrap(), 90);
        assert_eq!(encoded.get("routerId").unwrap(), "server1");
    }
}
