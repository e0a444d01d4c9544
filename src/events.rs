//! Typed events wired between the session, advertisement, and discovery
//! components. Handlers subscribe to a broadcast channel; publishing never
//! blocks.

use tokio::sync::broadcast;

use crate::rib::{AgentId, Asn, HealthStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub enum Event {
    SessionEstablished { asn: Asn },
    SessionError { asn: Asn, reason: String },
    PeerRemoved { asn: Asn },
    RouteUpdate { asn: Asn, advertised: usize, withdrawn: usize },
    AgentDiscovered { agent_id: AgentId, source_asn: Asn },
    AgentLost { agent_id: AgentId, source_asn: Asn },
    CapabilityChanged { agent_id: AgentId, source_asn: Asn },
    PathHealthChanged { next_hop: String, status: HealthStatus },
    Shutdown,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionEstablished { .. } => "sessionEstablished",
            Event::SessionError { .. } => "sessionError",
            Event::PeerRemoved { .. } => "peerRemoved",
            Event::RouteUpdate { .. } => "routeUpdate",
            Event::AgentDiscovered { .. } => "agentDiscovered",
            Event::AgentLost { .. } => "agentLost",
            Event::CapabilityChanged { .. } => "capabilityChanged",
            Event::PathHealthChanged { .. } => "pathHealthChanged",
            Event::Shutdown => "shutdown",
        }
    }
}

/// Broadcast fan-out for [`Event`]s. Cloning shares the underlying channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; lagging or absent subscribers are not an error
    pub fn publish(&self, event: Event) {
        log::trace!("Event: {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
