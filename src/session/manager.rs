use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::codec::{MessageCodec, MessageProtocol};
use super::{Poller, PollerCommand, PollerConnection, PollerTx, Session, SessionUpdate};
use crate::config::{PeerConfig, ServerConfig};
use crate::message::Message;
use crate::reflector::PeerType;
use crate::rib::Asn;
use crate::utils::format_time_as_elapsed;
use tokio_util::codec::Framed;

/// Point-in-time view of one peer, for the control surface
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub name: String,
    pub asn: Asn,
    pub address: String,
    pub state: String,
    pub uptime: Option<String>,
    pub connect_time: Option<i64>,
    pub last_update: Option<i64>,
    pub msg_received: Option<u64>,
    pub msg_sent: Option<u64>,
    /// Filled in from the RIB by the routing core
    pub routes_received: Option<u64>,
    pub routes_sent: Option<u64>,
    pub capabilities: Vec<String>,
}

/// Owns every peer session and the poller that feeds them. Established
/// sessions are keyed by the peer's ASN; connections still handshaking
/// (either direction) wait in `handshaking` until their OPEN exchange
/// completes.
pub struct SessionManager {
    poller: Poller,
    sessions: HashMap<Asn, Session>,
    handshaking: Vec<Session>,
    peer_configs: Vec<Arc<PeerConfig>>,
    config: Arc<ServerConfig>,
    poller_tx: PollerTx,
}

impl SessionManager {
    pub fn new(config: Arc<ServerConfig>, listener: TcpListener) -> Self {
        let (poller_tx, poller_rx) = mpsc::unbounded_channel();
        let mut poller = Poller::new(listener, config.connect_retry_time, poller_rx);
        for peer_config in config.peers.iter() {
            poller.upsert_config(peer_config.clone());
        }

        Self {
            poller,
            sessions: HashMap::with_capacity(config.peers.len()),
            handshaking: Vec::new(),
            peer_configs: config.peers.to_vec(),
            config,
            poller_tx,
        }
    }

    /// Placeholder config for incoming connections; the real peer is
    /// resolved once its OPEN announces an ASN
    fn incoming_template(&self) -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            asn: 0,
            address: String::new(),
            name: "incoming".to_string(),
            enabled: true,
            passive: true,
            hold_time: self.config.hold_time,
            peer_type: PeerType::Ebgp,
            local_asn: self.config.local_asn,
            local_router_id: self.config.router_id.clone(),
        })
    }

    /// Drive all sessions forward and surface the next noteworthy update.
    /// Bounded: every inner wait has a timeout, so the caller can loop.
    pub async fn get_update(&mut self) -> Option<SessionUpdate> {
        // Handshaking sessions first; they graduate into the session map
        // when the OPEN exchange completes
        let mut index = 0;
        while index < self.handshaking.len() {
            match self.handshaking[index].run().await {
                Ok(Some(SessionUpdate::Established(asn))) => {
                    let mut session = self.handshaking.remove(index);
                    if !session.is_locally_initiated() {
                        // Resolve the configured peer for this ASN
                        match self.peer_configs.iter().find(|p| p.asn == asn) {
                            Some(config) => session.update_config(config.clone()),
                            None => {
                                warn!(
                                    "Unexpected OPEN from {} (AS{}): not a configured peer",
                                    session.addr, asn
                                );
                                session.notify("unknown peer").await;
                                continue;
                            }
                        }
                    }
                    if self.sessions.contains_key(&asn) {
                        warn!(
                            "Duplicate session with AS{} from {}: keeping the existing one",
                            asn, session.addr
                        );
                        session.notify("duplicate session").await;
                        continue;
                    }
                    info!("New session established: {} (AS{})", session.addr, asn);
                    self.sessions.insert(asn, session);
                    return Some(SessionUpdate::Established(asn));
                }
                Ok(_) => index += 1,
                Err(err) => {
                    let session = self.handshaking.remove(index);
                    debug!("Handshake with {} failed: {}", session.addr, err);
                    self.reschedule(&session);
                }
            }
        }

        // Established sessions
        let mut ended: Vec<Asn> = Vec::new();
        for (asn, session) in self.sessions.iter_mut() {
            match session.run().await {
                Ok(Some(update)) => return Some(update),
                Ok(None) => (),
                Err(err) => {
                    warn!("{}", err);
                    session.notify(&err.to_string()).await;
                    ended.push(*asn);
                }
            }
        }
        if !ended.is_empty() {
            for asn in &ended {
                if let Some(session) = self.sessions.remove(asn) {
                    self.reschedule(&session);
                }
            }
            return Some(SessionUpdate::Ended(ended));
        }

        // New connections, dial retries, and peer add/remove commands
        match self.poller.get_connection().await {
            Ok(Some(PollerConnection::Outgoing(stream, config))) => {
                let protocol: MessageProtocol = Framed::new(stream, MessageCodec::new());
                let session = Session::new_outgoing(config, protocol);
                debug!("Dialed {}; awaiting OPEN exchange", session.addr);
                self.handshaking.push(session);
            }
            Ok(Some(PollerConnection::Incoming(stream))) => {
                let protocol: MessageProtocol = Framed::new(stream, MessageCodec::new());
                let session = Session::new_incoming(self.incoming_template(), protocol);
                self.handshaking.push(session);
            }
            Ok(None) => (),
            Err(err) => warn!("Poller error: {}", err),
        }
        None
    }

    /// Put a dropped peer back on the dial schedule
    fn reschedule(&self, session: &Session) {
        if session.peer.address.is_empty() || !session.peer.enabled {
            return;
        }
        if self
            .poller_tx
            .send(PollerCommand::Upsert(session.peer.clone()))
            .is_err()
        {
            warn!("Poller is gone; {} will not reconnect", session.peer.address);
        }
    }

    /// Queue a message for one established peer
    pub fn send_to_peer(&mut self, asn: Asn, message: Message) -> bool {
        match self.sessions.get_mut(&asn) {
            Some(session) => {
                session.enqueue(message);
                true
            }
            None => false,
        }
    }

    /// Queue a message for every established peer, returning who got it
    pub fn broadcast(&mut self, message: Message) -> Vec<Asn> {
        let mut recipients = Vec::with_capacity(self.sessions.len());
        for (asn, session) in self.sessions.iter_mut() {
            session.enqueue(message.clone());
            recipients.push(*asn);
        }
        recipients
    }

    pub fn established_peers(&self) -> Vec<Asn> {
        self.sessions.keys().copied().collect()
    }

    /// (ASN, peer class) of every established peer, for route reflection
    pub fn peer_classes(&self) -> Vec<(Asn, PeerType)> {
        self.sessions
            .iter()
            .map(|(asn, session)| (*asn, session.peer.peer_type))
            .collect()
    }

    pub fn peer_address(&self, asn: Asn) -> Option<String> {
        self.sessions.get(&asn).map(|s| s.addr.to_string())
    }

    pub fn peer_supports(&self, asn: Asn, capability: &str) -> bool {
        self.sessions
            .get(&asn)
            .map(|s| s.has_capability(capability))
            .unwrap_or(false)
    }

    /// Register a peer at runtime and schedule the first dial
    pub fn add_peer(&mut self, asn: Asn, address: &str) -> Arc<PeerConfig> {
        let config = Arc::new(PeerConfig {
            asn,
            address: address.to_string(),
            name: format!("as{}", asn),
            enabled: true,
            passive: false,
            hold_time: self.config.hold_time,
            peer_type: PeerType::Ebgp,
            local_asn: self.config.local_asn,
            local_router_id: self.config.router_id.clone(),
        });
        self.peer_configs.retain(|p| p.asn != asn || asn == 0);
        self.peer_configs.push(config.clone());
        let _ = self.poller_tx.send(PollerCommand::Upsert(config.clone()));
        config
    }

    /// Kick an immediate dial attempt for a configured peer
    pub fn dial_peer(&mut self, asn: Asn) -> bool {
        if self.sessions.contains_key(&asn) {
            return true;
        }
        match self.peer_configs.iter().find(|p| p.asn == asn) {
            Some(config) => self
                .poller_tx
                .send(PollerCommand::Upsert(config.clone()))
                .is_ok(),
            None => false,
        }
    }

    /// Tear down a peer: NOTIFICATION if a session is up, then forget it.
    /// Returns whether the peer was known.
    pub async fn remove_peer(&mut self, asn: Asn) -> bool {
        let mut known = false;
        if let Some(mut session) = self.sessions.remove(&asn) {
            session.notify("peer de-configured").await;
            known = true;
        }
        if let Some(config) = self.peer_configs.iter().find(|p| p.asn == asn) {
            let _ = self
                .poller_tx
                .send(PollerCommand::Remove(config.address.clone()));
            known = true;
        }
        self.peer_configs.retain(|p| p.asn != asn);
        known
    }

    pub fn peer_configs(&self) -> Vec<Arc<PeerConfig>> {
        self.peer_configs.clone()
    }

    /// Summaries for every configured peer and live session
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|session| SessionSummary {
                name: session.peer.name.clone(),
                asn: session.asn(),
                address: session.addr.to_string(),
                state: session.state.to_string(),
                uptime: Some(format_time_as_elapsed(session.connect_time)),
                connect_time: Some(session.connect_time.timestamp()),
                last_update: session.last_update.map(|t| t.timestamp()),
                msg_received: Some(session.counts.received()),
                msg_sent: Some(session.counts.sent()),
                routes_received: None,
                routes_sent: None,
                capabilities: session.capabilities.clone(),
            })
            .collect();
        for session in &self.handshaking {
            summaries.push(SessionSummary {
                name: session.peer.name.clone(),
                asn: session.asn(),
                address: session.addr.to_string(),
                state: session.state.to_string(),
                uptime: None,
                connect_time: Some(session.connect_time.timestamp()),
                last_update: None,
                msg_received: Some(session.counts.received()),
                msg_sent: Some(session.counts.sent()),
                routes_received: None,
                routes_sent: None,
                capabilities: Vec::new(),
            });
        }
        for config in &self.peer_configs {
            let has_session = self
                .sessions
                .values()
                .any(|s| s.peer.address == config.address)
                || self
                    .handshaking
                    .iter()
                    .any(|s| s.peer.address == config.address);
            if !has_session {
                summaries.push(SessionSummary {
                    name: config.name.clone(),
                    asn: config.asn,
                    address: config.address.clone(),
                    state: "Idle".to_string(),
                    uptime: None,
                    connect_time: None,
                    last_update: None,
                    msg_received: None,
                    msg_sent: None,
                    routes_received: None,
                    routes_sent: None,
                    capabilities: Vec::new(),
                });
            }
        }
        summaries
    }

    /// Best-effort NOTIFICATION to every peer, then drop all sessions
    pub async fn shutdown(&mut self) {
        info!("Closing {} peer sessions", self.sessions.len());
        for (_, mut session) in self.sessions.drain() {
            session.notify("server shutting down").await;
        }
        self.handshaking.clear();
    }
}
