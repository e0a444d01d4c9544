use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};

use super::codec::MessageProtocol;
use super::{HoldTimer, MessageCounts};
use super::{SessionError, SessionState, SessionUpdate};
use crate::config::PeerConfig;
use crate::message::{
    local_capabilities, KeepaliveMessage, Message, NotificationMessage, OpenMessage,
    PROTOCOL_VERSION,
};
use crate::rib::Asn;
use crate::utils::format_time_as_elapsed;

/// Consecutive send failures tolerated before the error escalates
const SEND_FAILURE_THRESHOLD: u32 = 3;

/// This is where a connected peer is managed.
///
/// A `Session` is a stream for processing routing messages and handling
/// peer timeouts; outbound messages are queued by the manager and drained
/// in FIFO order once the session is Established.
pub struct Session {
    pub(crate) addr: SocketAddr,
    pub(crate) state: SessionState,
    pub(crate) peer: Arc<PeerConfig>,
    /// Learned from the peer's OPEN; authoritative for wildcard peers
    pub(crate) remote_asn: Option<Asn>,
    pub(crate) remote_router_id: Option<String>,
    protocol: MessageProtocol,
    pub(crate) connect_time: DateTime<Utc>,
    pub(crate) last_update: Option<DateTime<Utc>>,
    pub(crate) hold_timer: HoldTimer,
    pub(crate) counts: MessageCounts,
    /// Negotiated capability intersection
    pub(crate) capabilities: Vec<String>,
    outbound: VecDeque<Message>,
    locally_initiated: bool,
    open_sent: bool,
    send_failures: u32,
}

impl Session {
    /// Session for a connection we dialed out; OPEN goes first
    pub fn new_outgoing(peer: Arc<PeerConfig>, protocol: MessageProtocol) -> Session {
        Self::new(peer, protocol, SessionState::Connect, true)
    }

    /// Session for an incoming connection; we wait for the peer's OPEN
    pub fn new_incoming(peer: Arc<PeerConfig>, protocol: MessageProtocol) -> Session {
        Self::new(peer, protocol, SessionState::Active, false)
    }

    fn new(
        peer: Arc<PeerConfig>,
        protocol: MessageProtocol,
        state: SessionState,
        locally_initiated: bool,
    ) -> Session {
        let hold_time = peer.hold_time;
        let addr = protocol
            .get_ref()
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        Session {
            addr,
            state,
            peer,
            remote_asn: None,
            remote_router_id: None,
            protocol,
            connect_time: Utc::now(),
            last_update: None,
            hold_timer: HoldTimer::new(hold_time),
            counts: MessageCounts::new(),
            capabilities: local_capabilities(),
            outbound: VecDeque::new(),
            locally_initiated,
            open_sent: false,
            send_failures: 0,
        }
    }

    /// The peer's ASN: negotiated if the OPEN has arrived, configured otherwise
    pub fn asn(&self) -> Asn {
        self.remote_asn.unwrap_or(self.peer.asn)
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn update_state(&mut self, new_state: SessionState) {
        debug!("{} went from {} to {}", self.addr, self.state, new_state);
        self.state = new_state;
    }

    pub fn update_config(&mut self, new_config: Arc<PeerConfig>) {
        debug!("Peer config for {} (active session) updated", self.addr);
        self.peer = new_config;
    }

    /// Queue a message for delivery; drained in FIFO order while Established
    pub fn enqueue(&mut self, message: Message) {
        self.outbound.push_back(message);
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Main function for making progress with the session.
    /// Waits for either a new incoming message or a HoldTimer event;
    /// bounded by the hold timer's internal tick.
    pub async fn run(&mut self) -> Result<Option<SessionUpdate>, SessionError> {
        if !self.peer.enabled {
            // Peer has been disabled, shutdown session
            return Err(SessionError::Deconfigured);
        }
        if self.state == SessionState::Connect && !self.open_sent {
            let open = self.create_open();
            self.send_message(Message::Open(open)).await?;
            self.open_sent = true;
        }

        if self.state == SessionState::Established {
            while let Some(message) = self.outbound.pop_front() {
                self.send_message(message).await?;
            }
        }

        tokio::select! {
            message = self.protocol.next() => {
                match message {
                    // Framed stream is exhausted, remote side closed connection
                    None => Err(SessionError::Other(format!(
                        "Session ended with {}",
                        self.addr
                    ))),
                    Some(Ok(message)) => {
                        trace!("[{}] Incoming: {}", self.addr, message.kind());
                        self.counts.increment_received();
                        self.hold_timer.received();
                        let was_established = self.is_established();
                        let response = self.process_message(message)?;
                        let update = match response {
                            MessageResponse::Replies(messages) => {
                                for message in messages {
                                    self.send_message(message).await?;
                                }
                                None
                            }
                            MessageResponse::Update(update) => {
                                Some(SessionUpdate::Learned((self.asn(), update)))
                            }
                            MessageResponse::Refresh => {
                                Some(SessionUpdate::RefreshRequested(self.asn()))
                            }
                            MessageResponse::Discovery(request) => {
                                Some(SessionUpdate::DiscoveryRequest((self.asn(), request)))
                            }
                            MessageResponse::DiscoveryReply(response) => {
                                Some(SessionUpdate::DiscoveryResponse((self.asn(), response)))
                            }
                            MessageResponse::Empty => None,
                        };
                        if update.is_some() {
                            return Ok(update);
                        }
                        if !was_established && self.is_established() {
                            return Ok(Some(SessionUpdate::Established(self.asn())));
                        }
                        Ok(None)
                    }
                    // Error decoding message
                    Some(Err(err)) => Err(SessionError::Other(format!(
                        "Session ended with {}: {}",
                        self.addr, err
                    ))),
                }
            },
            // Hold timer
            keepalive = self.hold_timer.should_send_keepalive() => {
                match keepalive {
                    Err(err) => Err(err),
                    Ok(should_send) => {
                        if should_send && self.is_established() {
                            self.send_message(Message::Keepalive(KeepaliveMessage::new(
                                self.peer.local_asn,
                            )))
                            .await?;
                        }
                        Ok(None)
                    }
                }
            },
        }
    }

    pub fn process_message(&mut self, message: Message) -> Result<MessageResponse, SessionError> {
        let response = match message {
            Message::Open(open) => {
                self.open_received(open)?;
                match self.state {
                    // Remote initiated, reply with OPEN + KEEPALIVE
                    SessionState::Active => {
                        let replies = vec![
                            Message::Open(self.create_open()),
                            Message::Keepalive(KeepaliveMessage::new(self.peer.local_asn)),
                        ];
                        self.update_state(SessionState::Established);
                        MessageResponse::Replies(replies)
                    }
                    // We initiated; the peer's OPEN acknowledges ours
                    SessionState::Connect => {
                        self.update_state(SessionState::Established);
                        MessageResponse::Replies(vec![Message::Keepalive(KeepaliveMessage::new(
                            self.peer.local_asn,
                        ))])
                    }
                    state => {
                        return Err(SessionError::FiniteStateMachine(state, "OPEN"));
                    }
                }
            }
            Message::Keepalive(_) => MessageResponse::Empty,
            Message::Update(update) => {
                if !self.is_established() {
                    return Err(SessionError::FiniteStateMachine(self.state, "UPDATE"));
                }
                self.last_update = Some(Utc::now());
                MessageResponse::Update(update)
            }
            Message::Notification(notification) => {
                warn!(
                    "{} NOTIFICATION from AS{}: {}",
                    self.addr, notification.sender_asn, notification.reason
                );
                MessageResponse::Empty
            }
            Message::RouteRefresh(_) => {
                if self.is_established() {
                    MessageResponse::Refresh
                } else {
                    MessageResponse::Empty
                }
            }
            Message::DiscoveryRequest(request) => MessageResponse::Discovery(request),
            Message::DiscoveryResponse(response) => MessageResponse::DiscoveryReply(response),
        };
        Ok(response)
    }

    // Send a message, and flush the send buffer afterwards.
    // A single failure is transient; repeated failures escalate.
    pub async fn send_message(&mut self, message: Message) -> Result<(), SessionError> {
        trace!("[{}] Outgoing: {}", self.addr, message.kind());
        match self.protocol.send(message).await {
            Ok(()) => {
                self.send_failures = 0;
                self.counts.increment_sent();
                self.hold_timer.sent();
                Ok(())
            }
            Err(err) => {
                self.send_failures += 1;
                if self.send_failures >= SEND_FAILURE_THRESHOLD {
                    Err(SessionError::TransportError(err.to_string()))
                } else {
                    warn!(
                        "[{}] Send failure {}/{}: {}",
                        self.addr, self.send_failures, SEND_FAILURE_THRESHOLD, err
                    );
                    Ok(())
                }
            }
        }
    }

    pub async fn notify(&mut self, reason: &str) {
        let notification = NotificationMessage {
            sender_asn: self.peer.local_asn,
            reason: reason.to_string(),
        };
        // Best effort; the session is going away regardless
        if let Err(err) = self.protocol.send(Message::Notification(notification)).await {
            trace!("[{}] NOTIFICATION not delivered: {}", self.addr, err);
        }
    }

    fn open_received(&mut self, open: OpenMessage) -> Result<(), SessionError> {
        if open.version != PROTOCOL_VERSION {
            return Err(SessionError::OpenVersionMismatch(
                open.version,
                PROTOCOL_VERSION,
            ));
        }
        if !self.peer.accepts_asn(open.asn) {
            return Err(SessionError::OpenAsnMismatch(open.asn, self.peer.asn));
        }
        // Negotiated hold time is the lower of the two sides
        let hold_time = cmp::min(open.hold_time, self.peer.hold_time);
        debug!(
            "[{}] Received OPEN from AS{} [hold {}s, {} capabilities]",
            self.addr,
            open.asn,
            hold_time,
            open.capabilities.len()
        );
        self.hold_timer = HoldTimer::new(hold_time);
        self.capabilities = local_capabilities()
            .into_iter()
            .filter(|c| open.capabilities.contains(c))
            .collect();
        self.remote_asn = Some(open.asn);
        self.remote_router_id = Some(open.router_id);
        Ok(())
    }

    pub fn create_open(&self) -> OpenMessage {
        OpenMessage {
            version: PROTOCOL_VERSION,
            asn: self.peer.local_asn,
            hold_time: self.peer.hold_time,
            router_id: self.peer.local_router_id.clone(),
            capabilities: local_capabilities(),
        }
    }

    pub fn is_locally_initiated(&self) -> bool {
        self.locally_initiated
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} AS{} uptime={} hold_time={}>",
            self.addr,
            self.asn(),
            format_time_as_elapsed(self.connect_time),
            self.hold_timer,
        )
    }
}

#[derive(Debug)]
pub enum MessageResponse {
    Replies(Vec<Message>),
    Update(crate::message::UpdateMessage),
    Refresh,
    Discovery(crate::message::DiscoveryRequestMessage),
    DiscoveryReply(crate::message::DiscoveryResponseMessage),
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UpdateMessage;
    use crate::reflector::PeerType;
    use crate::rib::Route;
    use crate::session::codec::MessageCodec;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{timeout, Duration};
    use tokio_util::codec::Framed;

    fn peer_config(asn: Asn, hold_time: u64) -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            asn,
            address: String::new(),
            name: format!("as{}", asn),
            enabled: true,
            passive: false,
            hold_time,
            peer_type: PeerType::Ebgp,
            local_asn: 65000,
            local_router_id: "as65000".to_string(),
        })
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialed = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (dialed, accepted)
    }

    /// Wildcard listener-side config announcing AS 65001
    fn listener_config(hold_time: u64) -> Arc<PeerConfig> {
        let mut config = peer_config(0, hold_time);
        {
            let config = Arc::get_mut(&mut config).unwrap();
            config.local_asn = 65001;
            config.local_router_id = "as65001".to_string();
        }
        config
    }

    /// Dialer (AS 65000 side) and listener (AS 65001 side) sessions wired
    /// back to back
    async fn session_pair(hold_time: u64) -> (Session, Session) {
        let (dialed, accepted) = socket_pair().await;
        let outgoing = Session::new_outgoing(
            peer_config(65001, hold_time),
            Framed::new(dialed, MessageCodec::new()),
        );
        let incoming = Session::new_incoming(
            listener_config(hold_time),
            Framed::new(accepted, MessageCodec::new()),
        );
        (outgoing, incoming)
    }

    async fn drive_until_established(outgoing: &mut Session, incoming: &mut Session) {
        for _ in 0..50 {
            if outgoing.is_established() && incoming.is_established() {
                return;
            }
            let _ = tokio::join!(outgoing.run(), incoming.run());
        }
        panic!(
            "Sessions never established (out={}, in={})",
            outgoing.state, incoming.state
        );
    }

    #[tokio::test]
    async fn test_open_exchange_establishes_both_sides() {
        let (mut outgoing, mut incoming) = session_pair(90).await;
        assert_eq!(outgoing.state, SessionState::Connect);
        assert_eq!(incoming.state, SessionState::Active);

        drive_until_established(&mut outgoing, &mut incoming).await;
        // The dialer learned the listener's ASN, and vice versa
        assert_eq!(outgoing.asn(), 65001);
        assert_eq!(incoming.asn(), 65000);
        // Both sides negotiated the full capability intersection
        assert!(outgoing.has_capability("agent-routing"));
        assert!(incoming.has_capability("path-vector"));
    }

    #[tokio::test]
    async fn test_hold_time_negotiates_to_minimum() {
        let (dialed, accepted) = socket_pair().await;
        let mut outgoing = Session::new_outgoing(
            peer_config(65001, 90),
            Framed::new(dialed, MessageCodec::new()),
        );
        let mut incoming = Session::new_incoming(
            listener_config(30),
            Framed::new(accepted, MessageCodec::new()),
        );
        drive_until_established(&mut outgoing, &mut incoming).await;
        assert_eq!(outgoing.hold_timer.hold_time, 30);
        assert_eq!(incoming.hold_timer.hold_time, 30);
    }

    #[tokio::test]
    async fn test_update_flows_between_peers() {
        let (mut outgoing, mut incoming) = session_pair(90).await;
        drive_until_established(&mut outgoing, &mut incoming).await;

        let mut route = Route::new("coder", vec!["coding".to_string()], "http://a:4111");
        route.as_path = vec![65000];
        outgoing.enqueue(Message::Update(UpdateMessage::advertise(65000, vec![route])));

        let mut learned = None;
        for _ in 0..50 {
            let (_, received) = tokio::join!(outgoing.run(), incoming.run());
            if let Ok(Some(SessionUpdate::Learned((asn, update)))) = received {
                learned = Some((asn, update));
                break;
            }
        }
        let (asn, update) = learned.expect("UPDATE was delivered");
        assert_eq!(asn, 65000);
        assert_eq!(update.advertised_routes.len(), 1);
        assert_eq!(update.advertised_routes[0].agent_id, "coder");
    }

    #[tokio::test]
    async fn test_open_asn_mismatch_is_rejected() {
        let (dialed, accepted) = socket_pair().await;
        // Dialer expects AS 65002 but the listener announces 65001
        let mut outgoing = Session::new_outgoing(
            peer_config(65002, 90),
            Framed::new(dialed, MessageCodec::new()),
        );
        let mut incoming = Session::new_incoming(
            listener_config(90),
            Framed::new(accepted, MessageCodec::new()),
        );
        let mut rejected = false;
        for _ in 0..50 {
            let (sent, _) = tokio::join!(outgoing.run(), incoming.run());
            if let Err(SessionError::OpenAsnMismatch(65001, 65002)) = sent {
                rejected = true;
                break;
            }
        }
        assert!(rejected, "ASN mismatch never surfaced");
    }

    // Hold-timer expiry: with a 1s hold time and a silent peer, the
    // session errors out within 1.5s
    #[tokio::test]
    async fn test_hold_timer_expiry() {
        let (dialed, _accepted) = socket_pair().await;
        let mut outgoing = Session::new_outgoing(
            peer_config(65001, 1),
            Framed::new(dialed, MessageCodec::new()),
        );
        let result = timeout(Duration::from_millis(1500), async {
            loop {
                if let Err(err) = outgoing.run().await {
                    return err;
                }
            }
        })
        .await
        .expect("Session should expire within 1.5s");
        assert!(matches!(result, SessionError::HoldTimeExpired(1)));
    }
}
