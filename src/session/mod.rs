mod codec;
mod hold_timer;
mod manager;
mod message_counts;
mod poller;
#[allow(clippy::module_inception)]
mod session;

use std::convert::From;
use std::error;
use std::fmt;
use std::io;

pub use codec::{MessageCodec, MessageProtocol};
use hold_timer::HoldTimer;
pub use manager::{SessionManager, SessionSummary};
use message_counts::MessageCounts;
pub use poller::{Poller, PollerCommand, PollerConnection, PollerTx};
pub use session::Session;

use crate::message::{DiscoveryRequestMessage, DiscoveryResponseMessage, UpdateMessage};
use crate::rib::Asn;

/// Output of driving a session forward, consumed by the handler
#[derive(Debug)]
pub enum SessionUpdate {
    /// Session reached Established with a peer
    Established(Asn),
    /// UPDATE received from a peer
    Learned((Asn, UpdateMessage)),
    /// Peer asked for its advertisements to be re-sent
    RefreshRequested(Asn),
    /// Broadcast discovery traffic
    DiscoveryRequest((Asn, DiscoveryRequestMessage)),
    DiscoveryResponse((Asn, DiscoveryResponseMessage)),
    /// Sessions ended; clear RIB state for these peers
    Ended(Vec<Asn>),
}

/// Four externally observable peer states
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connect,
    /// Incoming connection awaiting the peer's OPEN
    Active,
    Established,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            SessionState::Idle => "Idle",
            SessionState::Connect => "Connect",
            SessionState::Active => "Active",
            SessionState::Established => "Established",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Peer de-configured
    Deconfigured,
    /// Protocol version mismatch in OPEN. [received, expected]
    OpenVersionMismatch(u32, u32),
    /// Received an unexpected ASN. [received, expected]
    OpenAsnMismatch(Asn, Asn),
    /// OPEN from an ASN with no configured peer. [asn]
    UnknownPeer(Asn),
    /// Message arrived in a state that cannot accept it. [state, message kind]
    FiniteStateMachine(SessionState, &'static str),
    /// Hold time expired. [seconds]
    HoldTimeExpired(u64),
    /// Something happened in transport. [reason]
    TransportError(String),
    /// Some other issue happened. [reason]
    Other(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Session Error: ")?;
        use SessionError::*;
        match self {
            Deconfigured => write!(f, "Peer de-configured"),
            OpenVersionMismatch(r, e) => {
                write!(f, "OPEN version mismatch (received={}, expected={})", r, e)
            }
            OpenAsnMismatch(r, e) => {
                write!(f, "OPEN ASN mismatch (received={}, expected={})", r, e)
            }
            UnknownPeer(asn) => write!(f, "OPEN from unknown peer AS{}", asn),
            FiniteStateMachine(state, kind) => {
                write!(f, "Unexpected {} while {}", kind, state)
            }
            HoldTimeExpired(secs) => write!(f, "Hold time expired after {} seconds", secs),
            TransportError(reason) => write!(f, "Transport error [{}]", reason),
            Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        SessionError::TransportError(error.to_string())
    }
}

impl error::Error for SessionError {}
