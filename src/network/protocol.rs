//! Signaling Protocol
//!
//! Wire format for browser/peer <-> relay communication over WebSocket.
//! Every frame is a JSON object whose `event` field names the event.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a generated lobby code.
pub const LOBBY_CODE_LEN: usize = 6;

/// Short opaque lobby identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LobbyCode(String);

impl LobbyCode {
    /// Wrap an existing code (e.g. typed by a user).
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Draw a fresh code from a v4 UUID. Uniqueness against open lobbies is
    /// the registry's job.
    pub fn generate() -> Self {
        let mut code = uuid::Uuid::new_v4().simple().to_string();
        code.truncate(LOBBY_CODE_LEN);
        Self(code)
    }

    /// Borrow the code text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LobbyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Acknowledgement correlation id chosen by the client.
pub type AckId = u64;

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Events sent from a peer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Open a new lobby with the sender as host.
    Create,

    /// Join an existing lobby as client.
    Join { code: LobbyCode },

    /// Forward an opaque negotiation payload to the counterpart.
    Signal {
        code: LobbyCode,
        signal: serde_json::Value,
    },

    /// Tell the counterpart the round is starting.
    Start { code: LobbyCode },

    /// Leave the lobby.
    Leave { code: LobbyCode },
}

impl ClientEvent {
    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Create => "create",
            ClientEvent::Join { .. } => "join",
            ClientEvent::Signal { .. } => "signal",
            ClientEvent::Start { .. } => "start",
            ClientEvent::Leave { .. } => "leave",
        }
    }
}

/// A client event plus the optional acknowledgement id the relay must answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Ack id; when present the relay replies with exactly one `ack`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckId>,
    /// The event itself.
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientEnvelope {
    /// Envelope without acknowledgement.
    pub fn fire(event: ClientEvent) -> Self {
        Self { ack: None, event }
    }

    /// Envelope that asks for an acknowledgement.
    pub fn acked(id: AckId, event: ClientEvent) -> Self {
        Self { ack: Some(id), event }
    }
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Events sent from the relay to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Lobby created, sender is host.
    Created { code: LobbyCode },

    /// Joined a lobby as client.
    Joined { code: LobbyCode },

    /// A client joined the host's lobby.
    PeerJoined,

    /// Negotiation payload from the counterpart, untouched.
    Signal { signal: serde_json::Value },

    /// Counterpart started the round.
    Start,

    /// The client left (host side only).
    PeerLeft,

    /// The host closed the lobby (client side only).
    Closed,

    /// Error notification.
    Error { message: String },

    /// Reply to an acknowledged client event.
    Ack { id: AckId, reply: AckReply },
}

/// Acknowledgement body: a success payload or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AckReply {
    /// The request failed.
    Failed { error: String },
    /// The request succeeded.
    Done {
        /// Lobby code for `create` / `join`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<LobbyCode>,
    },
}

impl AckReply {
    /// Success without payload.
    pub fn done() -> Self {
        AckReply::Done { code: None }
    }

    /// Success carrying a lobby code.
    pub fn with_code(code: LobbyCode) -> Self {
        AckReply::Done { code: Some(code) }
    }

    /// Failure with a message.
    pub fn failed(error: impl Into<String>) -> Self {
        AckReply::Failed { error: error.into() }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientEnvelope {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerEvent {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
