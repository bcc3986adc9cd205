//! Data Channel Messages
//!
//! Gameplay traffic exchanged directly between the two peers once the data
//! channel is open. Each frame is a JSON object discriminated by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `type` values this side understands.
const KNOWN_TYPES: [&str; 6] = ["nick", "start", "score", "end", "targetSize", "gameDuration"];

/// Peer-to-peer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerMessage {
    /// Sender's display name.
    Nick {
        /// Display name.
        nick: String,
    },
    /// Round is starting.
    Start,
    /// Change to the sender's score.
    #[serde(rename = "score")]
    ScoreDelta {
        /// +1 for a hit, -1 for a miss.
        delta: i32,
    },
    /// Round is over.
    End,
    /// Host's target size.
    TargetSize {
        /// Size in scene units.
        value: f64,
    },
    /// Host's round length.
    GameDuration {
        /// Length in seconds.
        value: f64,
    },
}

/// A data channel frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed peer message: {0}")]
pub struct ProtocolError(pub String);

impl PeerMessage {
    /// Serialize to a JSON frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError(e.to_string()))
    }

    /// Decode a frame. Unknown `type` values yield `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError(e.to_string()))?;

        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(ProtocolError("missing type".to_string()));
        };
        if !KNOWN_TYPES.contains(&kind) {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ProtocolError(e.to_string()))
    }
}
