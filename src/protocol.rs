//! JSON wire protocol between collaboration clients and rooms.
//!
//! Every frame is a UTF-8 text message carrying one envelope:
//! ```text
//! { "type": "sync" | "update" | "awareness",
//!   "roomId": "<document id>",
//!   "update" | "payload": [ <bytes> ] }
//! ```
//!
//! The message set is a closed enum: an unknown `type`, a missing field, or
//! a non-array byte field fails to decode, and the caller drops the frame
//! without replying. This is a best-effort streaming protocol, not an RPC —
//! no error responses travel over the collaboration channel.

use serde::{Deserialize, Serialize};

/// A validated protocol message.
///
/// `sync` and `update` carry a CRDT delta; the room treats them identically
/// once past validation, except that the initial room → client frame on
/// connect is always emitted as `sync`. `awareness` carries opaque presence
/// bytes that the room relays unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Full-state bootstrap, or a client pushing its entire local state.
    Sync {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
    },
    /// Incremental CRDT delta.
    Update {
        #[serde(rename = "roomId")]
        room_id: String,
        update: Vec<u8>,
    },
    /// Opaque awareness (presence) payload.
    Awareness {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: Vec<u8>,
    },
}

impl WireMessage {
    /// Room this message is addressed to.
    pub fn room_id(&self) -> &str {
        match self {
            WireMessage::Sync { room_id, .. }
            | WireMessage::Update { room_id, .. }
            | WireMessage::Awareness { room_id, .. } => room_id,
        }
    }

    /// Wire name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Sync { .. } => "sync",
            WireMessage::Update { .. } => "update",
            WireMessage::Awareness { .. } => "awareness",
        }
    }
}

/// Parse and validate one inbound text frame.
pub fn decode(text: &str) -> Result<WireMessage, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Serialize a message to its text frame.
pub fn encode(msg: &WireMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame did not parse as a known message shape.
    Malformed(String),
    /// Outbound serialization failed.
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "Malformed message: {e}"),
            ProtocolError::Encode(e) => write!(f, "Encode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
