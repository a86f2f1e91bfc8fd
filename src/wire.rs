//! Wire envelope for the realtime channel.
//!
//! One message carries a batch of coalesced change descriptors tagged
//! with the sending client's identity, so receivers can filter their
//! own echo. Serialized with bincode for minimal overhead.
//!
//! ```text
//! ┌────────┬───────────┬──────────┬────────────────────┐
//! │ event  │ sender_id │ board_id │ changes: [Change]  │
//! └────────┴───────────┴──────────┴────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::Change;

/// Event name for board change batches.
pub const EVENT_BOARD_CHANGES: &str = "board_changes";

/// Top-level channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    pub sender_id: Uuid,
    pub board_id: Uuid,
    pub changes: Vec<Change>,
}

impl WireMessage {
    /// Create a board-changes batch message.
    pub fn changes(sender_id: Uuid, board_id: Uuid, changes: Vec<Change>) -> Self {
        Self {
            event: EVENT_BOARD_CHANGES.to_string(),
            sender_id,
            board_id,
            changes,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ChannelError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ChannelError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Realtime channel errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    Serialization(String),
    Deserialization(String),
    /// The channel is not in a joined state; sends are dropped.
    NotJoined,
    ConnectionClosed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::NotJoined => write!(f, "Channel not joined"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ChannelError {}
