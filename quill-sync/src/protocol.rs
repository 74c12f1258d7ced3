//! Binary frame carried over a peer link.
//!
//! One link multiplexes document updates and awareness diffs:
//! ```text
//! ┌──────────┬───────────┬──────────┐
//! │ kind     │ from      │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │
//! └──────────┴───────────┴──────────┘
//! ```
//! Encoded with bincode (standard config). `from` is the client that
//! produced the frame, which receivers use as the `FromPeer` origin tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::origin::ClientId;

/// Frame types on a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Encoded state vector, sent when a link opens
    SyncStep1 = 1,
    /// State diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update (batched local edits or a relayed peer update)
    Update = 3,
    /// Awareness diff
    Awareness = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerFrame {
    pub kind: FrameKind,
    pub from: ClientId,
    pub payload: Vec<u8>,
}

impl PeerFrame {
    pub fn update(from: ClientId, update: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Update,
            from,
            payload: update,
        }
    }

    pub fn sync_step1(from: ClientId, state_vector: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncStep1,
            from,
            payload: state_vector,
        }
    }

    pub fn sync_step2(from: ClientId, diff: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::SyncStep2,
            from,
            payload: diff,
        }
    }

    /// Awareness frame. `encoded_update` comes from
    /// [`crate::awareness::AwarenessUpdate::encode`].
    pub fn awareness(from: ClientId, encoded_update: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Awareness,
            from,
            payload: encoded_update,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
