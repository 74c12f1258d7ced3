//! Identities and update origins.
//!
//! Every mutation applied to the shared document carries an [`Origin`].
//! The router routes on it, and it is the only thing that stops an update
//! received from a peer (or from the remote store) from being sent back out
//! forever.
//!
//! yrs stores origins as opaque bytes, so the tagged union is mapped onto a
//! small byte codec:
//!
//! ```text
//! Local            → no origin (or any origin this crate did not write)
//! FromRemoteStore  → "quill:remote-store"
//! FromCacheReplay  → "quill:cache-replay"
//! FromPeer(id)     → "quill:peer/" ++ 16 uuid bytes
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

const REMOTE_STORE_TAG: &[u8] = b"quill:remote-store";
const CACHE_REPLAY_TAG: &[u8] = b"quill:cache-replay";
const PEER_PREFIX: &[u8] = b"quill:peer/";

/// Identity of one registered client instance.
///
/// Ordered so that every client sorts a registry snapshot the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Fresh random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Path naming one collaborative document, e.g. `stories/3f9a`.
///
/// All collaborators (cache, remote store, signaling) are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the per-document instance registry.
    pub fn instances_path(&self) -> String {
        format!("{}/instances", self.0)
    }
}

impl From<&str> for DocPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for DocPath {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a document mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Edit made by this client (editor binding, application code).
    Local,
    /// Update delivered over the mesh by the given directly-connected peer.
    FromPeer(ClientId),
    /// Update pulled from the authoritative remote record.
    FromRemoteStore,
    /// State replayed from the local durable cache at session start.
    FromCacheReplay,
}

impl Origin {
    /// Encode as a yrs transaction origin. `Local` has none.
    pub fn to_yrs(&self) -> Option<yrs::Origin> {
        match self {
            Origin::Local => None,
            Origin::FromRemoteStore => Some(yrs::Origin::from(REMOTE_STORE_TAG)),
            Origin::FromCacheReplay => Some(yrs::Origin::from(CACHE_REPLAY_TAG)),
            Origin::FromPeer(id) => {
                let mut bytes = Vec::with_capacity(PEER_PREFIX.len() + 16);
                bytes.extend_from_slice(PEER_PREFIX);
                bytes.extend_from_slice(id.as_uuid().as_bytes());
                Some(yrs::Origin::from(bytes.as_slice()))
            }
        }
    }

    /// Decode a yrs transaction origin.
    ///
    /// Anything this crate did not write, including no origin at all, is a
    /// local edit.
    pub fn from_yrs(origin: Option<&yrs::Origin>) -> Self {
        let Some(origin) = origin else {
            return Origin::Local;
        };
        Self::from_bytes(origin.as_ref())
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        if bytes == REMOTE_STORE_TAG {
            return Origin::FromRemoteStore;
        }
        if bytes == CACHE_REPLAY_TAG {
            return Origin::FromCacheReplay;
        }
        if let Some(rest) = bytes.strip_prefix(PEER_PREFIX) {
            if let Ok(raw) = <[u8; 16]>::try_from(rest) {
                return Origin::FromPeer(ClientId::from_uuid(Uuid::from_bytes(raw)));
            }
        }
        Origin::Local
    }
}
