//! Peer transport: one bidirectional channel per mesh edge.
//!
//! ```text
//!            Signaling::connect(key, role)
//!  Connecting ───────────────────────────► Open ───► Closed
//!      │                                              ▲
//!      └──────── timeout / refused ───────────────────┘
//! ```
//!
//! Each [`PeerTransport`] owns a task that sets up the link through the
//! signaling collaborator, then pumps outbound frames and reports inbound
//! frames and state changes to the router as [`TransportEvent`]s. Events
//! carry a `link_id` so the router can drop events from links it already
//! replaced.

pub mod memory;

pub use memory::MemorySignaling;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::origin::{ClientId, DocPath};
use crate::protocol::{PeerFrame, ProtocolError};

/// Which end of a mesh edge this client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Initiates the edge (this peer is in our receiver set).
    Caller,
    /// Accepts the edge (this peer is in our sender set).
    Callee,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

/// Identifies one channel: both sides compute the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub doc: DocPath,
    pub caller: ClientId,
    pub callee: ClientId,
}

impl ChannelKey {
    /// Key for the edge between `local` and `remote`, seen from `local`
    /// playing `role`.
    pub fn new(doc: &DocPath, local: ClientId, remote: ClientId, role: Role) -> Self {
        let (caller, callee) = match role {
            Role::Caller => (local, remote),
            Role::Callee => (remote, local),
        };
        Self {
            doc: doc.clone(),
            caller,
            callee,
        }
    }

    pub fn involves(&self, id: &ClientId) -> bool {
        self.caller == *id || self.callee == *id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

/// Established byte pipe returned by signaling. Dropping `outgoing` closes
/// the link; `incoming` ends when the other side is gone.
#[derive(Debug)]
pub struct PeerLink {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
}

/// Channel setup. The wire format of the signaling exchange is the
/// implementation's business.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Resolve once the other side of `key` has connected too.
    async fn connect(&self, key: &ChannelKey, role: Role) -> Result<PeerLink, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    State(LinkState),
    Frame(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub peer: ClientId,
    pub link_id: u64,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("connection timed out")]
    Timeout,
    #[error("link closed")]
    Closed,
    #[error("outbound buffer full")]
    Backpressure,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Timing and buffering for one link.
#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub connect_timeout: Duration,
    /// Frames buffered before sends fail with `Backpressure`
    pub buffer: usize,
}

/// Router-side handle of one mesh edge.
pub struct PeerTransport {
    peer: ClientId,
    role: Role,
    link_id: u64,
    state: LinkState,
    outbound: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl PeerTransport {
    /// Start connecting to `peer`. Progress arrives on `events`.
    pub fn spawn(
        signaling: Arc<dyn Signaling>,
        key: ChannelKey,
        role: Role,
        peer: ClientId,
        link_id: u64,
        options: LinkOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(options.buffer.max(1));

        let task = tokio::spawn(async move {
            let emit = |kind| {
                events
                    .send(TransportEvent {
                        peer,
                        link_id,
                        kind,
                    })
                    .is_ok()
            };

            let link = match tokio::time::timeout(
                options.connect_timeout,
                signaling.connect(&key, role),
            )
            .await
            {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    log::debug!("link {link_id} to {} failed: {e}", peer.short());
                    emit(TransportEventKind::State(LinkState::Closed));
                    return;
                }
                Err(_) => {
                    log::debug!("link {link_id} to {} timed out", peer.short());
                    emit(TransportEventKind::State(LinkState::Closed));
                    return;
                }
            };

            if !emit(TransportEventKind::State(LinkState::Open)) {
                return;
            }

            let PeerLink {
                outgoing,
                mut incoming,
            } = link;
            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(bytes) => {
                            if outgoing.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        // Router closed the link; everything queued is sent.
                        None => break,
                    },
                    frame = incoming.recv() => match frame {
                        Some(bytes) => {
                            if !emit(TransportEventKind::Frame(bytes)) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }

            emit(TransportEventKind::State(LinkState::Closed));
        });

        Self {
            peer,
            role,
            link_id,
            state: LinkState::Connecting,
            outbound: Some(out_tx),
            task: Some(task),
        }
    }

    pub fn peer(&self) -> ClientId {
        self.peer
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Record a state change reported by the link task.
    pub fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    /// Queue a frame. Frames queued while still connecting go out once the
    /// link opens.
    pub fn send(&self, frame: &PeerFrame) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        let bytes = frame.encode()?;
        outbound.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Close the link. An open link drains its queue first; a link still
    /// connecting is abandoned.
    pub fn close(mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            if self.state != LinkState::Open {
                task.abort();
            }
        }
    }
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("link_id", &self.link_id)
            .field("state", &self.state)
            .finish()
    }
}
