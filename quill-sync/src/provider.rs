//! Public handle of a sync session.
//!
//! ```text
//!  app ── edits ──► yrs::Doc ──observer──┐
//!                                        ▼
//!  Provider ── commands ──► Session (router task) ──► peers / remote / cache
//!     ▲                          │
//!     └── events, state, presence┘
//! ```
//!
//! Build one with [`Provider::builder`], edit the shared [`yrs::Doc`]
//! directly, listen on [`Provider::take_event_rx`], and call
//! [`Provider::destroy`] (or drop the handle) to leave.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use yrs::Doc;

use crate::awareness::{PresenceSnapshot, PresenceValue};
use crate::cache::{CacheError, LocalCache};
use crate::origin::{ClientId, DocPath};
use crate::protocol::ProtocolError;
use crate::remote::{default_mapper, DocumentMapper, RemoteError, RemoteStore};
use crate::router::{Command, Session, SessionParts};
use crate::transport::{Signaling, TransportError};

/// Session tuning. Every field can be overridden individually:
///
/// ```
/// use std::time::Duration;
/// use quill_sync::ProviderConfig;
///
/// let config = ProviderConfig {
///     max_wait: Duration::from_millis(50),
///     ..ProviderConfig::default()
/// };
/// assert_eq!(config.max_updates_threshold, 20);
/// ```
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Local edits merged into one outbound batch before it is sent at once
    pub max_updates_threshold: usize,
    /// Quiescence after the last local edit before the batch is sent
    pub max_wait: Duration,
    /// Quiescence before saving remotely; also how long to hold off after
    /// the remote record changed
    pub max_remote_wait: Duration,
    /// Delay before acting on "registered peers but no open link"
    pub reconnect_debounce: Duration,
    /// Wait before re-registering after a reconnect teardown; doubles per
    /// failed attempt
    pub reinit_backoff: Duration,
    pub max_reinit_backoff: Duration,
    /// Give up re-registering after this many attempts (`None`: never)
    pub max_reconnect_attempts: Option<u32>,
    /// Time allowed for one peer link to open
    pub connect_timeout: Duration,
    /// Observe only: no registration, no mesh, no local propagation
    pub read_only: bool,
    /// Frames buffered per peer link
    pub peer_buffer: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_updates_threshold: 20,
            max_wait: Duration::from_millis(100),
            max_remote_wait: Duration::from_millis(3000),
            reconnect_debounce: Duration::from_millis(2000),
            reinit_backoff: Duration::from_millis(500),
            max_reinit_backoff: Duration::from_secs(30),
            max_reconnect_attempts: None,
            connect_timeout: Duration::from_secs(10),
            read_only: false,
            peer_buffer: 256,
        }
    }
}

impl ProviderConfig {
    /// Defaults with a short link timeout, for in-process tests.
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Connecting,
    Active,
    Reconnecting,
    Destroyed,
}

/// Notifications for the application.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// The remote record was seen for the first time.
    Ready,
    /// A remote save is pending (`true`) or settled (`false`).
    Saving(bool),
    Error(ProviderError),
    /// Access to the document was revoked.
    Deleted,
}

/// Registered identity of this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub client_id: ClientId,
    /// Server clock minus local clock, milliseconds
    pub offset_ms: i64,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("CRDT error: {0}")]
    Crdt(String),
    #[error("instance registration failed: {0}")]
    Registration(RemoteError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("session destroyed")]
    Destroyed,
}

pub struct ProviderBuilder {
    path: DocPath,
    doc: Doc,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    signaling: Arc<dyn Signaling>,
    config: ProviderConfig,
    mapper: DocumentMapper,
}

impl ProviderBuilder {
    pub fn config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// How the encoded state becomes the remote record.
    pub fn mapper(mut self, mapper: DocumentMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Start the session on the current tokio runtime.
    pub fn spawn(self) -> Provider {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Initializing);
        let (identity_tx, identity_rx) = watch::channel(None);
        let (presence_tx, presence_rx) = watch::channel(PresenceSnapshot::new());

        let session = Session::new(SessionParts {
            path: self.path.clone(),
            doc: self.doc.clone(),
            remote: self.remote,
            cache: self.cache,
            signaling: self.signaling,
            mapper: self.mapper,
            config: self.config,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            identity: identity_tx,
            presence: presence_tx,
        });
        tokio::spawn(session.run());

        Provider {
            path: self.path,
            doc: self.doc,
            commands: command_tx,
            events: Some(event_rx),
            state: state_rx,
            identity: identity_rx,
            presence: presence_rx,
        }
    }
}

/// Handle of one running session. Dropping it tears the session down.
pub struct Provider {
    path: DocPath,
    doc: Doc,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<ProviderEvent>>,
    state: watch::Receiver<SessionState>,
    identity: watch::Receiver<Option<Identity>>,
    presence: watch::Receiver<PresenceSnapshot>,
}

impl Provider {
    pub fn builder(
        path: impl Into<DocPath>,
        doc: Doc,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn LocalCache>,
        signaling: Arc<dyn Signaling>,
    ) -> ProviderBuilder {
        ProviderBuilder {
            path: path.into(),
            doc,
            remote,
            cache,
            signaling,
            config: ProviderConfig::default(),
            mapper: default_mapper(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ProviderEvent>> {
        self.events.take()
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Registered id; `None` before registration and in read-only sessions.
    pub fn client_id(&self) -> Option<ClientId> {
        self.identity.borrow().map(|identity| identity.client_id)
    }

    /// Server clock skew learned at registration.
    pub fn time_offset(&self) -> Option<i64> {
        self.identity.borrow().map(|identity| identity.offset_ms)
    }

    /// Set (or clear, with `None`) one field of this client's presence.
    pub fn set_presence(
        &self,
        key: impl Into<String>,
        value: Option<PresenceValue>,
    ) -> Result<(), ProviderError> {
        self.commands
            .send(Command::SetPresence {
                key: key.into(),
                value,
            })
            .map_err(|_| ProviderError::Destroyed)
    }

    /// Presence of every known client, this one included.
    pub fn presence(&self) -> PresenceSnapshot {
        self.presence.borrow().clone()
    }

    pub fn watch_presence(&self) -> watch::Receiver<PresenceSnapshot> {
        self.presence.clone()
    }

    /// Leave the session and wait until teardown has finished. Safe to
    /// call more than once.
    pub async fn destroy(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Destroy { ack: ack_tx }).is_ok() {
            // A dropped ack means the session already ended.
            let _ = ack_rx.await;
        }
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Destroyed).await;
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("client_id", &self.client_id())
            .finish()
    }
}
