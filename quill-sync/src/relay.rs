//! WebSocket signaling relay.
//!
//! Clients that cannot reach each other directly meet at the relay. Each
//! side of a mesh edge opens a WebSocket and announces its channel key; the
//! relay pairs the two sides and then pipes binary frames between them until
//! either one leaves.
//!
//! ```text
//!  caller ──Hello{key, Caller}──►┐
//!                                ├── pair on key ──► Paired ──► pipe
//!  callee ──Hello{key, Callee}──►┘
//! ```
//!
//! The relay never looks inside piped frames.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use async_trait::async_trait;

use crate::protocol::ProtocolError;
use crate::transport::{ChannelKey, PeerLink, Role, Signaling, TransportError};

/// Control messages exchanged before piping starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayControl {
    Hello { key: ChannelKey, role: Role },
    Paired,
}

impl RelayControl {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// How long a side waits for its partner before being dropped
    pub pair_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9190".to_string(),
            pair_timeout: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `QUILL_RELAY_ADDR` and
    /// `QUILL_RELAY_PAIR_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("QUILL_RELAY_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(raw) = std::env::var("QUILL_RELAY_PAIR_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => config.pair_timeout = Duration::from_secs(secs),
                Err(_) => log::warn!(
                    "ignoring QUILL_RELAY_PAIR_TIMEOUT_SECS={raw:?}, keeping {:?}",
                    config.pair_timeout
                ),
            }
        }
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub pairs_formed: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    pairs_formed: AtomicU64,
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
}

type Socket = WebSocketStream<TcpStream>;

struct Waiting {
    role: Role,
    tx: oneshot::Sender<Socket>,
}

#[derive(Clone)]
pub struct RelayServer {
    config: RelayConfig,
    waiting: Arc<Mutex<HashMap<ChannelKey, Waiting>>>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            waiting: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            pairs_formed: self.stats.pairs_formed.load(Ordering::Relaxed),
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.stats.bytes_relayed.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("relay connection from {addr} ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let mut socket = tokio_tungstenite::accept_async(stream).await?;

        let (key, role) = loop {
            match socket.next().await {
                Some(Ok(Message::Binary(data))) => match RelayControl::decode(&data)? {
                    RelayControl::Hello { key, role } => break (key, role),
                    RelayControl::Paired => {
                        return Err(RelayError::Handshake("unexpected Paired".into()))
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        log::debug!(
            "{addr} announced {:?} for {} ({} -> {})",
            role,
            key.doc,
            key.caller.short(),
            key.callee.short()
        );

        let partner = {
            let mut waiting = self.lock_waiting();
            match waiting.remove(&key) {
                Some(w) if w.role == role.opposite() && !w.tx.is_closed() => Ok(w.tx),
                _ => {
                    let (tx, rx) = oneshot::channel();
                    waiting.insert(key.clone(), Waiting { role, tx });
                    Err(rx)
                }
            }
        };

        match partner {
            // Second side: hand our socket to the waiting task.
            Ok(tx) => {
                if tx.send(socket).is_err() {
                    log::debug!("partner for {} left before pairing", key.doc);
                }
                Ok(())
            }
            // First side: wait for the partner, then pipe.
            Err(rx) => match tokio::time::timeout(self.config.pair_timeout, rx).await {
                Ok(Ok(other)) => {
                    self.stats.pairs_formed.fetch_add(1, Ordering::Relaxed);
                    self.pipe(socket, other).await
                }
                _ => {
                    self.remove_stale(&key);
                    log::debug!("no partner for {} within {:?}", key.doc, self.config.pair_timeout);
                    let _ = socket.close(None).await;
                    Ok(())
                }
            },
        }
    }

    async fn pipe(&self, a: Socket, b: Socket) -> Result<(), RelayError> {
        let paired = RelayControl::Paired.encode()?;
        let (mut a_tx, mut a_rx) = a.split();
        let (mut b_tx, mut b_rx) = b.split();
        a_tx.send(Message::Binary(paired.clone().into())).await?;
        b_tx.send(Message::Binary(paired.into())).await?;

        loop {
            tokio::select! {
                msg = a_rx.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.count(data.len());
                        b_tx.send(Message::Binary(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                msg = b_rx.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.count(data.len());
                        a_tx.send(Message::Binary(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
            }
        }

        let _ = a_tx.close().await;
        let _ = b_tx.close().await;
        Ok(())
    }

    fn count(&self, bytes: usize) {
        self.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_relayed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn remove_stale(&self, key: &ChannelKey) {
        let mut waiting = self.lock_waiting();
        if waiting.get(key).is_some_and(|w| w.tx.is_closed()) {
            waiting.remove(key);
        }
    }

    fn lock_waiting(&self) -> MutexGuard<'_, HashMap<ChannelKey, Waiting>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

/// [`Signaling`] through a relay at `url` (e.g. `ws://127.0.0.1:9190`).
#[derive(Debug, Clone)]
pub struct RelaySignaling {
    url: String,
    buffer: usize,
}

impl RelaySignaling {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer: 256,
        }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

#[async_trait]
impl Signaling for RelaySignaling {
    async fn connect(&self, key: &ChannelKey, role: Role) -> Result<PeerLink, TransportError> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let hello = RelayControl::Hello {
            key: key.clone(),
            role,
        }
        .encode()?;
        sink.send(Message::Binary(hello.into()))
            .await
            .map_err(|_| TransportError::Closed)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if RelayControl::decode(&data)? == RelayControl::Paired {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(TransportError::Closed)
                }
                Some(Ok(_)) => {}
            }
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(self.buffer);

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if sink.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if in_tx.send(data.into()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok(PeerLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{ClientId, DocPath};

    #[test]
    fn test_control_roundtrip() {
        let key = ChannelKey::new(
            &DocPath::from("d"),
            ClientId::new(),
            ClientId::new(),
            Role::Caller,
        );
        let hello = RelayControl::Hello {
            key,
            role: Role::Callee,
        };
        assert_eq!(RelayControl::decode(&hello.encode().unwrap()).unwrap(), hello);
    }

    #[test]
    fn test_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9190");
        assert_eq!(config.pair_timeout, Duration::from_secs(30));
    }
}
