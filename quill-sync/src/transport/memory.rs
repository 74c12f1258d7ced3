//! In-process signaling: pairs the two sides of a channel key and wires
//! their byte pipes together.
//!
//! ```text
//!  caller.outgoing ──► forwarder ──► callee.incoming
//!  caller.incoming ◄── forwarder ◄── callee.outgoing
//! ```
//!
//! Forwarders are separate tasks so a wire can be cut ([`sever`]) the way a
//! network path fails, without either side closing it.
//!
//! [`sever`]: MemorySignaling::sever_peer

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::{ChannelKey, PeerLink, Role, Signaling, TransportError};
use crate::origin::ClientId;

const DEFAULT_WIRE_BUFFER: usize = 256;

struct Waiting {
    role: Role,
    tx: oneshot::Sender<PeerLink>,
}

struct Inner {
    waiting: Mutex<HashMap<ChannelKey, Waiting>>,
    wires: Mutex<HashMap<ChannelKey, Vec<AbortHandle>>>,
    reachable: AtomicBool,
    connects: AtomicU64,
    wire_buffer: usize,
}

#[derive(Clone)]
pub struct MemorySignaling {
    inner: Arc<Inner>,
}

impl Default for MemorySignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_WIRE_BUFFER)
    }

    pub fn with_buffer(wire_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                waiting: Mutex::new(HashMap::new()),
                wires: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                connects: AtomicU64::new(0),
                wire_buffer: wire_buffer.max(1),
            }),
        }
    }

    /// When unreachable, every connect fails immediately.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Cut every wire touching `peer`. Both ends see their link end.
    pub fn sever_peer(&self, peer: ClientId) {
        let mut wires = lock(&self.inner.wires);
        wires.retain(|key, handles| {
            if key.involves(&peer) {
                handles.iter().for_each(AbortHandle::abort);
                false
            } else {
                true
            }
        });
    }

    pub fn sever_all(&self) {
        let mut wires = lock(&self.inner.wires);
        for handles in wires.values() {
            handles.iter().for_each(AbortHandle::abort);
        }
        wires.clear();
    }

    /// Connect calls made so far, both roles.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Wire two sides together, returning the link for each.
    fn pair(&self, key: &ChannelKey) -> (PeerLink, PeerLink) {
        let buffer = self.inner.wire_buffer;
        let (a_out, a_out_rx) = mpsc::channel::<Vec<u8>>(buffer);
        let (b_in_tx, b_in) = mpsc::channel::<Vec<u8>>(buffer);
        let (b_out, b_out_rx) = mpsc::channel::<Vec<u8>>(buffer);
        let (a_in_tx, a_in) = mpsc::channel::<Vec<u8>>(buffer);

        let forward_ab = tokio::spawn(forward(a_out_rx, b_in_tx));
        let forward_ba = tokio::spawn(forward(b_out_rx, a_in_tx));
        lock(&self.inner.wires).insert(
            key.clone(),
            vec![forward_ab.abort_handle(), forward_ba.abort_handle()],
        );

        (
            PeerLink {
                outgoing: a_out,
                incoming: a_in,
            },
            PeerLink {
                outgoing: b_out,
                incoming: b_in,
            },
        )
    }
}

async fn forward(mut rx: mpsc::Receiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if tx.send(bytes).await.is_err() {
            break;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn connect(&self, key: &ChannelKey, role: Role) -> Result<PeerLink, TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(format!(
                "{} -> {}",
                key.caller.short(),
                key.callee.short()
            )));
        }

        let rx = {
            let mut waiting = lock(&self.inner.waiting);
            let other = waiting
                .remove(key)
                .filter(|w| w.role == role.opposite() && !w.tx.is_closed());
            match other {
                Some(other) => {
                    drop(waiting);
                    let (mine, theirs) = self.pair(key);
                    if other.tx.send(theirs).is_err() {
                        return Err(TransportError::Closed);
                    }
                    return Ok(mine);
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    waiting.insert(key.clone(), Waiting { role, tx });
                    rx
                }
            }
        };

        rx.await.map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::DocPath;

    fn key() -> (ChannelKey, ClientId, ClientId) {
        let a = ClientId::new();
        let b = ClientId::new();
        (ChannelKey::new(&DocPath::from("d"), a, b, Role::Caller), a, b)
    }

    #[tokio::test]
    async fn test_both_sides_pair() {
        let signaling = MemorySignaling::new();
        let (key, _, _) = key();

        let caller = {
            let signaling = signaling.clone();
            let key = key.clone();
            tokio::spawn(async move { signaling.connect(&key, Role::Caller).await })
        };
        tokio::task::yield_now().await;
        let mut callee = signaling.connect(&key, Role::Callee).await.unwrap();
        let caller = caller.await.unwrap().unwrap();

        caller.outgoing.send(b"hi".to_vec()).await.unwrap();
        assert_eq!(callee.incoming.recv().await, Some(b"hi".to_vec()));
        assert_eq!(signaling.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_sever_ends_both_links() {
        let signaling = MemorySignaling::new();
        let (key, a, _) = key();

        let caller = {
            let signaling = signaling.clone();
            let key = key.clone();
            tokio::spawn(async move { signaling.connect(&key, Role::Caller).await })
        };
        tokio::task::yield_now().await;
        let mut callee = signaling.connect(&key, Role::Callee).await.unwrap();
        let mut caller = caller.await.unwrap().unwrap();

        signaling.sever_peer(a);
        assert_eq!(callee.incoming.recv().await, None);
        assert_eq!(caller.incoming.recv().await, None);
    }

    #[tokio::test]
    async fn test_unreachable_fails_fast() {
        let signaling = MemorySignaling::new();
        signaling.set_reachable(false);
        let (key, _, _) = key();
        assert!(matches!(
            signaling.connect(&key, Role::Caller).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
