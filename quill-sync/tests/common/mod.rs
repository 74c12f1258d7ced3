//! Shared harness for session tests: document helpers, event waiting and a
//! scripted fake peer that joins the mesh by hand.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use quill_sync::mesh::MeshTopology;
use quill_sync::transport::{ChannelKey, PeerLink, Role};
use quill_sync::{
    ClientId, DocPath, FrameKind, LocalCache, MemoryCache, MemoryRemoteStore, MemorySignaling,
    PeerFrame, Provider, ProviderConfig, ProviderEvent, SessionState, Signaling,
};
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Text, Transact, Update};

pub const WAIT: Duration = Duration::from_secs(10);

/// Append `text` to the "body" text of `doc` in its own transaction.
pub fn type_text(doc: &Doc, text: &str) {
    let body = doc.get_or_insert_text("body");
    let mut txn = doc.transact_mut();
    let len = body.get_string(&txn).len() as u32;
    body.insert(&mut txn, len, text);
}

pub fn body(doc: &Doc) -> String {
    let body = doc.get_or_insert_text("body");
    let txn = doc.transact();
    body.get_string(&txn)
}

/// Body of a fresh document after applying `update`.
pub fn body_of_update(update: &[u8]) -> String {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }
    body(&doc)
}

pub struct Setup {
    pub path: DocPath,
    pub store: MemoryRemoteStore,
    pub signaling: MemorySignaling,
}

/// Route session logs to the test output.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl Setup {
    pub fn new(path: &str) -> Self {
        init_logging();
        Self {
            path: DocPath::from(path),
            store: MemoryRemoteStore::new(),
            signaling: MemorySignaling::new(),
        }
    }

    pub fn provider(&self, doc: Doc, cache: Arc<dyn LocalCache>) -> Provider {
        self.provider_with(doc, cache, ProviderConfig::for_testing())
    }

    pub fn provider_with(
        &self,
        doc: Doc,
        cache: Arc<dyn LocalCache>,
        config: ProviderConfig,
    ) -> Provider {
        Provider::builder(
            self.path.clone(),
            doc,
            Arc::new(self.store.clone()),
            cache,
            Arc::new(self.signaling.clone()),
        )
        .config(config)
        .spawn()
    }

    /// A provider with its own memory cache.
    pub fn fresh_provider(&self) -> (Provider, Doc) {
        let doc = Doc::new();
        let provider = self.provider(doc.clone(), Arc::new(MemoryCache::new()));
        (provider, doc)
    }

    /// Register a hand-driven peer and connect it to `provider_id`.
    pub async fn join_fake_peer(&self, provider_id: ClientId) -> FakePeer {
        let id = ClientId::new();
        self.store.insert_instance(&self.path, id);
        self.connect_fake_peer(id, &[provider_id, id], provider_id).await
    }

    /// Connect an already registered fake `id` to `target`, with roles
    /// taken from the mesh over `clients`.
    pub async fn connect_fake_peer(
        &self,
        id: ClientId,
        clients: &[ClientId],
        target: ClientId,
    ) -> FakePeer {
        let mesh = MeshTopology::build(clients);
        let role = if mesh.receivers_of(&id).contains(&target) {
            Role::Caller
        } else {
            Role::Callee
        };
        let key = ChannelKey::new(&self.path, id, target, role);
        let link = tokio::time::timeout(WAIT, self.signaling.connect(&key, role))
            .await
            .expect("provider never linked")
            .expect("link failed");
        FakePeer { id, link }
    }
}

pub struct FakePeer {
    pub id: ClientId,
    pub link: PeerLink,
}

impl FakePeer {
    pub async fn next_frame(&mut self) -> Option<PeerFrame> {
        let bytes = self.link.incoming.recv().await?;
        Some(PeerFrame::decode(&bytes).expect("undecodable frame"))
    }

    /// Next frame of `kind`, skipping everything else.
    pub async fn next_of(&mut self, kind: FrameKind) -> Option<PeerFrame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.kind == kind {
                return Some(frame);
            }
        }
    }

    pub async fn send(&self, frame: PeerFrame) {
        self.link
            .outgoing
            .send(frame.encode().unwrap())
            .await
            .expect("link gone");
    }
}

pub async fn wait_for_state(provider: &Provider, state: SessionState) {
    let mut rx = provider.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("never reached {state:?}"))
        .unwrap();
}

/// Registered id of an active provider.
pub async fn active_id(provider: &Provider) -> ClientId {
    wait_for_state(provider, SessionState::Active).await;
    provider.client_id().expect("active provider has an id")
}

/// First event matching `pred`, failing after [`WAIT`].
pub async fn next_event(
    events: &mut mpsc::UnboundedReceiver<ProviderEvent>,
    mut pred: impl FnMut(&ProviderEvent) -> bool,
) -> ProviderEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

/// Poll `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held");
}
