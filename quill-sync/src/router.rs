//! The session actor: one task owns every piece of mutable session state and
//! routes updates between the document, the peer mesh, the remote store and
//! the local cache.
//!
//! ```text
//!                    ┌──────────── Session::run ────────────┐
//!  doc observer ───► │ route_update ─┬─► OutboundBatch ─► peers
//!                    │               ├─► relay (all but sender)
//!                    │               └─► local cache
//!  peer frames ────► │ on_frame: apply / sync / awareness   │
//!  remote record ──► │ apply as FromRemoteStore             │
//!  registry ───────► │ MeshTopology ─► PeerDiff ─► links    │
//!  timers ─────────► │ flush · remote save · reconnect      │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! Nothing here is shared: handlers run one at a time, so state needs no
//! locks. Timers are plain deadlines checked by the loop, which makes the
//! whole session deterministic under a paused tokio clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use yrs::Doc;

use crate::awareness::{AwarenessState, AwarenessUpdate, PresenceSnapshot, PresenceValue};
use crate::batch::{BatchState, OutboundBatch};
use crate::cache::LocalCache;
use crate::document::{self, DocUpdate};
use crate::mesh::{MeshTopology, PeerDiff};
use crate::origin::{ClientId, DocPath, Origin};
use crate::protocol::{FrameKind, PeerFrame};
use crate::provider::{
    Identity, ProviderConfig, ProviderError, ProviderEvent, SessionState,
};
use crate::remote::{
    DocumentMapper, InstanceEvent, InstanceRecord, RemoteError, RemoteEvent, RemoteStore,
    Subscription,
};
use crate::transport::{
    ChannelKey, LinkOptions, LinkState, PeerTransport, Role, Signaling, TransportEvent,
    TransportEventKind,
};

/// Requests from the [`Provider`](crate::Provider) handle.
pub(crate) enum Command {
    SetPresence {
        key: String,
        value: Option<PresenceValue>,
    },
    Destroy {
        ack: oneshot::Sender<()>,
    },
}

/// Results of work the session spawned off its own task.
enum Internal {
    SaveFinished {
        generation: u64,
        result: Result<(), RemoteError>,
    },
}

pub(crate) struct SessionParts {
    pub path: DocPath,
    pub doc: Doc,
    pub remote: Arc<dyn RemoteStore>,
    pub cache: Arc<dyn LocalCache>,
    pub signaling: Arc<dyn Signaling>,
    pub mapper: DocumentMapper,
    pub config: ProviderConfig,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub events: mpsc::UnboundedSender<ProviderEvent>,
    pub state: watch::Sender<SessionState>,
    pub identity: watch::Sender<Option<Identity>>,
    pub presence: watch::Sender<PresenceSnapshot>,
}

pub(crate) struct Session {
    path: DocPath,
    doc: Doc,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn LocalCache>,
    signaling: Arc<dyn Signaling>,
    mapper: DocumentMapper,
    config: ProviderConfig,

    // ── Outputs ─────────────────────────────────────────────────
    events: mpsc::UnboundedSender<ProviderEvent>,
    state: watch::Sender<SessionState>,
    identity: watch::Sender<Option<Identity>>,
    presence: watch::Sender<PresenceSnapshot>,

    // ── Inputs ──────────────────────────────────────────────────
    commands: mpsc::UnboundedReceiver<Command>,
    doc_tx: mpsc::UnboundedSender<DocUpdate>,
    doc_rx: mpsc::UnboundedReceiver<DocUpdate>,
    doc_sub: Option<yrs::Subscription>,
    data_sub: Option<Subscription<RemoteEvent>>,
    instance_sub: Option<Subscription<InstanceEvent>>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    // ── Identity and mesh ───────────────────────────────────────
    client_id: Option<ClientId>,
    registered: bool,
    /// Registration failed or reconnects ran out: no mesh, remote stream only.
    fallback: bool,
    clients: Vec<ClientId>,
    receivers: HashMap<ClientId, PeerTransport>,
    senders: HashMap<ClientId, PeerTransport>,
    next_link_id: u64,
    awareness: AwarenessState,

    // ── Timers ──────────────────────────────────────────────────
    batch: OutboundBatch,
    save_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    reinit_deadline: Option<Instant>,
    backoff: std::time::Duration,
    attempts: u32,

    // ── Remote save bookkeeping ─────────────────────────────────
    remote_updated_at: Option<Instant>,
    save_in_flight: bool,
    saving_reported: bool,
    /// Bumped on every cache write; a save only clears the cache if no
    /// write happened since its snapshot was taken.
    cache_generation: u64,
    ready: bool,
    torn_down: bool,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let (doc_tx, doc_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let batch = OutboundBatch::new(parts.config.max_updates_threshold, parts.config.max_wait);
        let backoff = parts.config.reinit_backoff;

        Self {
            path: parts.path,
            doc: parts.doc,
            remote: parts.remote,
            cache: parts.cache,
            signaling: parts.signaling,
            mapper: parts.mapper,
            config: parts.config,
            events: parts.events,
            state: parts.state,
            identity: parts.identity,
            presence: parts.presence,
            commands: parts.commands,
            doc_tx,
            doc_rx,
            doc_sub: None,
            data_sub: None,
            instance_sub: None,
            transport_tx,
            transport_rx,
            internal_tx,
            internal_rx,
            client_id: None,
            registered: false,
            fallback: false,
            clients: Vec::new(),
            receivers: HashMap::new(),
            senders: HashMap::new(),
            next_link_id: 0,
            awareness: AwarenessState::new(ClientId::new()),
            batch,
            save_deadline: None,
            reconnect_deadline: None,
            reinit_deadline: None,
            backoff,
            attempts: 0,
            remote_updated_at: None,
            save_in_flight: false,
            saving_reported: false,
            cache_generation: 0,
            ready: false,
            torn_down: false,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start().await;

        let mut pending_ack: Option<oneshot::Sender<()>> = None;
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::SetPresence { key, value }) => self.set_presence(key, value),
                    Some(Command::Destroy { ack }) => {
                        pending_ack = Some(ack);
                        break;
                    }
                    // Handle dropped.
                    None => break,
                },
                Some(update) = self.doc_rx.recv() => self.route_update(update),
                event = next_event(&mut self.data_sub) => self.on_remote_event(event),
                event = next_event(&mut self.instance_sub) => self.on_instance_event(event),
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event),
                Some(internal) = self.internal_rx.recv() => match internal {
                    Internal::SaveFinished { generation, result } => {
                        self.on_save_finished(generation, result)
                    }
                },
                _ = sleep_until(deadline) => self.on_timers().await,
            }
        }

        self.teardown().await;
        if let Some(ack) = pending_ack {
            let _ = ack.send(());
        }
    }

    // ─── Startup and registration ──────────────────────────────

    async fn start(&mut self) {
        self.set_state(SessionState::Initializing);

        match self.remote.subscribe(&self.path).await {
            Ok(sub) => self.data_sub = Some(sub),
            Err(e) => {
                log::warn!("{}: cannot subscribe to remote record: {e}", self.path);
                self.emit(ProviderEvent::Error(ProviderError::Remote(e)));
            }
        }

        match document::observe_updates(&self.doc, self.doc_tx.clone()) {
            Ok(sub) => self.doc_sub = Some(sub),
            Err(e) => {
                log::error!("{}: {e}", self.path);
                self.emit(ProviderEvent::Error(e));
            }
        }

        self.replay_cache();

        if self.config.read_only {
            log::info!("{}: observing read-only", self.path);
            return;
        }
        self.connect(true).await;
    }

    /// Feed whatever the cache holds back through the document. The
    /// resulting update is routed like a local edit, so it reaches peers
    /// and the remote store.
    fn replay_cache(&mut self) {
        match self.cache.get(&self.path) {
            Ok(Some(state)) => {
                log::info!(
                    "{}: replaying {} cached bytes",
                    self.path,
                    state.len()
                );
                if let Err(e) = document::apply_update(&self.doc, &state, Origin::FromCacheReplay) {
                    log::warn!("{}: cached state is unusable: {e}", self.path);
                    self.emit(ProviderEvent::Error(e));
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("{}: cannot read cache: {e}", self.path);
                self.emit(ProviderEvent::Error(ProviderError::Cache(e)));
            }
        }
    }

    async fn connect(&mut self, initial: bool) {
        self.set_state(SessionState::Connecting);

        let registration = match self.remote.register_instance(&self.path).await {
            Ok(registration) => registration,
            Err(e) => {
                log::warn!("{}: instance registration failed: {e}", self.path);
                self.emit(ProviderEvent::Error(ProviderError::Registration(e)));
                if initial {
                    // Edits keep landing in the cache; the data stream stays.
                    self.fallback = true;
                    self.set_state(SessionState::Active);
                } else {
                    self.set_state(SessionState::Reconnecting);
                    self.schedule_reinit();
                }
                return;
            }
        };

        let id = registration.id;
        self.client_id = Some(id);
        self.registered = true;
        self.awareness.rekey_local(id);
        self.identity.send_replace(Some(Identity {
            client_id: id,
            offset_ms: registration.offset_ms,
        }));
        self.publish_presence();
        log::info!(
            "{}: registered as {} (clock offset {}ms)",
            self.path,
            id.short(),
            registration.offset_ms
        );

        match self.remote.subscribe_instances(&self.path).await {
            Ok(sub) => self.instance_sub = Some(sub),
            Err(e) => {
                log::warn!("{}: cannot watch instance registry: {e}", self.path);
                self.emit(ProviderEvent::Error(ProviderError::Remote(e)));
                self.set_state(SessionState::Active);
                // Without a registry view the session is alone; try again.
                self.check_connections();
            }
        }
    }

    /// Close every link, stop watching the registry and deregister.
    async fn drop_registration(&mut self) {
        self.close_all_transports();
        if let Some(mut sub) = self.instance_sub.take() {
            sub.unsubscribe();
        }
        self.clients.clear();
        if let (true, Some(id)) = (self.registered, self.client_id) {
            self.registered = false;
            if let Err(e) = self.remote.delete_instance(&self.path, id).await {
                log::warn!("{}: cannot deregister {}: {e}", self.path, id.short());
            }
        }
    }

    // ─── Update routing ────────────────────────────────────────

    fn route_update(&mut self, update: DocUpdate) {
        if self.torn_down {
            return;
        }

        match update.origin {
            Origin::FromRemoteStore => {
                // Already durable remotely; never re-sent.
                self.write_cache();
            }
            Origin::FromPeer(peer) if Some(peer) != self.client_id => {
                if let Some(own) = self.client_id {
                    let frame = PeerFrame::update(own, update.bytes);
                    self.send_to_peers(&frame, Some(peer));
                }
                self.write_cache();
            }
            // Local edits, cache replay and our own id echoed back.
            _ => {
                if self.config.read_only {
                    return;
                }
                self.write_cache();
                if self.fallback {
                    return;
                }
                match self.batch.push(&update.bytes, Instant::now()) {
                    Ok(BatchState::Full) => self.flush(),
                    Ok(BatchState::Pending) => {}
                    Err(e) => {
                        log::warn!("{}: dropping unmergeable update: {e}", self.path);
                        self.emit(ProviderEvent::Error(e));
                    }
                }
            }
        }
    }

    /// Send the outbound batch to every peer and queue a remote save.
    fn flush(&mut self) {
        let Some(bytes) = self.batch.take() else {
            return;
        };
        if let Some(own) = self.client_id {
            log::trace!("{}: flushing {} bytes to peers", self.path, bytes.len());
            self.send_to_peers(&PeerFrame::update(own, bytes), None);
        }
        self.queue_remote_save();
    }

    fn write_cache(&mut self) {
        let state = document::encode_state(&self.doc);
        self.cache_generation += 1;
        if let Err(e) = self.cache.set(&self.path, &state) {
            log::warn!("{}: cache write failed: {e}", self.path);
            self.emit(ProviderEvent::Error(ProviderError::Cache(e)));
        }
    }

    // ─── Remote store ──────────────────────────────────────────

    fn queue_remote_save(&mut self) {
        self.save_deadline = Some(Instant::now() + self.config.max_remote_wait);
        self.set_saving(true);
    }

    fn on_save_deadline(&mut self, now: Instant) {
        self.save_deadline = None;
        let remote_is_busy = self
            .remote_updated_at
            .is_some_and(|at| now.duration_since(at) < self.config.max_remote_wait);
        if remote_is_busy || self.save_in_flight {
            self.save_deadline = Some(now + self.config.max_remote_wait);
            return;
        }

        let state = document::encode_state(&self.doc);
        let record = (self.mapper)(&state);
        let generation = self.cache_generation;
        let remote = self.remote.clone();
        let path = self.path.clone();
        let done = self.internal_tx.clone();
        self.save_in_flight = true;
        log::debug!("{}: saving {} bytes remotely", self.path, state.len());

        tokio::spawn(async move {
            let result = remote.write_merge(&path, record).await;
            let _ = done.send(Internal::SaveFinished { generation, result });
        });
    }

    fn on_save_finished(&mut self, generation: u64, result: Result<(), RemoteError>) {
        self.save_in_flight = false;
        match result {
            Ok(()) if generation == self.cache_generation => {
                if let Err(e) = self.cache.delete(&self.path) {
                    log::warn!("{}: cannot clear cache: {e}", self.path);
                }
                log::debug!("{}: remote save done, cache cleared", self.path);
            }
            Ok(()) => {
                log::debug!("{}: remote save done, newer edits stay cached", self.path);
            }
            Err(e) => {
                log::warn!("{}: remote save failed, cache kept: {e}", self.path);
            }
        }
        self.set_saving(self.save_deadline.is_some());
    }

    fn on_remote_event(&mut self, event: Option<RemoteEvent>) {
        let Some(event) = event else {
            log::debug!("{}: remote record subscription ended", self.path);
            self.data_sub = None;
            return;
        };

        match event {
            RemoteEvent::Snapshot(record) => {
                if let Some(record) = record {
                    if !record.content.is_empty() {
                        self.remote_updated_at = Some(Instant::now());
                        if let Err(e) = document::apply_update(
                            &self.doc,
                            &record.content,
                            Origin::FromRemoteStore,
                        ) {
                            log::warn!("{}: bad remote content: {e}", self.path);
                            self.emit(ProviderEvent::Error(e));
                        }
                    }
                    if !self.ready {
                        self.ready = true;
                        self.emit(ProviderEvent::Ready);
                    }
                }
                if self.config.read_only && *self.state.borrow() == SessionState::Initializing {
                    self.set_state(SessionState::Active);
                }
            }
            RemoteEvent::Error(e) if e.is_permission_denied() => {
                log::warn!("{}: access revoked: {e}", self.path);
                self.emit(ProviderEvent::Deleted);
            }
            RemoteEvent::Error(e) => {
                log::warn!("{}: remote record error: {e}", self.path);
                self.emit(ProviderEvent::Error(ProviderError::Remote(e)));
            }
        }
    }

    // ─── Registry and mesh ─────────────────────────────────────

    fn on_instance_event(&mut self, event: Option<InstanceEvent>) {
        match event {
            None => {
                log::debug!("{}: instance subscription ended", self.path);
                self.instance_sub = None;
            }
            Some(InstanceEvent::Error(e)) => {
                log::warn!("{}: instance registry error: {e}", self.path);
                self.emit(ProviderEvent::Error(ProviderError::Remote(e)));
            }
            Some(InstanceEvent::Snapshot(records)) => self.on_registry(records),
        }
    }

    fn on_registry(&mut self, records: Vec<InstanceRecord>) {
        let Some(own) = self.client_id else {
            return;
        };

        let mut clients: Vec<ClientId> = records.iter().map(|r| r.id).collect();
        clients.sort();
        clients.dedup();
        let live: BTreeSet<ClientId> = clients.iter().copied().collect();
        self.clients = clients;

        let purged = self.awareness.retain_clients(&live);
        if !purged.is_empty() {
            log::debug!("{}: purged presence of {} clients", self.path, purged.len());
            self.publish_presence();
        }

        if *self.state.borrow() == SessionState::Connecting {
            self.set_state(SessionState::Active);
        }

        if !live.contains(&own) {
            log::warn!("{}: own instance missing from registry", self.path);
            self.close_all_transports();
            self.check_connections();
            return;
        }

        let mesh = MeshTopology::build(&self.clients);
        log::debug!(
            "{}: mesh of {} clients, {} edges",
            self.path,
            mesh.client_count(),
            mesh.edge_count()
        );
        self.reconcile(Role::Caller, mesh.receivers_of(&own));
        self.reconcile(Role::Callee, mesh.senders_of(&own));
    }

    /// Bring the links of one role in line with `desired`.
    fn reconcile(&mut self, role: Role, desired: BTreeSet<ClientId>) {
        let current: BTreeSet<ClientId> = self.links(role).keys().copied().collect();
        let diff = PeerDiff::between(&current, &desired);
        if diff.is_empty() {
            return;
        }

        for peer in diff.obsolete {
            if let Some(transport) = self.links_mut(role).remove(&peer) {
                log::debug!("{}: dropping link to {}", self.path, peer.short());
                transport.close();
            }
        }
        for peer in diff.added {
            if let Some(transport) = self.open_link(peer, role) {
                self.links_mut(role).insert(peer, transport);
            }
        }
    }

    fn open_link(&mut self, peer: ClientId, role: Role) -> Option<PeerTransport> {
        let own = self.client_id?;
        self.next_link_id += 1;
        log::debug!(
            "{}: linking to {} as {role:?} (link {})",
            self.path,
            peer.short(),
            self.next_link_id
        );
        Some(PeerTransport::spawn(
            self.signaling.clone(),
            ChannelKey::new(&self.path, own, peer, role),
            role,
            peer,
            self.next_link_id,
            LinkOptions {
                connect_timeout: self.config.connect_timeout,
                buffer: self.config.peer_buffer,
            },
            self.transport_tx.clone(),
        ))
    }

    fn links(&self, role: Role) -> &HashMap<ClientId, PeerTransport> {
        match role {
            Role::Caller => &self.receivers,
            Role::Callee => &self.senders,
        }
    }

    fn links_mut(&mut self, role: Role) -> &mut HashMap<ClientId, PeerTransport> {
        match role {
            Role::Caller => &mut self.receivers,
            Role::Callee => &mut self.senders,
        }
    }

    fn close_all_transports(&mut self) {
        for (_, transport) in self.receivers.drain().chain(self.senders.drain()) {
            transport.close();
        }
    }

    fn open_link_count(&self) -> usize {
        self.receivers
            .values()
            .chain(self.senders.values())
            .filter(|t| t.is_open())
            .count()
    }

    // ─── Peer links ────────────────────────────────────────────

    fn on_transport_event(&mut self, event: TransportEvent) {
        let Some(role) = self.role_of(&event) else {
            log::trace!("{}: event from stale link {}", self.path, event.link_id);
            return;
        };

        match event.kind {
            TransportEventKind::State(LinkState::Open) => {
                log::info!("{}: link to {} open", self.path, event.peer.short());
                self.backoff = self.config.reinit_backoff;
                self.attempts = 0;
                self.greet(event.peer, role);
            }
            TransportEventKind::State(LinkState::Closed) => {
                log::info!("{}: link to {} closed", self.path, event.peer.short());
                self.links_mut(role).remove(&event.peer);
                self.check_connections();
            }
            TransportEventKind::State(LinkState::Connecting) => {}
            TransportEventKind::Frame(bytes) => self.on_frame(event.peer, role, &bytes),
        }
    }

    fn role_of(&self, event: &TransportEvent) -> Option<Role> {
        [Role::Caller, Role::Callee].into_iter().find(|role| {
            self.links(*role)
                .get(&event.peer)
                .is_some_and(|t| t.link_id() == event.link_id)
        })
    }

    /// First frames on a fresh link: our state vector and all presence.
    fn greet(&mut self, peer: ClientId, role: Role) {
        let Some(own) = self.client_id else {
            return;
        };
        let sync = PeerFrame::sync_step1(own, document::state_vector(&self.doc));
        let presence = self.awareness.full_update();

        let Some(transport) = self.links_mut(role).get_mut(&peer) else {
            return;
        };
        transport.set_state(LinkState::Open);
        let mut frames = vec![sync];
        if !presence.is_empty() {
            match presence.encode() {
                Ok(bytes) => frames.push(PeerFrame::awareness(own, bytes)),
                Err(e) => log::warn!("cannot encode presence: {e}"),
            }
        }
        for frame in &frames {
            if let Err(e) = transport.send(frame) {
                log::debug!("greeting {} failed: {e}", peer.short());
            }
        }
    }

    fn on_frame(&mut self, peer: ClientId, role: Role, bytes: &[u8]) {
        let frame = match PeerFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("{}: bad frame from {}: {e}", self.path, peer.short());
                return;
            }
        };

        match frame.kind {
            FrameKind::Update | FrameKind::SyncStep2 => {
                if let Err(e) = document::apply_update(&self.doc, &frame.payload, Origin::FromPeer(peer))
                {
                    log::warn!("{}: bad update from {}: {e}", self.path, peer.short());
                }
            }
            FrameKind::SyncStep1 => {
                let Some(own) = self.client_id else {
                    return;
                };
                let diff = match document::encode_diff(&self.doc, &frame.payload) {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::warn!("{}: bad state vector from {}: {e}", self.path, peer.short());
                        return;
                    }
                };
                if let Some(transport) = self.links(role).get(&peer) {
                    if let Err(e) = transport.send(&PeerFrame::sync_step2(own, diff)) {
                        log::debug!("sync reply to {} failed: {e}", peer.short());
                    }
                }
            }
            FrameKind::Awareness => {
                let update = match AwarenessUpdate::decode(&frame.payload) {
                    Ok(update) => update,
                    Err(e) => {
                        log::warn!("{}: bad presence from {}: {e}", self.path, peer.short());
                        return;
                    }
                };
                let change = self.awareness.apply_update(&update);
                if change.is_empty() {
                    return;
                }
                let touched = change.touched();
                let relay = self.awareness.encode_update(&touched);
                self.broadcast_awareness(&relay, Some(peer));
                self.publish_presence();
            }
        }
    }

    /// Queue `frame` on every link except the one to `except`.
    fn send_to_peers(&self, frame: &PeerFrame, except: Option<ClientId>) {
        for transport in self.receivers.values().chain(self.senders.values()) {
            if Some(transport.peer()) == except {
                continue;
            }
            if let Err(e) = transport.send(frame) {
                log::debug!("{}: send to {} failed: {e}", self.path, transport.peer().short());
            }
        }
    }

    // ─── Presence ──────────────────────────────────────────────

    fn set_presence(&mut self, key: String, value: Option<PresenceValue>) {
        if self.config.read_only {
            log::debug!("{}: presence ignored in read-only session", self.path);
            return;
        }
        let diff = self.awareness.set_local_field(key, value);
        self.broadcast_awareness(&diff, None);
        self.publish_presence();
    }

    fn broadcast_awareness(&self, update: &AwarenessUpdate, except: Option<ClientId>) {
        let Some(own) = self.client_id else {
            return;
        };
        if update.is_empty() {
            return;
        }
        match update.encode() {
            Ok(bytes) => self.send_to_peers(&PeerFrame::awareness(own, bytes), except),
            Err(e) => log::warn!("{}: cannot encode presence: {e}", self.path),
        }
    }

    fn publish_presence(&self) {
        self.presence.send_replace(self.awareness.snapshot());
    }

    // ─── Connection loss and reconnect ─────────────────────────

    /// True when this client is registered among others but reaches none
    /// of them, or when the registry no longer lists it.
    fn needs_reconnect(&self) -> bool {
        if self.config.read_only || self.fallback || !self.registered {
            return false;
        }
        let Some(own) = self.client_id else {
            return false;
        };
        if !self.clients.contains(&own) {
            return true;
        }
        self.clients.len() > 1 && self.open_link_count() == 0
    }

    fn check_connections(&mut self) {
        if self.needs_reconnect() {
            log::debug!("{}: no open links, reconnect armed", self.path);
            self.reconnect_deadline = Some(Instant::now() + self.config.reconnect_debounce);
        }
    }

    async fn on_reconnect_deadline(&mut self) {
        self.reconnect_deadline = None;
        if !self.needs_reconnect() {
            log::debug!("{}: links recovered, reconnect skipped", self.path);
            return;
        }
        log::info!("{}: lost all peers, re-registering", self.path);
        self.set_state(SessionState::Reconnecting);
        self.drop_registration().await;
        self.schedule_reinit();
    }

    /// Arm the next registration attempt with exponential backoff, or give
    /// up and stay on the remote stream when attempts ran out.
    fn schedule_reinit(&mut self) {
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.attempts >= max {
                log::error!(
                    "{}: giving up after {} reconnect attempts",
                    self.path,
                    self.attempts
                );
                self.emit(ProviderEvent::Error(ProviderError::ReconnectExhausted {
                    attempts: self.attempts,
                }));
                self.fallback = true;
                self.set_state(SessionState::Active);
                return;
            }
        }
        self.attempts += 1;
        self.reinit_deadline = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(self.config.max_reinit_backoff);
    }

    // ─── Timers ────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.batch.deadline(),
            self.save_deadline,
            self.reconnect_deadline,
            self.reinit_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_timers(&mut self) {
        let now = Instant::now();
        if self.batch.deadline().is_some_and(|d| d <= now) {
            self.flush();
        }
        if self.save_deadline.is_some_and(|d| d <= now) {
            self.on_save_deadline(now);
        }
        if self.reconnect_deadline.is_some_and(|d| d <= now) {
            self.on_reconnect_deadline().await;
        }
        if self.reinit_deadline.is_some_and(|d| d <= now) {
            self.reinit_deadline = None;
            self.connect(false).await;
        }
    }

    // ─── Teardown ──────────────────────────────────────────────

    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.batch.cancel();
        self.save_deadline = None;
        self.reconnect_deadline = None;
        self.reinit_deadline = None;
        self.set_saving(false);

        self.doc_sub = None;

        if self.registered {
            let leave = self.awareness.remove_local();
            self.broadcast_awareness(&leave, None);
        }
        self.drop_registration().await;

        if let Some(mut sub) = self.data_sub.take() {
            sub.unsubscribe();
        }

        self.set_state(SessionState::Destroyed);
        log::info!("{}: session closed", self.path);
    }

    // ─── Outputs ───────────────────────────────────────────────

    fn emit(&self, event: ProviderEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("{}: {:?} -> {:?}", self.path, current, state);
            *current = state;
            true
        });
    }

    fn set_saving(&mut self, saving: bool) {
        if self.saving_reported != saving {
            self.saving_reported = saving;
            self.emit(ProviderEvent::Saving(saving));
        }
    }
}

/// Next event of an optional subscription; pending forever when there is
/// none so the select arm stays idle.
async fn next_event<T>(sub: &mut Option<Subscription<T>>) -> Option<T> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
