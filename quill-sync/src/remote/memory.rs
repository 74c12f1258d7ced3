//! In-process remote store.
//!
//! Keeps one room per document path: the record, the instance registry and
//! the live subscribers of both. Every change fans out a full snapshot to the
//! room's subscribers, the way a document database's listeners behave.
//!
//! Test hooks simulate the failures a real backend produces: going offline,
//! revoking access to a document, failing writes, and registry edits made by
//! other parties (a reaper removing a stale instance, a foreign client
//! joining).

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::sync::mpsc;

use super::{
    InstanceEvent, InstanceRecord, InstanceRegistration, RemoteError, RemoteEvent, RemoteRecord,
    RemoteStore, Subscription,
};
use crate::origin::{ClientId, DocPath};

#[derive(Default)]
struct Room {
    record: Option<RemoteRecord>,
    instances: BTreeMap<ClientId, InstanceRecord>,
    data_subs: HashMap<u64, mpsc::UnboundedSender<RemoteEvent>>,
    instance_subs: HashMap<u64, mpsc::UnboundedSender<InstanceEvent>>,
    denied: bool,
}

impl Room {
    fn publish_record(&mut self) {
        let event = RemoteEvent::Snapshot(self.record.clone());
        self.data_subs.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn publish_instances(&mut self) {
        let snapshot: Vec<InstanceRecord> = self.instances.values().copied().collect();
        self.instance_subs
            .retain(|_, tx| tx.send(InstanceEvent::Snapshot(snapshot.clone())).is_ok());
    }
}

struct Inner {
    rooms: Mutex<HashMap<DocPath, Room>>,
    online: AtomicBool,
    writes_failing: AtomicBool,
    registry_watch_failing: AtomicBool,
    next_subscription: AtomicU64,
    clock_offset_ms: AtomicI64,
    writes: AtomicU64,
    registrations: AtomicU64,
}

impl Inner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<DocPath, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("offline".into()))
        }
    }
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    inner: Arc<Inner>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                writes_failing: AtomicBool::new(false),
                registry_watch_failing: AtomicBool::new(false),
                next_subscription: AtomicU64::new(0),
                clock_offset_ms: AtomicI64::new(0),
                writes: AtomicU64::new(0),
                registrations: AtomicU64::new(0),
            }),
        }
    }

    /// Take the backend offline (every call fails with `Unavailable`,
    /// listeners go quiet) or back online (listeners receive fresh
    /// snapshots).
    pub fn set_online(&self, online: bool) {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was {
            let mut rooms = self.inner.rooms();
            for room in rooms.values_mut().filter(|room| !room.denied) {
                room.publish_record();
                room.publish_instances();
            }
        }
    }

    /// Writes fail with `Unavailable` while reads keep working.
    pub fn set_writes_failing(&self, failing: bool) {
        self.inner.writes_failing.store(failing, Ordering::SeqCst);
    }

    /// The next `subscribe_instances` call fails once.
    pub fn fail_next_registry_watch(&self) {
        self.inner
            .registry_watch_failing
            .store(true, Ordering::SeqCst);
    }

    /// Server clock skew reported at registration.
    pub fn set_clock_offset_ms(&self, offset_ms: i64) {
        self.inner.clock_offset_ms.store(offset_ms, Ordering::SeqCst);
    }

    /// Revoke access to `path`: listeners receive `PermissionDenied` and
    /// every later call for that path fails with it.
    pub fn revoke(&self, path: &DocPath) {
        let mut rooms = self.inner.rooms();
        let room = rooms.entry(path.clone()).or_default();
        room.denied = true;
        let denied = RemoteError::PermissionDenied(path.to_string());
        for tx in room.data_subs.values() {
            let _ = tx.send(RemoteEvent::Error(denied.clone()));
        }
        for tx in room.instance_subs.values() {
            let _ = tx.send(InstanceEvent::Error(denied.clone()));
        }
    }

    pub fn record(&self, path: &DocPath) -> Option<RemoteRecord> {
        self.inner.rooms().get(path).and_then(|room| room.record.clone())
    }

    /// Overwrite the record as another writer would.
    pub fn put_record(&self, path: &DocPath, record: RemoteRecord) {
        let mut rooms = self.inner.rooms();
        let room = rooms.entry(path.clone()).or_default();
        room.record = Some(record);
        room.publish_record();
    }

    pub fn instances(&self, path: &DocPath) -> Vec<ClientId> {
        self.inner
            .rooms()
            .get(path)
            .map(|room| room.instances.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Register a foreign instance.
    pub fn insert_instance(&self, path: &DocPath, id: ClientId) {
        let mut rooms = self.inner.rooms();
        let room = rooms.entry(path.clone()).or_default();
        room.instances.insert(
            id,
            InstanceRecord {
                id,
                connected_at_ms: now_ms(),
            },
        );
        room.publish_instances();
    }

    /// Remove an instance as a stale-instance reaper would.
    pub fn remove_instance(&self, path: &DocPath, id: ClientId) {
        let mut rooms = self.inner.rooms();
        if let Some(room) = rooms.get_mut(path) {
            if room.instances.remove(&id).is_some() {
                room.publish_instances();
            }
        }
    }

    /// Live data plus registry subscriptions for `path`.
    pub fn subscriber_count(&self, path: &DocPath) -> usize {
        self.inner
            .rooms()
            .get(path)
            .map(|room| room.data_subs.len() + room.instance_subs.len())
            .unwrap_or(0)
    }

    /// Successful `write_merge` calls so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn registration_count(&self) -> u64 {
        self.inner.registrations.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_subscription.fetch_add(1, Ordering::SeqCst)
    }

    fn with_room<R>(
        &self,
        path: &DocPath,
        f: impl FnOnce(&mut Room) -> Result<R, RemoteError>,
    ) -> Result<R, RemoteError> {
        self.inner.check_online()?;
        let mut rooms = self.inner.rooms();
        let room = rooms.entry(path.clone()).or_default();
        if room.denied {
            return Err(RemoteError::PermissionDenied(path.to_string()));
        }
        f(room)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn subscribe(&self, path: &DocPath) -> Result<Subscription<RemoteEvent>, RemoteError> {
        self.inner.check_online()?;
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut rooms = self.inner.rooms();
            let room = rooms.entry(path.clone()).or_default();
            let first = if room.denied {
                RemoteEvent::Error(RemoteError::PermissionDenied(path.to_string()))
            } else {
                RemoteEvent::Snapshot(room.record.clone())
            };
            let _ = tx.send(first);
            room.data_subs.insert(id, tx);
        }

        let inner = self.inner.clone();
        let path = path.clone();
        Ok(Subscription::new(rx, move || {
            if let Some(room) = inner.rooms().get_mut(&path) {
                room.data_subs.remove(&id);
            }
        }))
    }

    async fn write_merge(&self, path: &DocPath, record: RemoteRecord) -> Result<(), RemoteError> {
        if self.inner.writes_failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("write rejected".into()));
        }
        self.with_room(path, |room| {
            match room.record.as_mut() {
                Some(stored) => stored.merge(record),
                None => room.record = Some(record),
            }
            room.publish_record();
            Ok(())
        })?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_instance(&self, path: &DocPath) -> Result<InstanceRegistration, RemoteError> {
        let offset_ms = self.inner.clock_offset_ms.load(Ordering::SeqCst);
        let id = ClientId::new();
        self.with_room(path, |room| {
            room.instances.insert(
                id,
                InstanceRecord {
                    id,
                    connected_at_ms: now_ms() + offset_ms,
                },
            );
            room.publish_instances();
            Ok(())
        })?;
        self.inner.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceRegistration { id, offset_ms })
    }

    async fn delete_instance(&self, path: &DocPath, id: ClientId) -> Result<(), RemoteError> {
        self.with_room(path, |room| {
            if room.instances.remove(&id).is_some() {
                room.publish_instances();
            }
            Ok(())
        })
    }

    async fn subscribe_instances(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<InstanceEvent>, RemoteError> {
        if self.inner.registry_watch_failing.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("registry watch rejected".into()));
        }
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_room(path, |room| {
            let snapshot = room.instances.values().copied().collect();
            let _ = tx.send(InstanceEvent::Snapshot(snapshot));
            room.instance_subs.insert(id, tx);
            Ok(())
        })?;

        let inner = self.inner.clone();
        let path = path.clone();
        Ok(Subscription::new(rx, move || {
            if let Some(room) = inner.rooms().get_mut(&path) {
                room.instance_subs.remove(&id);
            }
        }))
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
