//! Remote authoritative store.
//!
//! The durable copy of each document lives in a remote document database
//! alongside a per-document instance registry:
//!
//! ```text
//! <path>             { content: <encoded state>, ...mapped fields }
//! <path>/instances   { <client id>: { connected_at } , ... }
//! ```
//!
//! The router talks to it only through [`RemoteStore`]; subscriptions are
//! explicit [`Subscription`] handles that unsubscribe when dropped.

pub mod memory;

pub use memory::MemoryRemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::origin::{ClientId, DocPath};

/// What gets written for a document: its encoded state plus any extra
/// fields the application derives from it (title, word count, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub content: Vec<u8>,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl RemoteRecord {
    pub fn with_content(content: Vec<u8>) -> Self {
        Self {
            content,
            fields: BTreeMap::new(),
        }
    }

    /// Merge `other` into `self`: content replaced, fields overwritten
    /// key by key, untouched keys kept.
    pub fn merge(&mut self, other: RemoteRecord) {
        self.content = other.content;
        self.fields.extend(other.fields);
    }
}

/// Maps the full encoded document state to the record written remotely.
pub type DocumentMapper = Arc<dyn Fn(&[u8]) -> RemoteRecord + Send + Sync>;

/// `{ content: state }` and nothing else.
pub fn default_mapper() -> DocumentMapper {
    Arc::new(|state: &[u8]| RemoteRecord::with_content(state.to_vec()))
}

/// One entry of the instance registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: ClientId,
    /// Server time of registration, milliseconds since epoch
    pub connected_at_ms: i64,
}

/// Result of registering this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRegistration {
    pub id: ClientId,
    /// Server clock minus local clock, milliseconds
    pub offset_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Current record; `None` when the document does not exist (yet).
    Snapshot(Option<RemoteRecord>),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    Snapshot(Vec<InstanceRecord>),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store error: {0}")]
    Other(String),
}

impl RemoteError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RemoteError::PermissionDenied(_))
    }
}

/// Live subscription to a stream of events.
///
/// Unsubscribing is idempotent and also happens on drop, so a subscription
/// can never outlive the session holding it.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next event; `None` once the source is gone or after unsubscribe.
    pub async fn recv(&mut self) -> Option<T> {
        if self.cancel.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
            self.rx.close();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Remote document database plus its instance registry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Subscribe to the document record. The current snapshot is delivered
    /// first, then one snapshot per change.
    async fn subscribe(&self, path: &DocPath) -> Result<Subscription<RemoteEvent>, RemoteError>;

    /// Merge `record` into the stored document, creating it if needed.
    async fn write_merge(&self, path: &DocPath, record: RemoteRecord) -> Result<(), RemoteError>;

    /// Add this client to the instance registry with a server timestamp.
    async fn register_instance(&self, path: &DocPath) -> Result<InstanceRegistration, RemoteError>;

    async fn delete_instance(&self, path: &DocPath, id: ClientId) -> Result<(), RemoteError>;

    /// Subscribe to the instance registry (full snapshot per change).
    async fn subscribe_instances(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<InstanceEvent>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_record_merge_keeps_unrelated_fields() {
        let mut stored = RemoteRecord::with_content(vec![1]);
        stored
            .fields
            .insert("title".into(), serde_json::json!("Draft"));
        stored.fields.insert("words".into(), serde_json::json!(10));

        let mut incoming = RemoteRecord::with_content(vec![2]);
        incoming.fields.insert("words".into(), serde_json::json!(12));
        stored.merge(incoming);

        assert_eq!(stored.content, vec![2]);
        assert_eq!(stored.fields["title"], serde_json::json!("Draft"));
        assert_eq!(stored.fields["words"], serde_json::json!(12));
    }

    #[test]
    fn test_default_mapper_is_content_only() {
        let record = default_mapper()(b"state");
        assert_eq!(record.content, b"state".to_vec());
        assert!(record.fields.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_unsubscribes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let counter = calls.clone();
        let mut sub = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(7).unwrap();
        assert_eq!(sub.recv().await, Some(7));

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tx.send(8).is_err());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel::<u32>();
        let counter = calls.clone();
        let sub = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
