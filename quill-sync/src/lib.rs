//! # quill-sync: Real-time sync provider for shared CRDT documents
//!
//! Keeps one `yrs::Doc` in sync between every client editing it, over a
//! peer mesh, with a remote document database as the durable copy and a
//! local cache as the offline backstop.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   peer frames    ┌─────────────┐
//! │  Provider A │ ◄──────────────► │  Provider B │
//! │  (session)  │   (ring mesh)    │  (session)  │
//! └──┬───────┬──┘                  └──┬───────┬──┘
//!    │       │                        │       │
//!    ▼       ▼                        ▼       ▼
//! ┌──────┐ ┌───────────────────────────────┐ ┌──────┐
//! │cache │ │ RemoteStore: record + registry│ │cache │
//! └──────┘ └───────────────────────────────┘ └──────┘
//! ```
//!
//! ## Modules
//!
//! - [`origin`]: client ids, document paths and update origins
//! - [`document`]: apply/encode/diff/merge over the shared doc
//! - [`mesh`]: registry → ring topology, peer diffs
//! - [`protocol`]: peer frame wire format (bincode)
//! - [`awareness`]: per-client presence with LWW fields
//! - [`batch`]: outbound update batching
//! - [`cache`]: local cache (memory, RocksDB + LZ4)
//! - [`remote`]: remote store contract and in-memory store
//! - [`transport`]: peer links and signaling
//! - [`relay`]: WebSocket relay pairing peer links
//! - [`provider`]: the public session handle
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use quill_sync::{MemoryCache, MemoryRemoteStore, MemorySignaling, Provider};
//!
//! # async fn demo() {
//! let mut provider = Provider::builder(
//!     "notes/today",
//!     yrs::Doc::new(),
//!     Arc::new(MemoryRemoteStore::new()),
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(MemorySignaling::new()),
//! )
//! .spawn();
//! let mut events = provider.take_event_rx().unwrap();
//! // ... edit provider.doc(), watch events ...
//! provider.destroy().await;
//! # let _ = events.try_recv();
//! # }
//! ```

pub mod awareness;
pub mod batch;
pub mod cache;
pub mod document;
pub mod mesh;
pub mod origin;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod remote;
pub mod transport;

mod router;

// Re-exports for convenience
pub use awareness::{
    AwarenessState, AwarenessUpdate, CursorColor, PresenceSnapshot, PresenceValue, TextCursor,
};
pub use cache::{CacheConfig, CacheError, LocalCache, MemoryCache, RocksCache};
pub use mesh::{MeshTopology, PeerDiff};
pub use origin::{ClientId, DocPath, Origin};
pub use protocol::{FrameKind, PeerFrame, ProtocolError};
pub use provider::{
    Identity, Provider, ProviderBuilder, ProviderConfig, ProviderError, ProviderEvent,
    SessionState,
};
pub use relay::{RelayConfig, RelayError, RelayServer, RelaySignaling};
pub use remote::{
    DocumentMapper, MemoryRemoteStore, RemoteError, RemoteRecord, RemoteStore, Subscription,
};
pub use transport::{MemorySignaling, Signaling, TransportError};
