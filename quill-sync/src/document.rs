//! Black-box CRDT operations over the shared `yrs::Doc`.
//!
//! The provider never looks inside an update. It applies, encodes, diffs and
//! merges them, and relies on yrs for commutative, idempotent merges.

use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::origin::Origin;
use crate::provider::ProviderError;

/// One update event emitted by the shared document.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub bytes: Vec<u8>,
    pub origin: Origin,
}

/// Attach an update observer that forwards every committed update, tagged
/// with its decoded origin, into `tx`.
///
/// Dropping the returned subscription detaches the observer.
pub fn observe_updates(
    doc: &Doc,
    tx: mpsc::UnboundedSender<DocUpdate>,
) -> Result<yrs::Subscription, ProviderError> {
    doc.observe_update_v1(move |txn, event| {
        let origin = Origin::from_yrs(txn.origin());
        // Receiver gone means the session is tearing down.
        let _ = tx.send(DocUpdate {
            bytes: event.update.clone(),
            origin,
        });
    })
    .map_err(|e| ProviderError::Crdt(format!("cannot observe document: {e:?}")))
}

/// Apply an encoded update inside a transaction carrying `origin`.
pub fn apply_update(doc: &Doc, bytes: &[u8], origin: Origin) -> Result<(), ProviderError> {
    let update = Update::decode_v1(bytes).map_err(|e| ProviderError::Crdt(e.to_string()))?;
    let mut txn = match origin.to_yrs() {
        Some(tag) => doc.transact_mut_with(tag),
        None => doc.transact_mut(),
    };
    txn.apply_update(update)
        .map_err(|e| ProviderError::Crdt(e.to_string()))
}

/// Full document state as a single update.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Encoded state vector, sent to a peer when a link opens.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Everything `doc` has that a peer with `remote_sv` is missing.
pub fn encode_diff(doc: &Doc, remote_sv: &[u8]) -> Result<Vec<u8>, ProviderError> {
    let sv = StateVector::decode_v1(remote_sv).map_err(|e| ProviderError::Crdt(e.to_string()))?;
    let txn = doc.transact();
    Ok(txn.encode_diff_v1(&sv))
}

/// Merge two encoded updates into one.
pub fn merge_updates(a: &[u8], b: &[u8]) -> Result<Vec<u8>, ProviderError> {
    yrs::merge_updates_v1(&[a, b]).map_err(|e| ProviderError::Crdt(e.to_string()))
}
