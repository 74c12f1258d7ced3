//! Outbound batch of local edits.
//!
//! ```text
//! edit ──► merge into pending ──► count == cap ? ──► flush now
//!                │                      │
//!                │                      └── no: deadline = now + wait
//!                ▼
//!        deadline passes with no further edit ──► flush
//! ```
//!
//! Every push re-arms the quiescence deadline, so a burst of edits produces
//! exactly one flush `wait` after the last of them (or earlier, at the cap).

use std::time::Duration;
use tokio::time::Instant;

use crate::document;
use crate::provider::ProviderError;

/// What the caller should do after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Cap reached: take and send now.
    Full,
    /// Wait for the deadline.
    Pending,
}

#[derive(Debug)]
pub struct OutboundBatch {
    pending: Option<Vec<u8>>,
    merges: usize,
    max_merges: usize,
    wait: Duration,
    deadline: Option<Instant>,
}

impl OutboundBatch {
    pub fn new(max_merges: usize, wait: Duration) -> Self {
        Self {
            pending: None,
            merges: 0,
            max_merges: max_merges.max(1),
            wait,
            deadline: None,
        }
    }

    /// Merge `update` into the pending batch and re-arm the deadline.
    pub fn push(&mut self, update: &[u8], now: Instant) -> Result<BatchState, ProviderError> {
        let merged = match self.pending.take() {
            Some(pending) => document::merge_updates(&pending, update)?,
            None => update.to_vec(),
        };
        self.pending = Some(merged);
        self.merges += 1;

        if self.merges >= self.max_merges {
            self.deadline = None;
            return Ok(BatchState::Full);
        }
        self.deadline = Some(now + self.wait);
        Ok(BatchState::Pending)
    }

    /// Take the merged update and reset the batch.
    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.merges = 0;
        self.deadline = None;
        self.pending.take()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drop the pending batch without sending it.
    pub fn cancel(&mut self) {
        self.take();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Doc, GetString, Text, Transact, WriteTxn};

    fn edits(n: usize) -> Vec<Vec<u8>> {
        let doc = Doc::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = document::observe_updates(&doc, tx).unwrap();
        for i in 0..n {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("body");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, &i.to_string());
        }
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update.bytes);
        }
        out
    }

    #[test]
    fn test_cap_flushes_on_twentieth_edit() {
        let updates = edits(20);
        let mut batch = OutboundBatch::new(20, Duration::from_millis(100));
        let now = Instant::now();
        for update in &updates[..19] {
            assert_eq!(batch.push(update, now).unwrap(), BatchState::Pending);
        }
        assert_eq!(batch.push(&updates[19], now).unwrap(), BatchState::Full);
        assert!(batch.deadline().is_none());

        let merged = batch.take().unwrap();
        assert!(batch.is_empty());

        let replica = Doc::new();
        document::apply_update(&replica, &merged, crate::origin::Origin::Local).unwrap();
        let mut txn = replica.transact_mut();
        let text = txn.get_or_insert_text("body");
        assert_eq!(text.get_string(&txn), "012345678910111213141516171819");
    }

    #[test]
    fn test_each_push_rearms_deadline() {
        let updates = edits(2);
        let mut batch = OutboundBatch::new(20, Duration::from_millis(100));
        let t0 = Instant::now();
        batch.push(&updates[0], t0).unwrap();
        assert_eq!(batch.deadline(), Some(t0 + Duration::from_millis(100)));

        let t1 = t0 + Duration::from_millis(60);
        batch.push(&updates[1], t1).unwrap();
        assert_eq!(batch.deadline(), Some(t1 + Duration::from_millis(100)));
    }

    #[test]
    fn test_cancel_drops_pending() {
        let updates = edits(1);
        let mut batch = OutboundBatch::new(20, Duration::from_millis(100));
        batch.push(&updates[0], Instant::now()).unwrap();
        batch.cancel();
        assert!(batch.take().is_none());
        assert!(batch.deadline().is_none());
    }
}
