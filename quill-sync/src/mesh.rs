//! Peer directory → connection plan.
//!
//! Every client computes the mesh independently from the same registry
//! snapshot, so [`MeshTopology::build`] is a pure function of the identity
//! set: no randomness, no negotiation, no dependence on input order.
//!
//! ```text
//!   sorted ids:  a  b  c  d
//!
//!   a ──► b ──► c ──► d
//!   ▲                 │
//!   └─────────────────┘
//! ```
//!
//! The ring is connected, survives any single link failure, and gives each
//! connected pair exactly one directed edge. Two clients get a single edge
//! (the lower id calls the higher one) instead of a two-edge "ring".

use std::collections::{BTreeMap, BTreeSet};

use crate::origin::ClientId;

/// Directed connection plan: caller → set of peers it calls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MeshTopology {
    edges: BTreeMap<ClientId, BTreeSet<ClientId>>,
}

impl MeshTopology {
    /// Build the ring over the (deduplicated, sorted) identity set.
    pub fn build(clients: &[ClientId]) -> Self {
        let ids: Vec<ClientId> = clients
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut edges: BTreeMap<ClientId, BTreeSet<ClientId>> =
            ids.iter().map(|id| (*id, BTreeSet::new())).collect();

        match ids.len() {
            0 | 1 => {}
            2 => {
                edges.entry(ids[0]).or_default().insert(ids[1]);
            }
            n => {
                for i in 0..n {
                    edges.entry(ids[i]).or_default().insert(ids[(i + 1) % n]);
                }
            }
        }

        Self { edges }
    }

    /// Peers `id` calls.
    pub fn receivers_of(&self, id: &ClientId) -> BTreeSet<ClientId> {
        self.edges.get(id).cloned().unwrap_or_default()
    }

    /// Peers that call `id`.
    pub fn senders_of(&self, id: &ClientId) -> BTreeSet<ClientId> {
        self.edges
            .iter()
            .filter(|(_, receivers)| receivers.contains(id))
            .map(|(caller, _)| *caller)
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Whether every client can reach every other one over the undirected
    /// view of the graph.
    pub fn is_connected(&self) -> bool {
        let Some(start) = self.edges.keys().next() else {
            return true;
        };

        let mut seen = BTreeSet::from([*start]);
        let mut stack = vec![*start];
        while let Some(id) = stack.pop() {
            let neighbours = self
                .receivers_of(&id)
                .into_iter()
                .chain(self.senders_of(&id));
            for next in neighbours {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.len() == self.edges.len()
    }
}

/// Edge changes between two peer sets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerDiff {
    /// In the old set only: tear down.
    pub obsolete: Vec<ClientId>,
    /// In the new set only: connect.
    pub added: Vec<ClientId>,
}

impl PeerDiff {
    pub fn between(old: &BTreeSet<ClientId>, new: &BTreeSet<ClientId>) -> Self {
        Self {
            obsolete: old.difference(new).copied().collect(),
            added: new.difference(old).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.obsolete.is_empty() && self.added.is_empty()
    }
}
