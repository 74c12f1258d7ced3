//! Ephemeral presence ("awareness") for a shared document.
//!
//! Each client owns exactly one entry, a small map of named fields such as
//! `name`, `color` or `cursor`. Entries travel over the peer mesh as diffs and
//! are never written to the cache or the remote store.
//!
//! ## Merge rule
//!
//! ```text
//! field slot = (clock, value | cleared)
//!
//! incoming.clock >  known.clock  → take incoming
//! incoming.clock <= known.clock  → keep known
//! ```
//!
//! Clocks are per author and only move forward, so relaying the same diff
//! along several paths, or out of order, converges on the author's latest
//! write for every field. A removed entry leaves a tombstone holding the
//! removal clock; older diffs that arrive late cannot bring it back.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::origin::ClientId;
use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Values
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a client id (HSL, fixed
    /// saturation and lightness).
    pub fn from_client(id: ClientId) -> Self {
        let hash = id.as_uuid().as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb`, for editor bindings that take CSS colors.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text selection in document offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextCursor {
    pub anchor: u32,
    pub head: u32,
}

/// Value of one presence field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceValue {
    Text(String),
    Color(CursorColor),
    Cursor(TextCursor),
    Number(f64),
    Flag(bool),
}

/// One versioned field. `value: None` records that the author cleared it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSlot {
    pub clock: u64,
    pub value: Option<PresenceValue>,
}

/// Presence of every known client, local one included.
pub type PresenceSnapshot = BTreeMap<ClientId, BTreeMap<String, PresenceValue>>;

// ───────────────────────────────────────────────────────────────────
// Wire diff
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client: ClientId,
    pub fields: BTreeMap<String, FieldSlot>,
    /// Set when the author left; carries the removal clock.
    pub removed: Option<u64>,
}

/// Diff carried in an awareness frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }
}

/// Which clients a merge touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched client, in a stable order.
    pub fn touched(&self) -> BTreeSet<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// State
// ───────────────────────────────────────────────────────────────────

/// Presence state held by one session.
#[derive(Debug, Clone)]
pub struct AwarenessState {
    local_id: ClientId,
    clock: u64,
    local: BTreeMap<String, FieldSlot>,
    peers: HashMap<ClientId, BTreeMap<String, FieldSlot>>,
    tombstones: HashMap<ClientId, u64>,
}

impl AwarenessState {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            clock: 0,
            local: BTreeMap::new(),
            peers: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Set (or clear, with `None`) one local field. Returns the diff to
    /// broadcast.
    pub fn set_local_field(
        &mut self,
        key: impl Into<String>,
        value: Option<PresenceValue>,
    ) -> AwarenessUpdate {
        self.clock += 1;
        let key = key.into();
        let slot = FieldSlot {
            clock: self.clock,
            value,
        };
        self.local.insert(key.clone(), slot.clone());
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: self.local_id,
                fields: BTreeMap::from([(key, slot)]),
                removed: None,
            }],
        }
    }

    pub fn local_field(&self, key: &str) -> Option<&PresenceValue> {
        self.local.get(key).and_then(|slot| slot.value.as_ref())
    }

    /// Drop all local fields and announce that this client left.
    pub fn remove_local(&mut self) -> AwarenessUpdate {
        self.clock += 1;
        self.local.clear();
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: self.local_id,
                fields: BTreeMap::new(),
                removed: Some(self.clock),
            }],
        }
    }

    /// Move the local entry to a new identity (after registration).
    pub fn rekey_local(&mut self, new_id: ClientId) {
        if new_id == self.local_id {
            return;
        }
        self.local_id = new_id;
        self.peers.remove(&new_id);
        self.tombstones.remove(&new_id);
    }

    /// Merge a diff received from a peer.
    ///
    /// Entries describing the local client are ignored: only this session
    /// writes its own entry.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in &update.entries {
            if entry.client == self.local_id {
                continue;
            }
            let tombstone = self.tombstones.get(&entry.client).copied();

            if let Some(removed_at) = entry.removed {
                if tombstone.is_some_and(|t| t >= removed_at) {
                    continue;
                }
                let newest = self
                    .peers
                    .get(&entry.client)
                    .and_then(|fields| fields.values().map(|s| s.clock).max());
                // Fields written after the removal clock win over it.
                if newest.is_some_and(|c| c > removed_at) {
                    continue;
                }
                self.tombstones.insert(entry.client, removed_at);
                if self.peers.remove(&entry.client).is_some() {
                    change.removed.push(entry.client);
                }
                continue;
            }

            let fresh: Vec<(&String, &FieldSlot)> = entry
                .fields
                .iter()
                .filter(|(_, slot)| tombstone.is_none_or(|t| slot.clock > t))
                .collect();
            if fresh.is_empty() {
                continue;
            }

            let existed = self.peers.contains_key(&entry.client);
            let fields = self.peers.entry(entry.client).or_default();
            let mut touched = false;
            for (key, slot) in fresh {
                let newer = fields.get(key).is_none_or(|known| slot.clock > known.clock);
                if newer {
                    fields.insert(key.clone(), slot.clone());
                    touched = true;
                }
            }

            if !existed {
                self.tombstones.remove(&entry.client);
                change.added.push(entry.client);
            } else if touched {
                change.updated.push(entry.client);
            }
        }

        change
    }

    /// Current state of the given clients as a diff; removed clients are
    /// encoded as removals.
    pub fn encode_update<'a>(
        &self,
        clients: impl IntoIterator<Item = &'a ClientId>,
    ) -> AwarenessUpdate {
        let entries = clients
            .into_iter()
            .filter_map(|client| self.entry_for(client))
            .collect();
        AwarenessUpdate { entries }
    }

    /// Every live entry, local first. Sent to a peer when a link opens.
    pub fn full_update(&self) -> AwarenessUpdate {
        let mut entries = Vec::with_capacity(self.peers.len() + 1);
        if !self.local.is_empty() {
            entries.push(AwarenessEntry {
                client: self.local_id,
                fields: self.local.clone(),
                removed: None,
            });
        }
        let mut peers: Vec<&ClientId> = self.peers.keys().collect();
        peers.sort();
        entries.extend(peers.into_iter().filter_map(|client| self.entry_for(client)));
        AwarenessUpdate { entries }
    }

    /// Purge every peer not in `live` (the registry). Returns who was purged.
    pub fn retain_clients(&mut self, live: &BTreeSet<ClientId>) -> Vec<ClientId> {
        let gone: Vec<ClientId> = self
            .peers
            .keys()
            .filter(|client| !live.contains(client))
            .copied()
            .collect();
        for client in &gone {
            if let Some(fields) = self.peers.remove(client) {
                let last = fields.values().map(|s| s.clock).max().unwrap_or(0);
                self.tombstones.insert(*client, last);
            }
        }
        gone
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut out = PresenceSnapshot::new();
        let live = |fields: &BTreeMap<String, FieldSlot>| -> BTreeMap<String, PresenceValue> {
            fields
                .iter()
                .filter_map(|(key, slot)| slot.value.clone().map(|v| (key.clone(), v)))
                .collect()
        };
        if !self.local.is_empty() {
            out.insert(self.local_id, live(&self.local));
        }
        for (client, fields) in &self.peers {
            out.insert(*client, live(fields));
        }
        out
    }

    fn entry_for(&self, client: &ClientId) -> Option<AwarenessEntry> {
        if *client == self.local_id {
            return Some(AwarenessEntry {
                client: *client,
                fields: self.local.clone(),
                removed: None,
            });
        }
        if let Some(fields) = self.peers.get(client) {
            return Some(AwarenessEntry {
                client: *client,
                fields: fields.clone(),
                removed: None,
            });
        }
        self.tombstones.get(client).map(|removed_at| AwarenessEntry {
            client: *client,
            fields: BTreeMap::new(),
            removed: Some(*removed_at),
        })
    }
}
