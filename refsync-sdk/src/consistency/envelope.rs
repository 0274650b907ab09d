//! Per-field last-writer-wins envelope.
//!
//! An [`Envelope`] wraps a record with a `consistency` table: one
//! [`FieldMeta`] per mutable key, carrying an edit counter, the id of the
//! most recent writer, and the edit history. Merging two envelopes resolves
//! each field independently — higher counter wins, ties break on value
//! equality and then on the lexicographically larger writer id.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identity::PeerId;

/// A record type that can ride the envelope.
///
/// Field values cross the merge as [`serde_json::Value`]; "deep equality" in
/// the merge rules is exactly `Value` equality. Immutable keys never carry
/// metadata and must agree byte-for-byte between any two envelopes claiming
/// the same id.
pub trait Consistent: Clone + Serialize + DeserializeOwned {
    /// Keys that participate in per-field merging.
    fn mutable_keys() -> &'static [&'static str];

    /// Identity keys, fixed at creation.
    fn immutable_keys() -> &'static [&'static str];

    /// Snapshot of a single field. Unknown keys return `Value::Null`.
    fn get(&self, key: &str) -> Value;

    /// Install a field value decoded from the wire.
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
}

/// One prior edit of a field: the value it replaced and who had written it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEdit {
    pub prev: Value,
    pub peer: PeerId,
}

/// Versioning metadata for a single mutable field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Monotonically non-decreasing edit counter.
    pub count: u32,
    /// The most recent writer.
    pub peer: PeerId,
    /// Prior values, oldest first. A contiguous prefix may be truncated by
    /// peers with bounded storage; merges never truncate it themselves.
    #[serde(default)]
    pub history: Vec<FieldEdit>,
}

impl FieldMeta {
    fn initial(peer: &PeerId) -> Self {
        Self { count: 0, peer: peer.clone(), history: Vec::new() }
    }
}

/// A record plus its per-field consistency table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
    pub consistency: BTreeMap<String, FieldMeta>,
}

/// Outcome of merging two optional envelopes.
///
/// `changed` lists keys where the remote side won (apply locally);
/// `rejected` lists keys where a diverging remote write lost (notify the
/// remote side).
#[derive(Debug, Clone)]
pub struct LwwMerge<T> {
    pub resolved: Option<Envelope<T>>,
    pub changed: Vec<String>,
    pub rejected: Vec<String>,
}

impl<T: Consistent> Envelope<T> {
    /// Wrap a freshly created record: every mutable key at count 0 with
    /// empty history, attributed to the creating peer.
    pub fn new(data: T, peer: &PeerId) -> Self {
        let consistency = T::mutable_keys()
            .iter()
            .map(|k| ((*k).to_string(), FieldMeta::initial(peer)))
            .collect();
        Self { data, consistency }
    }

    pub fn meta(&self, key: &str) -> Option<&FieldMeta> {
        self.consistency.get(key)
    }

    /// Apply one field edit. A deep-equal value is a no-op and returns
    /// `false`; otherwise the previous value is pushed to history, the
    /// counter is bumped, and the writer recorded.
    pub fn update(&mut self, key: &str, value: Value, peer: &PeerId) -> Result<bool> {
        if !T::mutable_keys().contains(&key) {
            return Err(Error::UnknownField(key.to_string()));
        }
        let current = self.data.get(key);
        if current == value {
            return Ok(false);
        }
        let meta = self
            .consistency
            .entry(key.to_string())
            .or_insert_with(|| FieldMeta::initial(peer));
        meta.history.push(FieldEdit { prev: current, peer: meta.peer.clone() });
        meta.count += 1;
        meta.peer = peer.clone();
        self.data.set(key, value)?;
        Ok(true)
    }
}

/// Merge two optional envelopes field by field.
///
/// Null rules: `(None, None)` resolves to `None`; `(x, None)` resolves to
/// `x` with no outputs; `(None, y)` resolves to `y` with every mutable key
/// reported as changed (the local side has everything to learn).
///
/// Precondition: two non-null operands must agree on every immutable key.
pub fn merge<T: Consistent>(
    local: Option<&Envelope<T>>,
    remote: Option<&Envelope<T>>,
) -> Result<LwwMerge<T>> {
    let (local, remote) = match (local, remote) {
        (None, None) => {
            return Ok(LwwMerge { resolved: None, changed: Vec::new(), rejected: Vec::new() });
        }
        (Some(l), None) => {
            return Ok(LwwMerge {
                resolved: Some(l.clone()),
                changed: Vec::new(),
                rejected: Vec::new(),
            });
        }
        (None, Some(r)) => {
            return Ok(LwwMerge {
                resolved: Some(r.clone()),
                changed: T::mutable_keys().iter().map(|k| (*k).to_string()).collect(),
                rejected: Vec::new(),
            });
        }
        (Some(l), Some(r)) => (l, r),
    };

    for key in T::immutable_keys() {
        if local.data.get(key) != remote.data.get(key) {
            return Err(Error::ImmutableDivergence((*key).to_string()));
        }
    }

    let mut resolved = local.clone();
    let mut changed = Vec::new();
    let mut rejected = Vec::new();

    for key in T::mutable_keys() {
        let default_meta = || FieldMeta {
            count: 0,
            peer: PeerId::from_encoded(""),
            history: Vec::new(),
        };
        let lm = local.meta(key).cloned().unwrap_or_else(default_meta);
        let rm = remote.meta(key).cloned().unwrap_or_else(default_meta);
        let l_val = local.data.get(key);
        let r_val = remote.data.get(key);

        let remote_wins = if lm.count > rm.count {
            // Local dominates. The remote side only needs to hear about it
            // when it holds writes the local history does not account for —
            // a merely-stale remote is caught up by the normal op stream.
            if !is_known_prefix(&lm, &rm, &r_val) {
                rejected.push((*key).to_string());
            }
            false
        } else if lm.count < rm.count {
            changed.push((*key).to_string());
            true
        } else if l_val == r_val {
            // Equal count, equal value: keep local; either side is fine.
            false
        } else if rm.peer > lm.peer {
            changed.push((*key).to_string());
            true
        } else {
            rejected.push((*key).to_string());
            false
        };

        if remote_wins {
            resolved.data.set(key, r_val)?;
            resolved.consistency.insert((*key).to_string(), rm);
        }
    }

    Ok(LwwMerge { resolved: Some(resolved), changed, rejected })
}

/// Whether the remote side's state for a field is entirely contained in the
/// local history — i.e. the remote is simply behind, not diverged. Truncated
/// local history that cannot prove containment counts as divergence.
fn is_known_prefix(local: &FieldMeta, remote: &FieldMeta, remote_value: &Value) -> bool {
    if remote.history.iter().any(|e| !local.history.contains(e)) {
        return false;
    }
    // history[rc] records the value produced by the remote's latest edit
    // (as the `prev` of the edit that superseded it) and its author.
    match local.history.get(remote.count as usize) {
        Some(edit) => edit.prev == *remote_value && edit.peer == remote.peer,
        None => false,
    }
}
