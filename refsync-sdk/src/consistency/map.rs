//! Keyed replicated collection: envelopes by id plus a tombstone set.
//!
//! The three-way merge resolves shared ids through the envelope merge,
//! unions the tombstones, and reports per-side apply/push directions. A
//! tombstoned id never appears in the resolved values — deletion is
//! permanent, a newer envelope cannot resurrect it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consistency::envelope::{self, Consistent, Envelope};
use crate::consistency::growset::GrowSet;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistentMap<T> {
    pub values: BTreeMap<String, Envelope<T>>,
    pub deleted: GrowSet<String>,
}

impl<T> Default for ConsistentMap<T> {
    fn default() -> Self {
        Self { values: BTreeMap::new(), deleted: GrowSet::new() }
    }
}

/// Ids one side must apply: upsert `values` from the resolved map, hard
/// delete `deleted` from the local store (or notify the remote peer).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapSideEffect {
    pub values: Vec<String>,
    pub deleted: Vec<String>,
}

impl MapSideEffect {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.deleted.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MapMerge<T> {
    pub resolved: ConsistentMap<T>,
    /// Apply to the local store.
    pub local: MapSideEffect,
    /// Push to the remote side.
    pub remote: MapSideEffect,
}

impl<T: Consistent> ConsistentMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Envelope<T>> {
        self.values.get(id)
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains(&id.to_string())
    }

    /// Insert or replace an envelope. Refused (returns `false`) when the id
    /// is tombstoned.
    pub fn upsert(&mut self, id: impl Into<String>, envelope: Envelope<T>) -> bool {
        let id = id.into();
        if self.deleted.contains(&id) {
            return false;
        }
        self.values.insert(id, envelope);
        true
    }

    /// Tombstone an id. Idempotent; the value, if present, is expunged.
    pub fn remove(&mut self, id: &str) {
        self.values.remove(id);
        self.deleted.insert(id.to_string());
    }

    /// Three-way merge of the local and remote maps.
    pub fn merge(local: &Self, remote: &Self) -> Result<MapMerge<T>> {
        let deleted = GrowSet::merge(&local.deleted, &remote.deleted);

        let mut resolved_values = BTreeMap::new();
        let mut local_values = Vec::new();
        let mut remote_values = Vec::new();

        let tombstoned = |id: &String| deleted.resolved.contains(id);

        for (id, env) in &local.values {
            match remote.values.get(id) {
                Some(remote_env) => {
                    let m = envelope::merge(Some(env), Some(remote_env))?;
                    if !m.changed.is_empty() {
                        local_values.push(id.clone());
                    }
                    if !m.rejected.is_empty() {
                        remote_values.push(id.clone());
                    }
                    if let Some(resolved) = m.resolved {
                        if !tombstoned(id) {
                            resolved_values.insert(id.clone(), resolved);
                        }
                    }
                }
                None => {
                    // Local-only: the remote side has never seen it.
                    if !tombstoned(id) {
                        remote_values.push(id.clone());
                        resolved_values.insert(id.clone(), env.clone());
                    }
                }
            }
        }
        for (id, env) in &remote.values {
            if local.values.contains_key(id) {
                continue;
            }
            if !tombstoned(id) {
                local_values.push(id.clone());
                resolved_values.insert(id.clone(), env.clone());
            }
        }

        // Tombstone dominance also applies to the push directions: a deleted
        // id is expunged, never re-sent as a value.
        local_values.retain(|id| !tombstoned(id));
        remote_values.retain(|id| !tombstoned(id));

        Ok(MapMerge {
            resolved: ConsistentMap { values: resolved_values, deleted: deleted.resolved },
            local: MapSideEffect {
                values: local_values,
                deleted: deleted.local_only.into_iter().collect(),
            },
            remote: MapSideEffect {
                values: remote_values,
                deleted: deleted.remote_only.into_iter().collect(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::identity::PeerId;
    use serde_json::{Value, json};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
    }

    impl Consistent for Note {
        fn mutable_keys() -> &'static [&'static str] {
            &["body"]
        }
        fn immutable_keys() -> &'static [&'static str] {
            &["id"]
        }
        fn get(&self, key: &str) -> Value {
            match key {
                "id" => json!(self.id),
                "body" => json!(self.body),
                _ => Value::Null,
            }
        }
        fn set(&mut self, key: &str, value: Value) -> Result<()> {
            match key {
                "body" => self.body = serde_json::from_value(value)?,
                other => return Err(Error::UnknownField(other.to_string())),
            }
            Ok(())
        }
    }

    fn peer(tag: &str) -> PeerId {
        PeerId::from_encoded(tag)
    }

    fn env(id: &str, body: &str, p: &str) -> Envelope<Note> {
        Envelope::new(Note { id: id.into(), body: body.into() }, &peer(p))
    }

    fn map(envs: Vec<Envelope<Note>>, deleted: &[&str]) -> ConsistentMap<Note> {
        ConsistentMap {
            values: envs.into_iter().map(|e| (e.data.id.clone(), e)).collect(),
            deleted: deleted.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disjoint_ids_flow_both_ways() {
        let local = map(vec![env("a", "1", "P")], &[]);
        let remote = map(vec![env("b", "2", "Q")], &[]);
        let m = ConsistentMap::merge(&local, &remote).unwrap();
        assert_eq!(m.resolved.values.len(), 2);
        assert_eq!(m.local.values, vec!["b".to_string()]);
        assert_eq!(m.remote.values, vec!["a".to_string()]);
    }

    // Scenario: a locally created record that the remote branch deleted
    // stays dead, and the local side is told to expunge it.
    #[test]
    fn remote_tombstone_wins_over_local_value() {
        let local = map(vec![env("i1", "offline", "P")], &[]);
        let remote = map(vec![], &["i1"]);
        let m = ConsistentMap::merge(&local, &remote).unwrap();

        assert!(m.resolved.values.is_empty());
        assert!(m.resolved.deleted.contains(&"i1".to_string()));
        assert_eq!(m.local.deleted, vec!["i1".to_string()]);
        assert!(m.local.values.is_empty());
        assert!(m.remote.values.is_empty());
    }

    #[test]
    fn tombstone_permanence_across_branches() {
        // One branch deletes, another keeps editing; the merge never
        // resurrects the id, in either merge order.
        let mut edited = env("i1", "v1", "P");
        edited.update("body", json!("v2"), &peer("P")).unwrap();
        let editor = map(vec![edited], &[]);
        let deleter = map(vec![], &["i1"]);

        let m1 = ConsistentMap::merge(&editor, &deleter).unwrap();
        let m2 = ConsistentMap::merge(&deleter, &editor).unwrap();
        assert!(m1.resolved.values.is_empty());
        assert!(m2.resolved.values.is_empty());
        assert_eq!(m1.resolved, m2.resolved);
    }

    #[test]
    fn shared_id_changed_and_rejected_drive_pushes() {
        let base = env("i1", "a", "M");
        let mut p = base.clone();
        p.update("body", json!("b"), &peer("AAA")).unwrap();
        let mut q = base.clone();
        q.update("body", json!("c"), &peer("ZZZ")).unwrap();

        // Local holds the losing edit: remote wins, apply locally.
        let m = ConsistentMap::merge(&map(vec![p.clone()], &[]), &map(vec![q.clone()], &[])).unwrap();
        assert_eq!(m.local.values, vec!["i1".to_string()]);
        assert!(m.remote.values.is_empty());
        assert_eq!(m.resolved.values["i1"].data.body, "c");

        // Local holds the winning edit: notify the remote side.
        let m = ConsistentMap::merge(&map(vec![q], &[]), &map(vec![p], &[])).unwrap();
        assert_eq!(m.remote.values, vec!["i1".to_string()]);
        assert!(m.local.values.is_empty());
    }

    #[test]
    fn idempotent_merge_is_quiescent() {
        let mut e = env("i1", "a", "P");
        e.update("body", json!("b"), &peer("P")).unwrap();
        let m0 = map(vec![e], &["gone"]);
        let m = ConsistentMap::merge(&m0, &m0).unwrap();
        assert_eq!(m.resolved, m0);
        assert!(m.local.is_empty());
        assert!(m.remote.is_empty());
    }

    #[test]
    fn commutative_on_resolved_state() {
        let base = env("i1", "a", "M");
        let mut p = base.clone();
        p.update("body", json!("b"), &peer("AAA")).unwrap();
        let mut q = base.clone();
        q.update("body", json!("c"), &peer("ZZZ")).unwrap();
        let a = map(vec![p, env("x", "1", "AAA")], &["d1"]);
        let b = map(vec![q, env("y", "2", "ZZZ")], &["d2"]);

        let ab = ConsistentMap::merge(&a, &b).unwrap().resolved;
        let ba = ConsistentMap::merge(&b, &a).unwrap().resolved;
        assert_eq!(ab, ba);
    }

    #[test]
    fn associative_on_resolved_state() {
        let base = env("i1", "a", "M");
        let mut a_env = base.clone();
        a_env.update("body", json!("b"), &peer("AAA")).unwrap();
        let mut b_env = base.clone();
        b_env.update("body", json!("c"), &peer("ZZZ")).unwrap();
        let mut c_env = base.clone();
        c_env.update("body", json!("d"), &peer("QQQ")).unwrap();
        c_env.update("body", json!("e"), &peer("QQQ")).unwrap();

        let a = map(vec![a_env], &[]);
        let b = map(vec![b_env], &["other"]);
        let c = map(vec![c_env, env("z", "9", "QQQ")], &[]);

        let ab = ConsistentMap::merge(&a, &b).unwrap().resolved;
        let ab_c = ConsistentMap::merge(&ab, &c).unwrap().resolved;
        let bc = ConsistentMap::merge(&b, &c).unwrap().resolved;
        let a_bc = ConsistentMap::merge(&a, &bc).unwrap().resolved;
        assert_eq!(ab_c, a_bc);
    }

    // Driving: after each side applies its direction, the next merge is a
    // fixed point with empty outputs.
    #[test]
    fn driving_reaches_fixed_point() {
        let base = env("i1", "a", "M");
        let mut p_env = base.clone();
        p_env.update("body", json!("b"), &peer("AAA")).unwrap();
        let mut q_env = base.clone();
        q_env.update("body", json!("c"), &peer("ZZZ")).unwrap();

        let mut local = map(vec![p_env, env("lp", "1", "AAA")], &["ld"]);
        let mut remote = map(vec![q_env, env("rp", "2", "ZZZ")], &["rd"]);

        let m = ConsistentMap::merge(&local, &remote).unwrap();

        // Apply the local direction: upsert resolved values, hard-delete ids.
        for id in &m.local.values {
            local.values.insert(id.clone(), m.resolved.values[id].clone());
        }
        for id in &m.local.deleted {
            local.values.remove(id);
            local.deleted.insert(id.clone());
        }
        // Push the remote direction.
        for id in &m.remote.values {
            remote.values.insert(id.clone(), m.resolved.values[id].clone());
        }
        for id in &m.remote.deleted {
            remote.values.remove(id);
            remote.deleted.insert(id.clone());
        }

        let again = ConsistentMap::merge(&local, &remote).unwrap();
        assert!(again.local.is_empty(), "local direction not quiescent: {:?}", again.local);
        assert!(again.remote.is_empty(), "remote direction not quiescent: {:?}", again.remote);
        assert_eq!(again.resolved, m.resolved);
    }
}
