//! Local replica: the device-side copy of an event's incident log.
//!
//! All mutations are local-first — they commit to host storage and return
//! synchronously, handing back the frame that should be pushed to the
//! server. Whether that frame goes out over the live socket or into the
//! offline queue is the transport layer's call; failure to send never rolls
//! back local state. Reconciliation on (re)join repairs any divergence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::consistency::{self, ConsistentMap, Envelope};
use crate::error::{Error, Result};
use crate::identity::{Keypair, Peer};
use crate::protocol::{FrameBody, Invitation, ShareInfo};
use crate::records::{Incident, IncidentPatch, Scratchpad};
use crate::storage::{KvStore, KvStoreExt};

/// An operation recorded while the socket was down, to be replayed over the
/// signed HTTP path with backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOp {
    pub id: Uuid,
    pub frame: FrameBody,
    pub queued_at: DateTime<Utc>,
}

/// What a join reconciliation decided.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Frames to push to the server.
    pub pushes: Vec<FrameBody>,
    /// Incident ids that changed locally (for UI refresh).
    pub applied: Vec<String>,
    /// Incident ids expunged locally by remote tombstones.
    pub expunged: Vec<String>,
}

pub struct Replica<S> {
    store: Arc<S>,
    keypair: Keypair,
    name: String,
}

impl<S: KvStore> Replica<S> {
    pub fn new(store: Arc<S>, keypair: Keypair, name: impl Into<String>) -> Self {
        Self { store, keypair, name: name.into() }
    }

    pub fn peer(&self) -> Peer {
        Peer { id: self.keypair.peer_id(), name: self.name.clone() }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn incidents_key(sku: &str) -> String {
        format!("incidents/{sku}")
    }

    fn scratchpads_key(sku: &str) -> String {
        format!("scratchpads/{sku}")
    }

    fn queue_key(sku: &str) -> String {
        format!("queue/{sku}")
    }

    fn membership_key(sku: &str) -> String {
        format!("membership/{sku}")
    }

    // ── Local state ────────────────────────────────────────────────────

    pub fn incidents(&self, sku: &str) -> Result<ConsistentMap<Incident>> {
        Ok(self.store.get_as(&Self::incidents_key(sku))?.unwrap_or_default())
    }

    pub fn scratchpads(&self, sku: &str) -> Result<BTreeMap<String, Envelope<Scratchpad>>> {
        Ok(self.store.get_as(&Self::scratchpads_key(sku))?.unwrap_or_default())
    }

    fn save_incidents(&self, sku: &str, map: &ConsistentMap<Incident>) -> Result<()> {
        self.store.set_as(&Self::incidents_key(sku), map)
    }

    fn save_scratchpads(
        &self,
        sku: &str,
        pads: &BTreeMap<String, Envelope<Scratchpad>>,
    ) -> Result<()> {
        self.store.set_as(&Self::scratchpads_key(sku), pads)
    }

    pub fn membership(&self, sku: &str) -> Result<Option<Invitation>> {
        self.store.get_as(&Self::membership_key(sku))
    }

    pub fn set_membership(&self, sku: &str, invitation: Option<&Invitation>) -> Result<()> {
        match invitation {
            Some(inv) => self.store.set_as(&Self::membership_key(sku), inv),
            None => self.store.del(&Self::membership_key(sku)),
        }
    }

    // ── Mutation API ───────────────────────────────────────────────────

    /// Record a new incident. Returns the stored envelope and the frame to
    /// push.
    pub fn add(&self, incident: Incident) -> Result<(Envelope<Incident>, FrameBody)> {
        let sku = incident.sku.clone();
        let id = incident.id.clone();
        let envelope = Envelope::new(incident, &self.keypair.peer_id());

        let mut map = self.incidents(&sku)?;
        if !map.upsert(id, envelope.clone()) {
            return Err(Error::Tombstoned);
        }
        self.save_incidents(&sku, &map)?;
        Ok((envelope.clone(), FrameBody::AddIncident { incident: envelope }))
    }

    /// Apply a partial edit. Returns `None` when every patched field already
    /// held the patched value (nothing to push).
    pub fn edit(
        &self,
        sku: &str,
        id: &str,
        patch: &IncidentPatch,
    ) -> Result<Option<(Envelope<Incident>, FrameBody)>> {
        let mut map = self.incidents(sku)?;
        if map.is_deleted(id) {
            return Err(Error::Tombstoned);
        }
        let Some(mut envelope) = map.get(id).cloned() else {
            return Err(Error::Malformed(format!("edit of unknown incident {id}")));
        };

        let peer = self.keypair.peer_id();
        let mut touched = false;
        for (key, value) in patch.entries() {
            touched |= envelope.update(key, value, &peer)?;
        }
        if !touched {
            return Ok(None);
        }

        map.upsert(id, envelope.clone());
        self.save_incidents(sku, &map)?;
        Ok(Some((envelope.clone(), FrameBody::UpdateIncident { incident: envelope })))
    }

    /// Tombstone an incident. Idempotent; always safe to push the frame.
    pub fn delete(&self, sku: &str, id: &str) -> Result<FrameBody> {
        let mut map = self.incidents(sku)?;
        map.remove(id);
        self.save_incidents(sku, &map)?;
        Ok(FrameBody::RemoveIncident { id: id.to_string() })
    }

    /// Upsert a scratchpad: diff the supplied record against the stored
    /// envelope field by field. Returns `None` when nothing changed.
    pub fn update_scratchpad(
        &self,
        sku: &str,
        scratchpad: Scratchpad,
    ) -> Result<Option<(Envelope<Scratchpad>, FrameBody)>> {
        use crate::consistency::Consistent;

        let mut pads = self.scratchpads(sku)?;
        let peer = self.keypair.peer_id();
        let id = scratchpad.id.clone();

        let (envelope, touched) = match pads.get(&id) {
            Some(existing) => {
                let mut env = existing.clone();
                let mut touched = false;
                for key in Scratchpad::mutable_keys() {
                    let next: Value = scratchpad.get(key);
                    touched |= env.update(key, next, &peer)?;
                }
                (env, touched)
            }
            None => (Envelope::new(scratchpad, &peer), true),
        };
        if !touched {
            return Ok(None);
        }

        pads.insert(id.clone(), envelope.clone());
        self.save_scratchpads(sku, &pads)?;
        Ok(Some((envelope.clone(), FrameBody::ScratchpadUpdate { id, scratchpad: envelope })))
    }

    // ── Outbound queue ─────────────────────────────────────────────────

    pub fn queue(&self, sku: &str) -> Result<Vec<QueuedOp>> {
        Ok(self.store.get_as(&Self::queue_key(sku))?.unwrap_or_default())
    }

    pub fn enqueue(&self, sku: &str, frame: FrameBody) -> Result<QueuedOp> {
        let op = QueuedOp { id: Uuid::new_v4(), frame, queued_at: Utc::now() };
        let serialized = serde_json::to_value(&op)?;
        self.store.update(&Self::queue_key(sku), &mut |current| {
            let mut ops = current
                .and_then(|v| serde_json::from_value::<Vec<Value>>(v).ok())
                .unwrap_or_default();
            ops.push(serialized.clone());
            Value::Array(ops)
        })?;
        Ok(op)
    }

    pub fn dequeue(&self, sku: &str, op_id: Uuid) -> Result<()> {
        let id = serde_json::to_value(op_id)?;
        self.store.update(&Self::queue_key(sku), &mut |current| {
            let mut ops = current
                .and_then(|v| serde_json::from_value::<Vec<Value>>(v).ok())
                .unwrap_or_default();
            ops.retain(|op| op.get("id") != Some(&id));
            Value::Array(ops)
        })
    }

    // ── Join reconciliation ────────────────────────────────────────────

    /// Fold a server snapshot into the local replica and compute the frames
    /// the server still needs. Runs on every `server_share_info`, whether
    /// from a join or a force-sync.
    pub fn reconcile(&self, sku: &str, info: &ShareInfo) -> Result<Reconciliation> {
        let local = self.incidents(sku)?;
        let remote = info.data.clone().into_map();

        let merge = ConsistentMap::merge(&local, &remote)?;

        // Applying the local direction to the stored map yields exactly the
        // resolved map, so persist that.
        self.save_incidents(sku, &merge.resolved)?;

        let mut out = Reconciliation {
            applied: merge.local.values.clone(),
            expunged: merge.local.deleted.clone(),
            ..Default::default()
        };

        for id in &merge.remote.values {
            let envelope = merge.resolved.values[id].clone();
            out.pushes.push(if remote.values.contains_key(id) {
                FrameBody::UpdateIncident { incident: envelope }
            } else {
                FrameBody::AddIncident { incident: envelope }
            });
        }
        for id in &merge.remote.deleted {
            out.pushes.push(FrameBody::RemoveIncident { id: id.clone() });
        }

        // Scratchpads follow the same discipline, minus tombstones.
        let mut pads = self.scratchpads(sku)?;
        let mut pads_dirty = false;
        let ids: std::collections::BTreeSet<String> =
            pads.keys().chain(info.scratchpads.keys()).cloned().collect();
        for id in ids {
            let local_pad = pads.get(&id);
            let remote_pad = info.scratchpads.get(&id);
            let m = consistency::merge(local_pad, remote_pad)?;
            let Some(resolved) = m.resolved else { continue };
            if !m.changed.is_empty() {
                pads.insert(id.clone(), resolved.clone());
                pads_dirty = true;
                out.applied.push(id.clone());
            }
            if !m.rejected.is_empty() || remote_pad.is_none() {
                out.pushes.push(FrameBody::ScratchpadUpdate { id, scratchpad: resolved });
            }
        }
        if pads_dirty {
            self.save_scratchpads(sku, &pads)?;
        }

        Ok(out)
    }

    /// Fold a single broadcast frame from another peer into local state.
    /// Returns the id the UI should refresh, if any.
    pub fn apply_remote(&self, sku: &str, body: &FrameBody) -> Result<Option<String>> {
        match body {
            FrameBody::AddIncident { incident } | FrameBody::UpdateIncident { incident } => {
                let id = incident.data.id.clone();
                let mut map = self.incidents(sku)?;
                if map.is_deleted(&id) {
                    return Ok(None);
                }
                let merged = consistency::merge(map.get(&id), Some(incident))?;
                let changed = !merged.changed.is_empty();
                if let Some(resolved) = merged.resolved {
                    map.upsert(&id, resolved);
                    self.save_incidents(sku, &map)?;
                }
                Ok(changed.then_some(id))
            }
            FrameBody::RemoveIncident { id } => {
                let mut map = self.incidents(sku)?;
                let existed = map.get(id).is_some();
                map.remove(id);
                self.save_incidents(sku, &map)?;
                Ok(existed.then(|| id.clone()))
            }
            FrameBody::ScratchpadUpdate { id, scratchpad } => {
                let mut pads = self.scratchpads(sku)?;
                let merged = consistency::merge(pads.get(id), Some(scratchpad))?;
                let changed = !merged.changed.is_empty();
                if let Some(resolved) = merged.resolved {
                    pads.insert(id.clone(), resolved);
                    self.save_scratchpads(sku, &pads)?;
                }
                Ok(changed.then(|| id.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::IncidentData;
    use crate::records::Outcome;
    use crate::storage::MemoryStore;

    const SKU: &str = "RE-VRC-25-0001";

    fn replica(name: &str) -> Replica<MemoryStore> {
        Replica::new(Arc::new(MemoryStore::new()), Keypair::generate(), name)
    }

    fn incident(team: &str) -> Incident {
        Incident::new(SKU, team, Outcome::Minor)
    }

    #[test]
    fn add_commits_locally_and_yields_frame() {
        let r = replica("head ref");
        let (env, frame) = r.add(incident("1234A")).unwrap();
        assert!(matches!(frame, FrameBody::AddIncident { .. }));

        let map = r.incidents(SKU).unwrap();
        assert_eq!(map.get(&env.data.id).unwrap().data.team, "1234A");
    }

    #[test]
    fn edit_bumps_only_touched_fields() {
        let r = replica("head ref");
        let (env, _) = r.add(incident("1234A")).unwrap();

        let patch =
            IncidentPatch { notes: Some("pinned opponent".into()), ..Default::default() };
        let (edited, _) = r.edit(SKU, &env.data.id, &patch).unwrap().unwrap();
        assert_eq!(edited.meta("notes").unwrap().count, 1);
        assert_eq!(edited.meta("team").unwrap().count, 0);

        // Re-applying the identical patch is a no-op.
        assert!(r.edit(SKU, &env.data.id, &patch).unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent_and_permanent() {
        let r = replica("head ref");
        let (env, _) = r.add(incident("1234A")).unwrap();
        let id = env.data.id.clone();

        r.delete(SKU, &id).unwrap();
        r.delete(SKU, &id).unwrap();

        let map = r.incidents(SKU).unwrap();
        assert!(map.get(&id).is_none());
        assert!(map.is_deleted(&id));

        // A tombstoned id cannot be edited or re-added.
        let patch = IncidentPatch { notes: Some("x".into()), ..Default::default() };
        assert!(matches!(r.edit(SKU, &id, &patch), Err(Error::Tombstoned)));
        let mut again = incident("1234A");
        again.id = id;
        assert!(matches!(r.add(again), Err(Error::Tombstoned)));
    }

    #[test]
    fn queue_survives_roundtrip_and_dequeue() {
        let r = replica("head ref");
        let (_, frame) = r.add(incident("1234A")).unwrap();
        let op = r.enqueue(SKU, frame).unwrap();
        let (_, frame2) = r.add(incident("5678B")).unwrap();
        r.enqueue(SKU, frame2).unwrap();

        assert_eq!(r.queue(SKU).unwrap().len(), 2);
        r.dequeue(SKU, op.id).unwrap();
        let rest = r.queue(SKU).unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].id, op.id);
    }

    // Offline add, then the server snapshot shows another referee deleted
    // it: the replica expunges the incident and pushes nothing back.
    #[test]
    fn reconcile_remote_delete_wins() {
        let r = replica("head ref");
        let (env, _) = r.add(incident("1234A")).unwrap();
        let id = env.data.id.clone();

        let info = ShareInfo {
            data: IncidentData { incidents: vec![], deleted: vec![id.clone()] },
            ..Default::default()
        };
        let rec = r.reconcile(SKU, &info).unwrap();

        assert_eq!(rec.expunged, vec![id.clone()]);
        assert!(rec.pushes.is_empty());
        let map = r.incidents(SKU).unwrap();
        assert!(map.get(&id).is_none());
        assert!(map.is_deleted(&id));
    }

    // Offline add + edit + delete of a record the server never saw: after
    // reconcile the server learns only the tombstone.
    #[test]
    fn reconcile_pushes_tombstone_for_unknown_record() {
        let r = replica("head ref");
        let (env, _) = r.add(incident("1234A")).unwrap();
        let id = env.data.id.clone();
        let patch = IncidentPatch { notes: Some("x".into()), ..Default::default() };
        r.edit(SKU, &id, &patch).unwrap();
        r.delete(SKU, &id).unwrap();

        let rec = r.reconcile(SKU, &ShareInfo::default()).unwrap();
        assert_eq!(rec.pushes.len(), 1);
        assert!(
            matches!(&rec.pushes[0], FrameBody::RemoveIncident { id: pushed } if *pushed == id)
        );
    }

    #[test]
    fn reconcile_pushes_local_only_and_applies_remote_only() {
        let p = replica("ref P");
        let q = replica("ref Q");

        let (mine, _) = p.add(incident("1234A")).unwrap();
        let (theirs, _) = q.add(incident("5678B")).unwrap();

        let info = ShareInfo {
            data: IncidentData { incidents: vec![theirs.clone()], deleted: vec![] },
            ..Default::default()
        };
        let rec = p.reconcile(SKU, &info).unwrap();

        assert_eq!(rec.applied, vec![theirs.data.id.clone()]);
        assert_eq!(rec.pushes.len(), 1);
        assert!(matches!(
            &rec.pushes[0],
            FrameBody::AddIncident { incident } if incident.data.id == mine.data.id
        ));

        let map = p.incidents(SKU).unwrap();
        assert!(map.get(&theirs.data.id).is_some());
        assert!(map.get(&mine.data.id).is_some());
    }

    #[test]
    fn apply_remote_merges_instead_of_clobbering() {
        let p = replica("ref P");
        let q = replica("ref Q");

        let (env, _) = p.add(incident("1234A")).unwrap();
        let id = env.data.id.clone();

        // Q learns the incident, then edits notes; P concurrently edits team.
        q.apply_remote(SKU, &FrameBody::AddIncident { incident: env }).unwrap();
        let q_patch = IncidentPatch { notes: Some("from Q".into()), ..Default::default() };
        let (q_env, _) = q.edit(SKU, &id, &q_patch).unwrap().unwrap();
        let p_patch = IncidentPatch { team: Some("9999Z".into()), ..Default::default() };
        p.edit(SKU, &id, &p_patch).unwrap().unwrap();

        let refreshed =
            p.apply_remote(SKU, &FrameBody::UpdateIncident { incident: q_env }).unwrap();
        assert_eq!(refreshed, Some(id.clone()));

        let merged = p.incidents(SKU).unwrap().get(&id).unwrap().clone();
        assert_eq!(merged.data.team, "9999Z");
        assert_eq!(merged.data.notes, "from Q");
    }

    #[test]
    fn scratchpad_update_diffs_fields() {
        let r = replica("head ref");
        let mut pad = Scratchpad::new(SKU, "high-stakes", 1, "Q12");
        pad.awp.red = true;

        let (env, _) = r.update_scratchpad(SKU, pad.clone()).unwrap().unwrap();
        assert_eq!(env.meta("awp").unwrap().count, 0); // fresh envelope

        pad.auto = crate::records::AutoWinner::Blue;
        let (env, _) = r.update_scratchpad(SKU, pad.clone()).unwrap().unwrap();
        assert_eq!(env.meta("auto").unwrap().count, 1);
        assert_eq!(env.meta("awp").unwrap().count, 0);
        assert_eq!(env.data.auto, crate::records::AutoWinner::Blue);

        // Unchanged scratchpad produces nothing.
        assert!(r.update_scratchpad(SKU, pad).unwrap().is_none());
    }
}
