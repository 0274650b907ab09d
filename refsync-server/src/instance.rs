//! Per-event authoritative instance.
//!
//! One `Instance` exists per SKU. It owns the live session list and
//! serializes every state-touching operation behind one async mutex: while
//! one mutation's storage transaction is in flight, no other runs. Fan-out
//! happens after the storage commit. The server is a durable log and
//! broadcast hub — semantic validation of incidents is the client's job.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use refsync_sdk::consistency::{self, Envelope};
use refsync_sdk::identity::{Peer, PeerId};
use refsync_sdk::protocol::{
    ErrorReason, Frame, FrameBody, IncidentData, ShareInfo,
};
use refsync_sdk::records::{Incident, Scratchpad};

use crate::db::Db;
use crate::web::Refusal;

/// A connected socket. `tx` feeds the socket's writer task; a failed send
/// marks the session inactive and schedules its removal broadcast.
struct Session {
    socket_id: Uuid,
    peer: Peer,
    tx: mpsc::Sender<String>,
    active: bool,
}

pub struct Instance {
    pub sku: String,
    db: Arc<Mutex<Db>>,
    /// The serializing primitive: all storage and session mutations run
    /// under this lock.
    state: tokio::sync::Mutex<Vec<Session>>,
    last_activity: Mutex<Instant>,
}

fn tombstoned_refusal() -> Refusal {
    Refusal::new(ErrorReason::BadRequest, Some("tombstoned".into()))
}

fn storage_refusal(e: impl std::fmt::Display) -> Refusal {
    Refusal::new(ErrorReason::ServerError, Some(e.to_string()))
}

impl Instance {
    pub fn new(sku: String, db: Arc<Mutex<Db>>) -> Self {
        Self {
            sku,
            db,
            state: tokio::sync::Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Reset the idle alarm. Called on every request that touches the
    /// instance.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    // ── Mutations ──────────────────────────────────────────────────────

    /// Add an incident. A tombstoned id is always refused — deletion is
    /// permanent on every path.
    pub async fn add_incident(
        &self,
        origin: &Peer,
        incoming: Envelope<Incident>,
    ) -> Result<(), Refusal> {
        self.touch();
        let mut sessions = self.state.lock().await;

        let id = incoming.data.id.clone();
        let resolved = {
            let db = self.db.lock();
            if db.is_tombstoned(&self.sku, &id).map_err(storage_refusal)? {
                return Err(tombstoned_refusal());
            }
            let stored = db.get_incident(&self.sku, &id).map_err(storage_refusal)?;
            // A re-sent add merges rather than clobbering.
            let merged = consistency::merge(stored.as_ref(), Some(&incoming))
                .map_err(|e| Refusal::new(ErrorReason::BadRequest, Some(e.to_string())))?;
            let resolved = merged.resolved.unwrap_or(incoming);
            db.upsert_incident(&self.sku, &resolved).map_err(storage_refusal)?;
            resolved
        };

        let frame = Frame::from_client(FrameBody::AddIncident { incident: resolved }, origin);
        Self::broadcast(&mut sessions, &frame, Some(&origin.id), true);
        Ok(())
    }

    /// Edit an incident. Refused with `stale` when the incoming envelope
    /// wins no field against the stored one.
    pub async fn update_incident(
        &self,
        origin: &Peer,
        incoming: Envelope<Incident>,
    ) -> Result<(), Refusal> {
        self.touch();
        let mut sessions = self.state.lock().await;

        let id = incoming.data.id.clone();
        let resolved = {
            let db = self.db.lock();
            if db.is_tombstoned(&self.sku, &id).map_err(storage_refusal)? {
                return Err(tombstoned_refusal());
            }
            let stored = db.get_incident(&self.sku, &id).map_err(storage_refusal)?;
            match stored {
                None => {
                    // An edit that raced ahead of its add; store it whole.
                    db.upsert_incident(&self.sku, &incoming).map_err(storage_refusal)?;
                    incoming
                }
                Some(stored) => {
                    let merged = consistency::merge(Some(&stored), Some(&incoming))
                        .map_err(|e| Refusal::new(ErrorReason::BadRequest, Some(e.to_string())))?;
                    if merged.changed.is_empty() {
                        return Err(Refusal::new(
                            ErrorReason::Stale,
                            Some("no field newer than the stored revision".into()),
                        ));
                    }
                    let resolved = merged.resolved.unwrap_or(incoming);
                    db.upsert_incident(&self.sku, &resolved).map_err(storage_refusal)?;
                    resolved
                }
            }
        };

        let frame = Frame::from_client(FrameBody::UpdateIncident { incident: resolved }, origin);
        Self::broadcast(&mut sessions, &frame, Some(&origin.id), true);
        Ok(())
    }

    /// Delete an incident. Idempotent: a repeat delete succeeds without a
    /// broadcast.
    pub async fn remove_incident(&self, origin: &Peer, id: &str) -> Result<(), Refusal> {
        self.touch();
        let mut sessions = self.state.lock().await;

        let newly_dead = {
            let db = self.db.lock();
            let newly_dead = db.add_tombstone(&self.sku, id).map_err(storage_refusal)?;
            db.delete_incident(&self.sku, id).map_err(storage_refusal)?;
            newly_dead
        };
        if newly_dead {
            let frame =
                Frame::from_client(FrameBody::RemoveIncident { id: id.to_string() }, origin);
            Self::broadcast(&mut sessions, &frame, Some(&origin.id), true);
        }
        Ok(())
    }

    /// Merge a scratchpad revision. A revision that wins nothing is a
    /// silent success — scratchpads have no stale signal.
    pub async fn scratchpad_update(
        &self,
        origin: &Peer,
        id: &str,
        incoming: Envelope<Scratchpad>,
    ) -> Result<(), Refusal> {
        self.touch();
        let mut sessions = self.state.lock().await;

        let resolved = {
            let db = self.db.lock();
            let stored = db.get_scratchpad(&self.sku, id).map_err(storage_refusal)?;
            let had_stored = stored.is_some();
            let merged = consistency::merge(stored.as_ref(), Some(&incoming))
                .map_err(|e| Refusal::new(ErrorReason::BadRequest, Some(e.to_string())))?;
            if had_stored && merged.changed.is_empty() {
                return Ok(());
            }
            let resolved = merged.resolved.unwrap_or(incoming);
            db.upsert_scratchpad(&self.sku, &resolved).map_err(storage_refusal)?;
            resolved
        };

        let frame = Frame::from_client(
            FrameBody::ScratchpadUpdate { id: id.to_string(), scratchpad: resolved },
            origin,
        );
        Self::broadcast(&mut sessions, &frame, Some(&origin.id), true);
        Ok(())
    }

    /// Relay a chat message to the other connected peers.
    pub async fn relay_message(&self, origin: &Peer, message: String) {
        self.touch();
        let mut sessions = self.state.lock().await;
        let frame = Frame::from_client(FrameBody::Message { message }, origin);
        Self::broadcast(&mut sessions, &frame, Some(&origin.id), true);
    }

    // ── Snapshot ───────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> Result<ShareInfo, Refusal> {
        self.touch();
        let sessions = self.state.lock().await;
        self.snapshot_locked(&sessions)
    }

    fn snapshot_locked(&self, sessions: &[Session]) -> Result<ShareInfo, Refusal> {
        let db = self.db.lock();
        Ok(ShareInfo {
            active_users: active_peers(sessions),
            invitations: db.invited_peers(&self.sku).map_err(storage_refusal)?,
            data: IncidentData {
                incidents: db.list_incidents(&self.sku).map_err(storage_refusal)?,
                deleted: db.tombstones(&self.sku).map_err(storage_refusal)?,
            },
            scratchpads: db.scratchpads(&self.sku).map_err(storage_refusal)?,
        })
    }

    // ── Session lifecycle ──────────────────────────────────────────────

    /// Accept a socket. Any prior socket from the same peer is evicted
    /// first, then the joiner (alone) receives the full snapshot.
    pub async fn join(&self, peer: Peer, tx: mpsc::Sender<String>) -> Result<Uuid, Refusal> {
        self.touch();
        let mut sessions = self.state.lock().await;

        // Dedupe by peer id: the newer socket wins.
        sessions.retain(|s| s.peer.id != peer.id);

        let socket_id = Uuid::new_v4();
        sessions.push(Session { socket_id, peer: peer.clone(), tx: tx.clone(), active: true });

        let invitations = self.invited();
        let add = Frame::from_server(FrameBody::ServerUserAdd {
            user: peer,
            active_users: active_peers(&sessions),
            invitations,
        });
        Self::broadcast(&mut sessions, &add, None, true);

        let info = self.snapshot_locked(&sessions)?;
        let frame = Frame::from_server(FrameBody::ServerShareInfo { info });
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = tx.send(text).await;
        }
        Ok(socket_id)
    }

    /// Drop a session on socket close or error.
    pub async fn leave(&self, socket_id: Uuid) {
        self.touch();
        let mut sessions = self.state.lock().await;
        let Some(pos) = sessions.iter().position(|s| s.socket_id == socket_id) else {
            return;
        };
        let session = sessions.remove(pos);
        let remove = Frame::from_server(FrameBody::ServerUserRemove {
            user: session.peer,
            active_users: active_peers(&sessions),
            invitations: self.invited(),
        });
        Self::broadcast(&mut sessions, &remove, None, true);
    }

    /// Close every socket a peer holds (revocation).
    pub async fn evict_peer(&self, peer: &PeerId) {
        let mut sessions = self.state.lock().await;
        let evicted: Vec<Session> = {
            let (gone, kept) = sessions.drain(..).partition(|s| s.peer.id == *peer);
            *sessions = kept;
            gone
        };
        for session in evicted {
            // Dropping the sender ends the writer task, which closes the
            // socket.
            drop(session.tx);
            let remove = Frame::from_server(FrameBody::ServerUserRemove {
                user: session.peer,
                active_users: active_peers(&sessions),
                invitations: self.invited(),
            });
            Self::broadcast(&mut sessions, &remove, None, true);
        }
    }

    /// Close everything; used when the instance is wiped.
    pub async fn close_all(&self) {
        let mut sessions = self.state.lock().await;
        sessions.clear();
    }

    pub async fn active_user_count(&self) -> usize {
        self.state.lock().await.iter().filter(|s| s.active).count()
    }

    fn invited(&self) -> Vec<PeerId> {
        self.db.lock().invited_peers(&self.sku).unwrap_or_default()
    }

    /// Send a frame to every active session except `exclude`. A send that
    /// fails marks the session inactive and, when `cascade` is set, the dead
    /// sessions are removed and their removal broadcasts sent — one level
    /// deep only, no recursive storm.
    fn broadcast(
        sessions: &mut Vec<Session>,
        frame: &Frame,
        exclude: Option<&PeerId>,
        cascade: bool,
    ) {
        Self::send_frame(sessions, frame, exclude);
        if !cascade {
            return;
        }
        let dead: Vec<Session> = {
            let (gone, kept) = sessions.drain(..).partition(|s| !s.active);
            *sessions = kept;
            gone
        };
        for session in dead {
            let remove = Frame::from_server(FrameBody::ServerUserRemove {
                user: session.peer,
                active_users: active_peers(sessions),
                invitations: Vec::new(),
            });
            Self::send_frame(sessions, &remove, None);
        }
    }

    fn send_frame(sessions: &mut [Session], frame: &Frame, exclude: Option<&PeerId>) {
        let Ok(text) = serde_json::to_string(frame) else {
            return;
        };
        for session in sessions.iter_mut() {
            if !session.active {
                continue;
            }
            if exclude.is_some_and(|id| session.peer.id == *id) {
                continue;
            }
            if session.tx.try_send(text.clone()).is_err() {
                tracing::debug!(peer = %session.peer.id, "send failed, marking session inactive");
                session.active = false;
            }
        }
    }
}

fn active_peers(sessions: &[Session]) -> Vec<Peer> {
    sessions.iter().filter(|s| s.active).map(|s| s.peer.clone()).collect()
}
