//! The outbound-sync driver: one object per (device, event) tying the local
//! replica, the share connection, and the signed HTTP path together.
//!
//! Every mutation commits locally first and is acknowledged synchronously;
//! the network side is best-effort. With the socket open, frames go out on
//! it; otherwise they land in the outbound queue and drain over signed HTTP
//! with backoff. Snapshots from joins and force-syncs run the three-way map
//! reconciliation and push whatever the server still lacks. The UI never
//! blocks on the server.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::{ConnectionState, Event, ShareConnection};
use crate::consistency::Envelope;
use crate::error::{Error, Result};
use crate::http::ApiClient;
use crate::protocol::FrameBody;
use crate::records::{Incident, IncidentPatch, Scratchpad};
use crate::replica::Replica;
use crate::storage::KvStore;

/// What the embedding app observes.
#[derive(Debug)]
pub enum SyncEvent {
    Connection(ConnectionState),
    /// Ids whose local state changed under remote influence (refresh the
    /// list view).
    Refreshed(Vec<String>),
    /// Admission to the event was revoked; the queue is stopped.
    MembershipLost,
    /// A non-fatal condition worth a toast ("incident was deleted", repeated
    /// send failures).
    Notice(String),
}

pub struct SyncClient<S: KvStore + 'static> {
    replica: Arc<Replica<S>>,
    api: ApiClient,
    sku: String,
    conn: Arc<ShareConnection>,
}

impl<S: KvStore + 'static> SyncClient<S> {
    /// Connect the socket and start the event pump.
    pub fn start(
        replica: Arc<Replica<S>>,
        api: ApiClient,
        sku: String,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (conn, conn_events) = ShareConnection::connect(api.clone(), sku.clone(), replica.peer());
        let conn = Arc::new(conn);
        let (event_tx, event_rx) = mpsc::channel(256);

        let pump = Pump {
            replica: replica.clone(),
            api: api.clone(),
            sku: sku.clone(),
            conn: conn.clone(),
            event_tx,
        };
        tokio::spawn(pump.run(conn_events));

        (Self { replica, api, sku, conn }, event_rx)
    }

    pub fn replica(&self) -> &Replica<S> {
        &self.replica
    }

    pub fn connection(&self) -> &ShareConnection {
        &self.conn
    }

    // ── Mutation API ───────────────────────────────────────────────────

    /// Record an incident: committed locally, then pushed or queued.
    pub async fn add(&self, incident: Incident) -> Result<Envelope<Incident>> {
        let (envelope, frame) = self.replica.add(incident)?;
        self.dispatch(frame).await?;
        Ok(envelope)
    }

    /// Apply a partial edit locally, then push or queue it.
    pub async fn edit(&self, id: &str, patch: &IncidentPatch) -> Result<()> {
        if let Some((_, frame)) = self.replica.edit(&self.sku, id, patch)? {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    /// Tombstone an incident locally, then push or queue the removal.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let frame = self.replica.delete(&self.sku, id)?;
        self.dispatch(frame).await
    }

    pub async fn update_scratchpad(&self, scratchpad: Scratchpad) -> Result<()> {
        if let Some((_, frame)) = self.replica.update_scratchpad(&self.sku, scratchpad)? {
            self.dispatch(frame).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    /// Socket if open, queue otherwise. Socket send is best-effort: a frame
    /// handed to a connection that drops mid-flight is repaired by the next
    /// join reconciliation, not rolled back.
    async fn dispatch(&self, frame: FrameBody) -> Result<()> {
        if self.conn.is_open() && self.conn.send(frame.clone()).await.is_ok() {
            return Ok(());
        }
        self.replica.enqueue(&self.sku, frame)?;
        Ok(())
    }

    /// Drain the outbound queue over signed HTTP. Stops on `forbidden`;
    /// leaves transient failures queued for the next pass. A stale write is
    /// treated as success and followed by a force-sync to reconcile.
    pub async fn flush_queue(&self) -> Result<()> {
        if flush_queue(&self.replica, &self.api, &self.sku, None).await? {
            let _ = self.conn.force_sync().await;
        }
        Ok(())
    }
}

/// Shared by [`SyncClient::flush_queue`] and the pump. Returns whether a
/// stale write was dropped, in which case the caller must force-sync.
async fn flush_queue<S: KvStore>(
    replica: &Replica<S>,
    api: &ApiClient,
    sku: &str,
    notices: Option<&mpsc::Sender<SyncEvent>>,
) -> Result<bool> {
    let notify = |msg: String| async move {
        if let Some(tx) = notices {
            let _ = tx.send(SyncEvent::Notice(msg)).await;
        }
    };

    let mut needs_sync = false;
    for op in replica.queue(sku)? {
        let outcome = match &op.frame {
            FrameBody::AddIncident { incident } => api.put_incident(sku, incident).await,
            FrameBody::UpdateIncident { incident } => api.patch_incident(sku, incident).await,
            FrameBody::RemoveIncident { id } => api.delete_incident(sku, id).await,
            // Scratchpads have no HTTP endpoint; they ride the socket and
            // the join reconciliation.
            _ => {
                replica.dequeue(sku, op.id)?;
                continue;
            }
        };
        match outcome {
            Ok(()) => replica.dequeue(sku, op.id)?,
            // Stale is success from the client's point of view, but the
            // server holds something newer: reconcile with a force-sync.
            Err(Error::Stale) => {
                replica.dequeue(sku, op.id)?;
                needs_sync = true;
            }
            Err(Error::Tombstoned) => {
                replica.dequeue(sku, op.id)?;
                notify("incident was deleted".to_string()).await;
            }
            Err(Error::Forbidden) => return Err(Error::Forbidden),
            Err(e) if e.is_retryable() => {
                // Leave it queued; the next reconnect retries.
                tracing::debug!(sku, error = %e, "queued op still failing");
                return Ok(needs_sync);
            }
            Err(e) => {
                // Malformed and friends: non-retryable, drop it.
                tracing::warn!(sku, error = %e, "dropping undeliverable queued op");
                replica.dequeue(sku, op.id)?;
            }
        }
    }
    Ok(needs_sync)
}

struct Pump<S: KvStore> {
    replica: Arc<Replica<S>>,
    api: ApiClient,
    sku: String,
    conn: Arc<ShareConnection>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl<S: KvStore + 'static> Pump<S> {
    async fn run(self, mut conn_events: mpsc::Receiver<Event>) {
        while let Some(event) = conn_events.recv().await {
            match event {
                Event::State(state) => {
                    let _ = self.event_tx.send(SyncEvent::Connection(state)).await;
                }
                Event::Snapshot(info) => {
                    match self.replica.reconcile(&self.sku, &info) {
                        Ok(rec) => {
                            for frame in rec.pushes {
                                let _ = self.conn.send(frame).await;
                            }
                            let mut refreshed = rec.applied;
                            refreshed.extend(rec.expunged);
                            if !refreshed.is_empty() {
                                let _ =
                                    self.event_tx.send(SyncEvent::Refreshed(refreshed)).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(sku = %self.sku, error = %e, "reconciliation failed");
                        }
                    }
                    // The socket is live again: drain anything recorded
                    // while offline.
                    match flush_queue(&self.replica, &self.api, &self.sku, Some(&self.event_tx))
                        .await
                    {
                        Ok(needs_sync) => {
                            // A dropped stale write means the server holds
                            // newer state; pull it in.
                            if needs_sync {
                                let _ = self.conn.force_sync().await;
                            }
                        }
                        Err(Error::Forbidden) => {
                            let _ = self.event_tx.send(SyncEvent::MembershipLost).await;
                        }
                        Err(e) => {
                            tracing::warn!(sku = %self.sku, error = %e, "queue flush failed");
                        }
                    }
                }
                Event::Frame(frame) => {
                    match self.replica.apply_remote(&self.sku, &frame.body) {
                        Ok(Some(id)) => {
                            let _ = self.event_tx.send(SyncEvent::Refreshed(vec![id])).await;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(sku = %self.sku, error = %e, "could not apply frame");
                        }
                    }
                }
                Event::Forbidden => {
                    let _ = self.event_tx.send(SyncEvent::MembershipLost).await;
                    return;
                }
                Event::Error(message) => {
                    let _ = self.event_tx.send(SyncEvent::Notice(message)).await;
                }
            }
        }
    }
}
