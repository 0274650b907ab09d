//! The share connection: a singleton socket to the event instance.
//!
//! Modeled as a state machine (`Closed → Connecting → Open → Closing →
//! Closed`); nothing reaches inside — all access goes through commands.
//! A drop from any cause other than an explicit disconnect schedules a flat
//! 5 s reconnect; a permanent refusal at the handshake (revoked invitation,
//! bad signature) stops the loop and surfaces to the consumer. Pings go out
//! every 30 s and two missed pongs force a close.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval, sleep_until};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::{Error, Result};
use crate::http::ApiClient;
use crate::identity::Peer;
use crate::protocol::{Frame, FrameBody, ShareInfo};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const MAX_MISSED_PONGS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
}

/// What the consumer observes. Snapshots (from joins and force-syncs) and
/// peer frames arrive here; the consumer owns reconciliation.
#[derive(Debug)]
pub enum Event {
    State(ConnectionState),
    Snapshot(ShareInfo),
    Frame(Frame),
    /// The server refused the handshake permanently; reconnection stopped.
    Forbidden,
    Error(String),
}

#[derive(Debug)]
enum Command {
    Send(FrameBody),
    ForceSync,
    Disconnect,
}

enum SessionEnd {
    /// Explicit disconnect; do not reconnect.
    Disconnected,
    /// The socket dropped; reconnect after the delay.
    Dropped,
}

/// Handle to the connection driver task.
pub struct ShareConnection {
    cmd_tx: mpsc::Sender<Command>,
    state: Arc<Mutex<ConnectionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ShareConnection {
    /// Open a connection for `sku` and start the reconnect loop.
    pub fn connect(api: ApiClient, sku: String, peer: Peer) -> (Self, mpsc::Receiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let state = Arc::new(Mutex::new(ConnectionState::Closed));

        let driver = Driver { api, sku, peer, state: state.clone(), event_tx };
        let task = tokio::spawn(driver.run(cmd_rx));

        (Self { cmd_tx, state, task: Mutex::new(Some(task)) }, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Best-effort frame send; never rolls back local state on failure.
    pub async fn send(&self, body: FrameBody) -> Result<()> {
        self.cmd_tx
            .send(Command::Send(body))
            .await
            .map_err(|_| Error::Transport("connection driver stopped".into()))
    }

    /// Fetch a full snapshot out-of-band and feed it through the same event
    /// stream as a join. Recovery hatch for a socket that looks stale.
    pub async fn force_sync(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::ForceSync)
            .await
            .map_err(|_| Error::Transport("connection driver stopped".into()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
    }
}

struct Driver {
    api: ApiClient,
    sku: String,
    peer: Peer,
    state: Arc<Mutex<ConnectionState>>,
    event_tx: mpsc::Sender<Event>,
}

impl Driver {
    async fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
        let _ = self.event_tx.send(Event::State(next)).await;
    }

    async fn run(self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            self.set_state(ConnectionState::Connecting).await;
            match self.session(&mut cmd_rx).await {
                Ok(SessionEnd::Disconnected) => break,
                Ok(SessionEnd::Dropped) => {
                    tracing::info!(sku = %self.sku, "socket dropped, reconnecting in 5s");
                }
                Err(Error::Forbidden) | Err(Error::BadSignature) => {
                    // Permanent refusal — revoked invitation or rejected
                    // handshake. Stop reconnecting and tell the consumer.
                    let _ = self.event_tx.send(Event::Forbidden).await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(sku = %self.sku, error = %e, "socket error, reconnecting in 5s");
                    let _ = self.event_tx.send(Event::Error(e.to_string())).await;
                }
            }
            self.set_state(ConnectionState::Closed).await;

            // Flat reconnect delay; an explicit disconnect cancels it.
            // Force-syncs still work while closed — the snapshot comes over
            // HTTP, no socket required.
            let deadline = Instant::now() + RECONNECT_DELAY;
            let mut disconnected = false;
            loop {
                select! {
                    _ = sleep_until(deadline) => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Disconnect) | None => {
                            disconnected = true;
                            break;
                        }
                        Some(Command::ForceSync) => {
                            if self.force_sync_now().await.is_err() {
                                let _ = self.event_tx.send(Event::Forbidden).await;
                                disconnected = true;
                                break;
                            }
                        }
                        // Sends issued while closed are dropped; the queue
                        // and join reconcile cover them.
                        Some(Command::Send(_)) => {}
                    }
                }
            }
            if disconnected {
                break;
            }
        }
        self.set_state(ConnectionState::Closed).await;
    }

    /// Fetch a snapshot over HTTP and feed it to the consumer. Usable with
    /// or without a live socket. Only a permanent refusal is an error.
    async fn force_sync_now(&self) -> Result<()> {
        match self.api.snapshot(&self.sku).await {
            Ok(info) => {
                let _ = self.event_tx.send(Event::Snapshot(info)).await;
                Ok(())
            }
            Err(Error::Forbidden) => Err(Error::Forbidden),
            Err(e) => {
                let _ = self.event_tx.send(Event::Error(e.to_string())).await;
                Ok(())
            }
        }
    }

    /// One socket session, from handshake to close.
    async fn session(&self, cmd_rx: &mut mpsc::Receiver<Command>) -> Result<SessionEnd> {
        let url = self.api.join_url(&self.sku, &self.peer.name)?;
        let (stream, _) = connect_async(url.as_str()).await.map_err(map_connect_error)?;
        let (mut sink, mut stream) = stream.split();

        self.set_state(ConnectionState::Open).await;
        tracing::debug!(sku = %self.sku, "socket open");

        let mut ping = interval(PING_INTERVAL);
        ping.tick().await; // immediate first tick
        let mut missed_pongs: u8 = 0;

        loop {
            select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(body)) => {
                        let frame = Frame::from_client(body, &self.peer);
                        let text = serde_json::to_string(&frame)?;
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return Ok(SessionEnd::Dropped);
                        }
                    }
                    Some(Command::ForceSync) => {
                        self.force_sync_now().await?;
                    }
                    Some(Command::Disconnect) | None => {
                        self.set_state(ConnectionState::Closing).await;
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Disconnected);
                    }
                },
                _ = ping.tick() => {
                    if missed_pongs >= MAX_MISSED_PONGS {
                        tracing::info!(sku = %self.sku, "two missed pongs, forcing close");
                        return Ok(SessionEnd::Dropped);
                    }
                    missed_pongs += 1;
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Ok(SessionEnd::Dropped);
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => {
                                let event = match frame {
                                    Frame {
                                        body: FrameBody::ServerShareInfo { info }, ..
                                    } => Event::Snapshot(info),
                                    other => Event::Frame(other),
                                };
                                let _ = self.event_tx.send(event).await;
                            }
                            Err(e) => {
                                // Malformed frames are dropped, not fatal.
                                tracing::warn!(sku = %self.sku, error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return Ok(SessionEnd::Dropped);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(sku = %self.sku, error = %e, "socket read error");
                        return Ok(SessionEnd::Dropped);
                    }
                },
            }
        }
    }
}

/// A non-101 handshake response with a 4xx status is a permanent refusal.
fn map_connect_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::Http(response) if response.status().is_client_error() => {
            match response.status().as_u16() {
                401 => Error::BadSignature,
                _ => Error::Forbidden,
            }
        }
        other => Error::Transport(other.to_string()),
    }
}
