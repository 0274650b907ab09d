//! Shared server state and the listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::instance::Instance;
use crate::membership::RequestCode;
use crate::web;

/// Token bucket for per-session rate limiting: 10 requests/second with a
/// burst of 20.
struct TokenBucket {
    tokens: f64,
    last: Instant,
}

const RATE_MAX: f64 = 20.0;
const RATE_REFILL: f64 = 10.0;

impl TokenBucket {
    fn new() -> Self {
        Self { tokens: RATE_MAX, last: Instant::now() }
    }

    fn take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * RATE_REFILL).min(RATE_MAX);
        self.last = now;
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

pub struct SharedState {
    pub config: ServerConfig,
    db: Arc<Mutex<Db>>,
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    /// Live join codes; owned here, managed by the membership module.
    pub(crate) codes: Mutex<HashMap<String, RequestCode>>,
    rate: Mutex<HashMap<Uuid, TokenBucket>>,
}

impl SharedState {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let db = if config.db_path == ":memory:" {
            Db::open_memory()
        } else {
            Db::open(&config.db_path)
        }
        .context("opening database")?;
        Ok(Arc::new(Self {
            config,
            db: Arc::new(Mutex::new(db)),
            instances: Mutex::new(HashMap::new()),
            codes: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
        }))
    }

    pub fn with_db<R>(&self, f: impl FnOnce(&Db) -> R) -> R {
        f(&self.db.lock())
    }

    /// The live actor for a sku, reviving it from persisted state after a
    /// restart. None when the instance has never been created (or was
    /// evicted).
    pub fn instance(self: &Arc<Self>, sku: &str) -> Option<Arc<Instance>> {
        if let Some(instance) = self.instances.lock().get(sku) {
            return Some(instance.clone());
        }
        let persisted = self.with_db(|db| db.instance_secret(sku)).ok().flatten().is_some();
        persisted.then(|| self.ensure_instance(sku))
    }

    /// Create (or fetch) the actor for a sku and arm its idle alarm.
    pub fn ensure_instance(self: &Arc<Self>, sku: &str) -> Arc<Instance> {
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.get(sku) {
            return instance.clone();
        }
        let instance = Arc::new(Instance::new(sku.to_string(), self.db.clone()));
        instances.insert(sku.to_string(), instance.clone());
        drop(instances);
        self.spawn_idle_watcher(instance.clone());
        instance
    }

    /// Idle alarm: when the instance sees no activity for the configured
    /// window, all of its state is wiped.
    fn spawn_idle_watcher(self: &Arc<Self>, instance: Arc<Instance>) {
        let state = self.clone();
        let idle = Duration::from_secs(self.config.idle_secs);
        tokio::spawn(async move {
            loop {
                let deadline = instance.last_activity() + idle;
                if Instant::now() >= deadline {
                    let sku = instance.sku.clone();
                    tracing::info!(sku, "idle alarm fired, wiping instance");
                    if let Err(e) = state.with_db(|db| db.wipe_instance(&sku)) {
                        tracing::error!(sku, error = %e, "wipe failed");
                    }
                    instance.close_all().await;
                    state.instances.lock().remove(&sku);
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        });
    }

    // ── Rate limiting ──────────────────────────────────────────────────

    /// Requests without a session header are not rate limited — the header
    /// is advisory and carries no authority either way.
    pub fn check_rate(&self, session: Option<Uuid>) -> bool {
        let Some(session) = session else { return true };
        self.rate.lock().entry(session).or_insert_with(TokenBucket::new).take()
    }
}

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind the listener and serve in a background task. Returns the bound
    /// address, used by tests that bind port 0.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listen = self.config.listen_addr.clone();
        let state = SharedState::new(self.config)?;
        let app = web::router(state);

        let listener =
            tokio::net::TcpListener::bind(&listen).await.context("binding listener")?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "server exited");
            }
        });
        Ok((addr, handle))
    }

    pub async fn run(self) -> Result<()> {
        let (addr, handle) = self.start().await?;
        tracing::info!(%addr, "listening");
        handle.await.context("server task")?;
        Ok(())
    }
}
