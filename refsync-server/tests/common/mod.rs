//! Shared harness for integration tests: a real server on an ephemeral
//! port, driven with the SDK.
#![allow(dead_code)] // each test binary uses a different subset

use std::net::SocketAddr;
use std::time::Duration;

use refsync_sdk::connection::Event;
use refsync_sdk::http::ApiClient;
use refsync_sdk::identity::Keypair;
use tokio::sync::mpsc;
use tokio::time::timeout;

use refsync_server::config::ServerConfig;
use refsync_server::server::Server;

pub const SKU: &str = "RE-VRC-25-0001";
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server with in-memory storage on an ephemeral port.
pub async fn start_server() -> SocketAddr {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        db_path: ":memory:".to_string(),
        ..ServerConfig::default()
    };
    let (addr, _handle) = Server::new(config).start().await.unwrap();
    addr
}

pub fn api(addr: SocketAddr, keypair: &Keypair) -> ApiClient {
    ApiClient::new(&format!("http://{addr}"), keypair.clone()).unwrap()
}

/// Create the instance with a fresh admin keypair and return its client.
pub async fn create_instance(addr: SocketAddr) -> (Keypair, ApiClient) {
    let keypair = Keypair::generate();
    let client = api(addr, &keypair);
    client.register_user("admin ref").await.unwrap();
    client.create_instance(SKU).await.unwrap();
    (keypair, client)
}

/// Invite a fresh peer and accept the invitation. Returns their client.
pub async fn admit_peer(addr: SocketAddr, admin: &ApiClient, name: &str) -> (Keypair, ApiClient) {
    let keypair = Keypair::generate();
    let client = api(addr, &keypair);
    client.register_user(name).await.unwrap();
    admin.invite(SKU, &keypair.peer_id(), false).await.unwrap();
    let invitation = client.invitation(SKU).await.unwrap().unwrap();
    client.accept(SKU, &invitation.id).await.unwrap();
    (keypair, client)
}

/// Wait for an event matching the predicate, failing on timeout.
pub async fn wait_for<T>(
    rx: &mut mpsc::Receiver<Event>,
    mut predicate: impl FnMut(&Event) -> Option<T>,
    desc: &str,
) -> T {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => {
                if let Some(out) = predicate(&event) {
                    return out;
                }
            }
            Ok(None) => panic!("event channel closed while waiting for: {desc}"),
            Err(_) => panic!("timeout waiting for: {desc}"),
        }
    }
}
