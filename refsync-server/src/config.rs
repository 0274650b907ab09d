//! Server configuration.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "refsync-server", about = "Per-event incident log synchronization server")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "REFSYNC_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path. ":memory:" keeps everything in RAM.
    #[arg(long, env = "REFSYNC_DB", default_value = "refsync.db")]
    pub db_path: String,

    /// Accepted clock skew for signed requests, in seconds.
    #[arg(long, env = "REFSYNC_SKEW_SECS", default_value_t = 300)]
    pub skew_secs: i64,

    /// Idle window before an instance's state is wiped, in seconds.
    #[arg(long, env = "REFSYNC_IDLE_SECS", default_value_t = 24 * 60 * 60)]
    pub idle_secs: u64,

    /// Lifetime of short join-request codes, in seconds.
    #[arg(long, env = "REFSYNC_CODE_SECS", default_value_t = 600)]
    pub code_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from::<_, &str>([])
    }
}
