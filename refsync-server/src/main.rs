use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (REFSYNC_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("REFSYNC_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("refsync_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = refsync_server::config::ServerConfig::parse();
    tracing::info!("Starting sync server on {}", config.listen_addr);
    tracing::info!(
        db = %config.db_path,
        skew_secs = config.skew_secs,
        idle_secs = config.idle_secs,
        "configuration loaded"
    );

    let server = refsync_server::server::Server::new(config);
    server.run().await
}
