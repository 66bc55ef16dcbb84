//! relay-server: a multi-user TCP message relay
//!
//! Clients log in under a username over a persistent connection and send
//! directed text messages to other usernames. Messages addressed to a
//! recipient who is offline are buffered in a bounded per-user queue.
//!
//! Features:
//! - Length-prefixed binary protocol with strict malformed-input detection
//! - One async task per connection over a shared session store
//! - Per-recipient bounded message queues with sender backpressure
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        "Starting relay server"
    );

    Server::new(config).run().await
}
