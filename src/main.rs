//! bulletin-server: accepts bulletin board posts over TCP.
//!
//! Features:
//! - One worker task per connection, reaped as it finishes
//! - Locked appends to the board's content file
//! - Fault modes selected through `BULLETIN_FAULT_MODE`
//! - Configuration via CLI arguments or TOML file

use bulletin_board::{Config, Server};
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
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %config.listen,
        port = config.port,
        board_dir = %config.board_dir.display(),
        board_url = %config.board_url,
        max_request = config.max_request,
        fault = %config.fault,
        "Starting bulletin board server"
    );

    let server = Server::bind(&config)?;
    server.run().await?;
    Ok(())
}
