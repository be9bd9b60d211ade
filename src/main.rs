//! Chat relay - Entry Point
//!
//! Loads the optional config file, starts the server and runs it until
//! Ctrl-C.

use std::env;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_relay::{ChatServer, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // First argument, if any, is a TOML config file
    let config = match env::args().nth(1) {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };

    // RUST_LOG wins over the configured filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    let server = ChatServer::bind(config).await?;
    info!("Registry and listener ready on {}", server.local_addr()?);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    Ok(())
}
