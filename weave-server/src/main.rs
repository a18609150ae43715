//! Room server binary.
//!
//! Usage: `weave-server [config.toml]`. Without an argument the path in
//! `WEAVE_CONFIG` is used, and without that the built-in defaults.
//! Log output is controlled by `RUST_LOG`.

use std::path::PathBuf;

use log::info;
use weave_collab::config::{ServerConfig, ENV_CONFIG};
use weave_collab::CollabServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ENV_CONFIG).ok().filter(|v| !v.is_empty()))
        .map(PathBuf::from);

    let mut config = match &config_path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            ServerConfig::load(path)?
        }
        None => ServerConfig::default(),
    };
    config.apply_env();

    info!("Starting Weave room server on {}...", config.bind_addr);
    let server = CollabServer::new(config)?;
    server.run().await?;
    Ok(())
}
