use std::path::PathBuf;
use std::sync::Arc;

use btc_wallet::api::{server, AppState};
use btc_wallet::backend::{Backend, ElectrumDialer};
use btc_wallet::storage::FileStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set RUST_LOG=debug for verbose output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // The TLS stack needs a process-wide crypto provider before the first
    // indexer connection.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let data_dir = std::env::var("WALLET_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());

    let storage = FileStorage::new(PathBuf::from(&data_dir));
    let backend = Backend::new(storage, Arc::new(ElectrumDialer));
    let state = Arc::new(AppState::new(backend));

    log::info!("starting Bitcoin wallet service: data_dir={}", data_dir);
    server::start_server(&addr, state).await?;
    Ok(())
}
