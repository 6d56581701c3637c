//! HTTP hosting layer: axum routes over the engine operations.

pub mod handlers;
pub mod server;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backend::Backend;
use crate::storage::FileStorage;

/// Shared server state: the engine plus per-wallet serialization locks.
pub struct AppState {
    pub backend: Backend<FileStorage>,
    wallet_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(backend: Backend<FileStorage>) -> Self {
        Self {
            backend,
            wallet_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock serializing lifecycle operations for one wallet. Lookups and
    /// signing do not take it; anything that writes records does.
    pub async fn wallet_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.wallet_locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}
