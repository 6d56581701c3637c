//! Storage and persistence layer
//!
//! - Key-value storage abstraction
//! - File system and in-memory backends
//! - Persisted record models

mod file_system;
mod memory;
mod models;

pub use file_system::FileStorage;
pub use memory::MemoryStorage;
pub use models::{AddressType, StoredAddress, WalletRecord, SEED_LENGTH};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

/// Key-value storage consumed by the engine. The host provides the
/// transactional scope; keys are `config`, `wallets/{name}` and
/// `addresses/{name}/{index}`.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// List immediate child suffixes under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Read a JSON-encoded record.
pub fn get_json<S: Storage + ?Sized, T: DeserializeOwned>(
    storage: &S,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get(key)? {
        None => Ok(None),
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|_| StorageError::CorruptRecord(key.to_string()))?;
            Ok(Some(value))
        }
    }
}

/// Write a JSON-encoded record.
pub fn put_json<S: Storage + ?Sized, T: Serialize>(
    storage: &S,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    storage.put(key, &bytes)
}
