use std::collections::BTreeMap;
use std::sync::Mutex;

use super::Storage;
use crate::error::StorageError;

/// In-memory storage for tests.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.lock().unwrap();
        let suffixes = entries
            .keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .filter(|suffix| !suffix.is_empty() && !suffix.contains('/'))
            .map(|suffix| suffix.to_string())
            .collect();
        Ok(suffixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_immediate_children_only() {
        let storage = MemoryStorage::new();
        storage.put("wallets/alpha", b"a").unwrap();
        storage.put("wallets/beta", b"b").unwrap();
        storage.put("addresses/alpha/0", b"c").unwrap();

        assert_eq!(storage.list("wallets/").unwrap(), vec!["alpha", "beta"]);
        assert_eq!(storage.list("addresses/alpha/").unwrap(), vec!["0"]);
        assert!(storage.list("addresses/").unwrap().is_empty());
    }
}
