//! Per-wallet address cache validated by the indexer's status hash.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::electrum::Balance;

/// Hard upper bound on entry age; normally the status hash is the validator
/// and this is only a safety net.
pub const MAX_CACHE_AGE: Duration = Duration::from_secs(5 * 60);

/// Tip-height entries go stale much faster than address data.
const TIP_HEIGHT_CACHE_AGE: Duration = Duration::from_secs(30);

/// Transaction reference in an address history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHistoryItem {
    pub tx_hash: String,
    pub height: i64,
}

/// Cached unspent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: i64,
    pub height: i64,
}

/// Cached data for one address.
#[derive(Debug, Clone)]
pub struct AddressCacheEntry {
    /// None means the address had no transaction history when cached.
    pub status_hash: Option<String>,
    pub balance: Balance,
    pub history: Vec<TxHistoryItem>,
    pub utxos: Vec<CachedUtxo>,
    last_updated: Instant,
}

struct WalletCacheInner {
    addresses: HashMap<String, AddressCacheEntry>,
    tip_height: i64,
    tip_fetched: Option<Instant>,
}

/// All cached data for a single wallet.
pub struct WalletCache {
    inner: RwLock<WalletCacheInner>,
}

impl WalletCache {
    fn new() -> Self {
        Self {
            inner: RwLock::new(WalletCacheInner {
                addresses: HashMap::new(),
                tip_height: 0,
                tip_fetched: None,
            }),
        }
    }

    /// Return the cached entry for an address iff it is younger than
    /// [`MAX_CACHE_AGE`] and its status hash matches the current one
    /// (`None == None` counts as a match: no history on either side).
    pub fn get_address_if_valid(
        &self,
        address: &str,
        current_status: Option<&str>,
    ) -> Option<AddressCacheEntry> {
        self.get_address_if_valid_at(address, current_status, Instant::now())
    }

    fn get_address_if_valid_at(
        &self,
        address: &str,
        current_status: Option<&str>,
        now: Instant,
    ) -> Option<AddressCacheEntry> {
        let inner = self.inner.read().unwrap();
        let entry = inner.addresses.get(address)?;

        if now.duration_since(entry.last_updated) > MAX_CACHE_AGE {
            return None;
        }

        if entry.status_hash.as_deref() != current_status {
            return None;
        }

        Some(entry.clone())
    }

    /// Store fetched data for an address together with the status hash it
    /// was observed under.
    pub fn set_address(
        &self,
        address: &str,
        status: Option<String>,
        balance: Balance,
        history: Vec<TxHistoryItem>,
        utxos: Vec<CachedUtxo>,
    ) {
        self.set_address_at(address, status, balance, history, utxos, Instant::now());
    }

    fn set_address_at(
        &self,
        address: &str,
        status: Option<String>,
        balance: Balance,
        history: Vec<TxHistoryItem>,
        utxos: Vec<CachedUtxo>,
        now: Instant,
    ) {
        let mut inner = self.inner.write().unwrap();
        inner.addresses.insert(
            address.to_string(),
            AddressCacheEntry {
                status_hash: status,
                balance,
                history,
                utxos,
                last_updated: now,
            },
        );
    }

    /// Cached tip height if fetched within the last 30 seconds, 0 otherwise.
    pub fn tip_height(&self) -> i64 {
        let inner = self.inner.read().unwrap();
        match inner.tip_fetched {
            Some(fetched) if fetched.elapsed() < TIP_HEIGHT_CACHE_AGE => inner.tip_height,
            _ => 0,
        }
    }

    pub fn set_tip_height(&self, height: i64) {
        let mut inner = self.inner.write().unwrap();
        inner.tip_height = height;
        inner.tip_fetched = Some(Instant::now());
    }

    pub fn address_count(&self) -> usize {
        self.inner.read().unwrap().addresses.len()
    }
}

/// Process-wide registry of per-wallet caches.
pub struct WalletCacheManager {
    wallets: RwLock<HashMap<String, Arc<WalletCache>>>,
}

impl Default for WalletCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletCacheManager {
    pub fn new() -> Self {
        Self {
            wallets: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the cache for a wallet.
    pub fn wallet_cache(&self, wallet_name: &str) -> Arc<WalletCache> {
        {
            let wallets = self.wallets.read().unwrap();
            if let Some(cache) = wallets.get(wallet_name) {
                return Arc::clone(cache);
            }
        }

        let mut wallets = self.wallets.write().unwrap();
        // Double-check after acquiring the write lock.
        if let Some(cache) = wallets.get(wallet_name) {
            return Arc::clone(cache);
        }

        let cache = Arc::new(WalletCache::new());
        wallets.insert(wallet_name.to_string(), Arc::clone(&cache));
        cache
    }

    /// Discard everything cached for a wallet. Called after every successful
    /// broadcast and on wallet deletion.
    pub fn invalidate_wallet(&self, wallet_name: &str) {
        self.wallets.write().unwrap().remove(wallet_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_fixture(cache: &WalletCache, status: Option<&str>, at: Instant) {
        cache.set_address_at(
            "bc1qexample",
            status.map(|s| s.to_string()),
            Balance {
                confirmed: 1_000,
                unconfirmed: 0,
            },
            vec![TxHistoryItem {
                tx_hash: "aa".repeat(32),
                height: 100,
            }],
            vec![],
            at,
        );
    }

    #[test]
    fn test_status_hash_must_match() {
        let manager = WalletCacheManager::new();
        let cache = manager.wallet_cache("treasury");
        entry_fixture(&cache, Some("abc"), Instant::now());

        assert!(cache.get_address_if_valid("bc1qexample", Some("abc")).is_some());
        assert!(cache.get_address_if_valid("bc1qexample", Some("def")).is_none());
        assert!(cache.get_address_if_valid("bc1qexample", None).is_none());
        assert!(cache.get_address_if_valid("bc1qother", Some("abc")).is_none());
    }

    #[test]
    fn test_null_status_matches_null() {
        let manager = WalletCacheManager::new();
        let cache = manager.wallet_cache("treasury");
        entry_fixture(&cache, None, Instant::now());

        assert!(cache.get_address_if_valid("bc1qexample", None).is_some());
        assert!(cache.get_address_if_valid("bc1qexample", Some("abc")).is_none());
    }

    #[test]
    fn test_entry_expires_after_max_age() {
        let manager = WalletCacheManager::new();
        let cache = manager.wallet_cache("treasury");

        let now = Instant::now();
        entry_fixture(&cache, Some("abc"), now);

        // Status matches, but five minutes of simulated age exceed the cap.
        let later = now + MAX_CACHE_AGE + Duration::from_secs(1);
        assert!(cache
            .get_address_if_valid_at("bc1qexample", Some("abc"), later)
            .is_none());
        assert!(cache
            .get_address_if_valid_at("bc1qexample", Some("abc"), now)
            .is_some());
    }

    #[test]
    fn test_wallet_cache_reuse_and_invalidation() {
        let manager = WalletCacheManager::new();
        let first = manager.wallet_cache("treasury");
        entry_fixture(&first, Some("abc"), Instant::now());

        let second = manager.wallet_cache("treasury");
        assert_eq!(second.address_count(), 1);

        manager.invalidate_wallet("treasury");
        let fresh = manager.wallet_cache("treasury");
        assert_eq!(fresh.address_count(), 0);
    }

    #[test]
    fn test_tip_height_cache() {
        let manager = WalletCacheManager::new();
        let cache = manager.wallet_cache("treasury");

        assert_eq!(cache.tip_height(), 0);
        cache.set_tip_height(845_000);
        assert_eq!(cache.tip_height(), 845_000);
    }
}
