//! The wallet engine value: storage handle, cache manager and the shared
//! indexer client slot with reconnect-once semantics.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::{CachedUtxo, TxHistoryItem, WalletCache, WalletCacheManager};
use crate::config::{random_server, EngineConfig, Network, CONFIG_STORAGE_KEY};
use crate::electrum::{Balance, ElectrumClient, Indexer};
use crate::error::WalletError;
use crate::storage::{self, Storage, StoredAddress};

/// Dials a new indexer connection. Production uses [`ElectrumDialer`];
/// tests inject scripted indexers.
#[async_trait]
pub trait IndexerDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Indexer>, WalletError>;
}

pub struct ElectrumDialer;

#[async_trait]
impl IndexerDialer for ElectrumDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Indexer>, WalletError> {
        let client = ElectrumClient::connect(url).await?;
        Ok(client)
    }
}

/// The engine. One per process; safe to call from many requests at once.
pub struct Backend<S: Storage> {
    storage: S,
    cache: WalletCacheManager,
    client: RwLock<Option<Arc<dyn Indexer>>>,
    dialer: Arc<dyn IndexerDialer>,
}

/// Tracks the single reconnect attempt allowed within one multi-address
/// operation.
pub struct IndexerSession {
    pub client: Arc<dyn Indexer>,
    reconnect_attempted: bool,
}

/// Point-in-time view of one address, served from cache when the status
/// hash still matches.
#[derive(Debug, Clone, Default)]
pub struct AddressSnapshot {
    pub balance: Balance,
    pub history: Vec<TxHistoryItem>,
    pub utxos: Vec<CachedUtxo>,
}

/// Message patterns that identify a broken connection worth one
/// redial-and-retry.
fn is_connection_error(err: &WalletError) -> bool {
    const PATTERNS: &[&str] = &[
        "broken pipe",
        "connection reset",
        "connection refused",
        "eof",
        "use of closed network connection",
        "i/o timeout",
    ];
    let message = err.to_string().to_lowercase();
    PATTERNS.iter().any(|pattern| message.contains(pattern))
}

impl<S: Storage> Backend<S> {
    pub fn new(storage: S, dialer: Arc<dyn IndexerDialer>) -> Self {
        Self {
            storage,
            cache: WalletCacheManager::new(),
            client: RwLock::new(None),
            dialer,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn cache(&self) -> &WalletCacheManager {
        &self.cache
    }

    // ----- configuration -----

    pub fn get_config(&self) -> Result<Option<EngineConfig>, WalletError> {
        Ok(storage::get_json(&self.storage, CONFIG_STORAGE_KEY)?)
    }

    pub fn put_config(&self, config: &EngineConfig) -> Result<(), WalletError> {
        Ok(storage::put_json(&self.storage, CONFIG_STORAGE_KEY, config)?)
    }

    pub fn delete_config(&self) -> Result<(), WalletError> {
        Ok(self.storage.delete(CONFIG_STORAGE_KEY)?)
    }

    /// Configured network, defaulting to mainnet.
    pub fn network(&self) -> Result<Network, WalletError> {
        Ok(self
            .get_config()?
            .map(|c| c.network)
            .unwrap_or(Network::Mainnet))
    }

    /// Configured minimum confirmations, defaulting to 1.
    pub fn min_confirmations(&self) -> Result<u32, WalletError> {
        let configured = self.get_config()?.map(|c| c.min_confirmations).unwrap_or(1);
        Ok(if configured == 0 { 1 } else { configured })
    }

    // ----- shared indexer client -----

    /// Fetch the shared client, dialing one under the exclusive lock if no
    /// connection exists yet.
    pub async fn get_client(&self) -> Result<Arc<dyn Indexer>, WalletError> {
        {
            let slot = self.client.read().await;
            if let Some(client) = slot.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let mut slot = self.client.write().await;
        // Double-check after acquiring the write lock.
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let config = self.get_config()?;
        let network = config
            .as_ref()
            .map(|c| c.network)
            .unwrap_or(Network::Mainnet);

        let server_url = match config.as_ref().and_then(|c| c.electrum_url.clone()) {
            Some(url) => url,
            None => random_server(network)
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    WalletError::Network(format!(
                        "no default Electrum servers configured for network {} - please set electrum_url in config",
                        network
                    ))
                })?,
        };

        log::debug!("connecting to Electrum server: url={} network={}", server_url, network);
        let client = self.dialer.dial(&server_url).await.inspect_err(|e| {
            log::warn!("failed to connect to Electrum server: url={} error={}", server_url, e);
        })?;

        log::info!("connected to Electrum server: url={} network={}", server_url, network);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the shared client. The next caller dials a fresh connection
    /// (possibly a different pool member).
    pub async fn reset(&self) {
        let mut slot = self.client.write().await;
        if let Some(client) = slot.take() {
            log::debug!("closing Electrum connection");
            client.close();
        }
    }

    /// Reset the client if the error looks like a broken connection.
    /// Returns true when the caller should retry with a fresh client.
    pub async fn handle_client_error(&self, err: &WalletError) -> bool {
        if is_connection_error(err) {
            log::warn!("detected stale connection, resetting client: error={}", err);
            self.reset().await;
            return true;
        }
        false
    }

    /// Begin a multi-address operation against the indexer. A session
    /// permits exactly one reconnect-and-retry.
    pub async fn indexer_session(&self) -> Result<IndexerSession, WalletError> {
        Ok(IndexerSession {
            client: self.get_client().await?,
            reconnect_attempted: false,
        })
    }

    /// Redial once after a connection fault, if this session has not used
    /// its retry yet. Returns the fresh client to retry against.
    async fn fresh_client_after(
        &self,
        session: &mut IndexerSession,
        err: &WalletError,
    ) -> Option<Arc<dyn Indexer>> {
        if session.reconnect_attempted || !self.handle_client_error(err).await {
            return None;
        }
        session.reconnect_attempted = true;
        match self.get_client().await {
            Ok(client) => {
                session.client = Arc::clone(&client);
                Some(client)
            }
            Err(e) => {
                log::warn!("reconnect failed: error={}", e);
                None
            }
        }
    }

    pub async fn subscribe_with_retry(
        &self,
        session: &mut IndexerSession,
        scripthash: &str,
    ) -> Result<Option<String>, WalletError> {
        match session.client.subscribe(scripthash).await {
            Ok(status) => Ok(status),
            Err(err) => match self.fresh_client_after(session, &err).await {
                Some(client) => client.subscribe(scripthash).await,
                None => Err(err),
            },
        }
    }

    pub async fn balance_with_retry(
        &self,
        session: &mut IndexerSession,
        scripthash: &str,
    ) -> Result<Balance, WalletError> {
        match session.client.get_balance(scripthash).await {
            Ok(balance) => Ok(balance),
            Err(err) => match self.fresh_client_after(session, &err).await {
                Some(client) => client.get_balance(scripthash).await,
                None => Err(err),
            },
        }
    }

    pub async fn unspent_with_retry(
        &self,
        session: &mut IndexerSession,
        scripthash: &str,
    ) -> Result<Vec<crate::electrum::UnspentOutput>, WalletError> {
        match session.client.list_unspent(scripthash).await {
            Ok(utxos) => Ok(utxos),
            Err(err) => match self.fresh_client_after(session, &err).await {
                Some(client) => client.list_unspent(scripthash).await,
                None => Err(err),
            },
        }
    }

    pub async fn tip_with_retry(&self, session: &mut IndexerSession) -> Result<i64, WalletError> {
        match session.client.tip_height().await {
            Ok(height) => Ok(height),
            Err(err) => match self.fresh_client_after(session, &err).await {
                Some(client) => client.tip_height().await,
                None => Err(err),
            },
        }
    }

    // ----- read-through address data -----

    /// Balance, history and UTXOs for one address. The subscribe call gets
    /// the current status hash; on a valid cache hit no further indexer
    /// calls are made. The cache is only written when subscribe succeeded,
    /// since a failed subscribe is indistinguishable from "no history".
    pub async fn address_snapshot(
        &self,
        session: &mut IndexerSession,
        cache: &WalletCache,
        addr: &StoredAddress,
    ) -> AddressSnapshot {
        let status = self.subscribe_with_retry(session, &addr.scripthash).await;
        let subscribe_ok = status.is_ok();
        if let Err(ref e) = status {
            log::warn!("failed to get status: address={} error={}", addr.address, e);
        }
        let current_status = status.ok().flatten();

        if subscribe_ok {
            if let Some(entry) = cache.get_address_if_valid(&addr.address, current_status.as_deref())
            {
                log::debug!("cache hit (status match): address={}", addr.address);
                return AddressSnapshot {
                    balance: entry.balance,
                    history: entry.history,
                    utxos: entry.utxos,
                };
            }
        }

        log::debug!("cache miss, fetching from indexer: address={}", addr.address);

        let balance = match self.balance_with_retry(session, &addr.scripthash).await {
            Ok(balance) => balance,
            Err(e) => {
                log::warn!("failed to get balance: address={} error={}", addr.address, e);
                Balance::default()
            }
        };

        let history = match session.client.get_history(&addr.scripthash).await {
            Ok(items) => items
                .into_iter()
                .map(|h| TxHistoryItem {
                    tx_hash: h.tx_hash,
                    height: h.height,
                })
                .collect(),
            Err(e) => {
                log::warn!("failed to get history: address={} error={}", addr.address, e);
                Vec::new()
            }
        };

        let utxos = match self.unspent_with_retry(session, &addr.scripthash).await {
            Ok(unspent) => unspent
                .into_iter()
                .map(|u| CachedUtxo {
                    txid: u.tx_hash,
                    vout: u.tx_pos,
                    value: u.value,
                    height: u.height,
                })
                .collect(),
            Err(e) => {
                log::warn!("failed to list unspent: address={} error={}", addr.address, e);
                Vec::new()
            }
        };

        if subscribe_ok {
            cache.set_address(
                &addr.address,
                current_status,
                balance,
                history.clone(),
                utxos.clone(),
            );
        }

        AddressSnapshot {
            balance,
            history,
            utxos,
        }
    }

    /// Current chain tip, via the 30-second cache.
    pub async fn current_tip_height(
        &self,
        session: &mut IndexerSession,
        cache: &WalletCache,
    ) -> i64 {
        let cached = cache.tip_height();
        if cached > 0 {
            return cached;
        }

        match self.tip_with_retry(session).await {
            Ok(height) if height > 0 => {
                cache.set_tip_height(height);
                height
            }
            Ok(_) => 0,
            Err(e) => {
                log::warn!("failed to get block height: error={}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let faults = [
            "broken pipe",
            "connection reset by peer",
            "connection refused",
            "unexpected EOF",
            "use of closed network connection",
            "read tcp: i/o timeout",
        ];
        for fault in faults {
            assert!(
                is_connection_error(&WalletError::Network(fault.to_string())),
                "{} should classify as connection fault",
                fault
            );
        }

        assert!(!is_connection_error(&WalletError::Network(
            "request timeout".to_string()
        )));
        assert!(!is_connection_error(&WalletError::Protocol(
            "electrum error 2: daemon error".to_string()
        )));
        assert!(!is_connection_error(&WalletError::WalletNotFound(
            "treasury".to_string()
        )));
    }
}
