//! Shared test fixtures: in-memory storage plus a scripted mock indexer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::Transaction;

use btc_wallet::backend::{Backend, IndexerDialer};
use btc_wallet::electrum::{Balance, HistoryItem, Indexer, UnspentOutput};
use btc_wallet::error::WalletError;
use btc_wallet::storage::MemoryStorage;

/// Indexer serving scripted per-scripthash state. Unknown scripthashes look
/// like fresh addresses: zero balance, no history, no status.
#[derive(Default)]
pub struct MockIndexer {
    pub balances: Mutex<HashMap<String, Balance>>,
    pub utxos: Mutex<HashMap<String, Vec<UnspentOutput>>>,
    pub histories: Mutex<HashMap<String, Vec<HistoryItem>>>,
    pub statuses: Mutex<HashMap<String, String>>,
    pub tip: AtomicI64,
    pub broadcasts: Mutex<Vec<String>>,
    pub fail_broadcast: AtomicBool,
    pub fail_all: AtomicBool,
}

impl MockIndexer {
    pub fn new(tip: i64) -> Arc<Self> {
        let mock = Self::default();
        mock.tip.store(tip, Ordering::Relaxed);
        Arc::new(mock)
    }

    /// Script an address as funded: one confirmed UTXO plus matching
    /// balance, history and status hash.
    pub fn fund(&self, scripthash: &str, value: i64, height: i64, txid_byte: u8) {
        let txid: String = std::iter::repeat(format!("{:02x}", txid_byte))
            .take(32)
            .collect();

        self.balances.lock().unwrap().insert(
            scripthash.to_string(),
            Balance {
                confirmed: value,
                unconfirmed: 0,
            },
        );
        self.utxos
            .lock()
            .unwrap()
            .entry(scripthash.to_string())
            .or_default()
            .push(UnspentOutput {
                tx_hash: txid.clone(),
                tx_pos: 0,
                height,
                value,
            });
        self.histories
            .lock()
            .unwrap()
            .entry(scripthash.to_string())
            .or_default()
            .push(HistoryItem {
                tx_hash: txid,
                height,
                fee: None,
            });
        self.statuses
            .lock()
            .unwrap()
            .insert(scripthash.to_string(), format!("status-{:02x}", txid_byte));
    }

    /// Script history without balance (a used, emptied address).
    pub fn mark_used(&self, scripthash: &str) {
        self.histories
            .lock()
            .unwrap()
            .entry(scripthash.to_string())
            .or_default()
            .push(HistoryItem {
                tx_hash: "cc".repeat(32),
                height: 10,
                fee: None,
            });
        self.statuses
            .lock()
            .unwrap()
            .insert(scripthash.to_string(), "status-used".to_string());
    }

    fn check_up(&self) -> Result<(), WalletError> {
        if self.fail_all.load(Ordering::Relaxed) {
            return Err(WalletError::Network("broken pipe".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Indexer for MockIndexer {
    async fn get_balance(&self, scripthash: &str) -> Result<Balance, WalletError> {
        self.check_up()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(scripthash)
            .copied()
            .unwrap_or_default())
    }

    async fn list_unspent(&self, scripthash: &str) -> Result<Vec<UnspentOutput>, WalletError> {
        self.check_up()?;
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(scripthash)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryItem>, WalletError> {
        self.check_up()?;
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(scripthash)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(&self, scripthash: &str) -> Result<Option<String>, WalletError> {
        self.check_up()?;
        Ok(self.statuses.lock().unwrap().get(scripthash).cloned())
    }

    async fn get_transaction(&self, _txid: &str) -> Result<String, WalletError> {
        self.check_up()?;
        Err(WalletError::Protocol("not scripted".to_string()))
    }

    async fn broadcast_transaction(&self, raw_tx: &str) -> Result<String, WalletError> {
        self.check_up()?;
        if self.fail_broadcast.load(Ordering::Relaxed) {
            return Err(WalletError::Protocol(
                "electrum error 1: txn-mempool-conflict".to_string(),
            ));
        }

        let tx: Transaction = deserialize_hex(raw_tx)
            .map_err(|e| WalletError::Protocol(format!("unparseable transaction: {}", e)))?;
        self.broadcasts.lock().unwrap().push(raw_tx.to_string());
        Ok(tx.compute_txid().to_string())
    }

    async fn estimate_fee(&self, _blocks: u32) -> Result<f64, WalletError> {
        self.check_up()?;
        Ok(0.0001)
    }

    async fn block_header(&self, _height: i64) -> Result<String, WalletError> {
        self.check_up()?;
        Err(WalletError::Protocol("not scripted".to_string()))
    }

    async fn tip_height(&self) -> Result<i64, WalletError> {
        self.check_up()?;
        Ok(self.tip.load(Ordering::Relaxed))
    }

    async fn ping(&self) -> Result<(), WalletError> {
        self.check_up()
    }

    fn close(&self) {}
}

/// Dialer handing out a fixed sequence of mock indexers, so reconnection
/// behaviour is observable.
pub struct MockDialer {
    indexers: Mutex<Vec<Arc<MockIndexer>>>,
    pub dial_count: AtomicUsize,
}

impl MockDialer {
    pub fn single(indexer: Arc<MockIndexer>) -> Arc<Self> {
        Arc::new(Self {
            indexers: Mutex::new(vec![indexer]),
            dial_count: AtomicUsize::new(0),
        })
    }

    pub fn sequence(indexers: Vec<Arc<MockIndexer>>) -> Arc<Self> {
        Arc::new(Self {
            indexers: Mutex::new(indexers),
            dial_count: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IndexerDialer for MockDialer {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn Indexer>, WalletError> {
        self.dial_count.fetch_add(1, Ordering::Relaxed);
        let mut indexers = self.indexers.lock().unwrap();
        let indexer = if indexers.len() > 1 {
            indexers.remove(0)
        } else {
            Arc::clone(&indexers[0])
        };
        Ok(indexer)
    }
}

pub fn test_backend(indexer: Arc<MockIndexer>) -> Backend<MemoryStorage> {
    Backend::new(MemoryStorage::new(), MockDialer::single(indexer))
}
