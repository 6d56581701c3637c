//! Indexer client: Electrum-protocol JSON-RPC over TLS or TCP.

mod client;

pub use client::ElectrumClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// Balance response for a scripthash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

/// Unspent output as reported by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
    pub value: i64,
}

/// Transaction history item for a scripthash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    pub height: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
}

/// The indexer operations the engine consumes. `ElectrumClient` is the
/// production implementation; tests substitute scripted mocks.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// blockchain.scripthash.get_balance
    async fn get_balance(&self, scripthash: &str) -> Result<Balance, WalletError>;

    /// blockchain.scripthash.listunspent
    async fn list_unspent(&self, scripthash: &str) -> Result<Vec<UnspentOutput>, WalletError>;

    /// blockchain.scripthash.get_history
    async fn get_history(&self, scripthash: &str) -> Result<Vec<HistoryItem>, WalletError>;

    /// blockchain.scripthash.subscribe; None when the address has no history.
    async fn subscribe(&self, scripthash: &str) -> Result<Option<String>, WalletError>;

    /// blockchain.transaction.get
    async fn get_transaction(&self, txid: &str) -> Result<String, WalletError>;

    /// blockchain.transaction.broadcast; returns the txid accepted by the
    /// server.
    async fn broadcast_transaction(&self, raw_tx: &str) -> Result<String, WalletError>;

    /// blockchain.estimatefee; BTC per kilobyte.
    async fn estimate_fee(&self, blocks: u32) -> Result<f64, WalletError>;

    /// blockchain.block.header
    async fn block_header(&self, height: i64) -> Result<String, WalletError>;

    /// Current chain tip height via blockchain.headers.subscribe.
    async fn tip_height(&self) -> Result<i64, WalletError>;

    /// server.ping
    async fn ping(&self) -> Result<(), WalletError>;

    /// Tear down the connection; outstanding requests fail.
    fn close(&self);
}
