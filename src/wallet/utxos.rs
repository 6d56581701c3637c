//! UTXO listing with confirmation math.

use serde::Serialize;

use crate::backend::{Backend, IndexerSession};
use crate::bitcoin::address::script_pubkey;
use crate::bitcoin::transaction::Utxo;
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::{AddressType, Storage};

/// Attach scriptPubKeys for transaction building. Entries whose address no
/// longer decodes are skipped.
pub(crate) fn to_spendable(
    infos: &[UtxoInfo],
    address_type: AddressType,
    network: Network,
) -> Vec<Utxo> {
    infos
        .iter()
        .filter_map(|info| {
            let script = match script_pubkey(&info.address, network) {
                Ok(script) => script,
                Err(e) => {
                    log::warn!(
                        "failed to get scriptPubKey: address={} error={}",
                        info.address,
                        e
                    );
                    return None;
                }
            };
            Some(Utxo {
                txid: info.txid.clone(),
                vout: info.vout,
                value: info.value,
                address: info.address.clone(),
                address_index: info.address_index,
                script_pub_key: script,
                address_type: Some(address_type),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct UtxoInfo {
    pub txid: String,
    pub vout: u32,
    pub value: i64,
    pub address: String,
    pub address_index: u32,
    pub scripthash: String,
    pub height: i64,
    pub confirmations: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UtxoListing {
    pub utxos: Vec<UtxoInfo>,
    pub utxo_count: usize,
    pub total_value: i64,
}

impl<S: Storage> Backend<S> {
    /// Spendable outputs across every stored address, filtered by minimum
    /// confirmations. Height 0 means mempool; otherwise confirmations are
    /// `max(0, tip - height + 1)`, or 1 when the tip is unknown.
    pub(crate) async fn utxos_for_wallet(
        &self,
        session: &mut IndexerSession,
        wallet_name: &str,
        min_confirmations: u32,
    ) -> Result<Vec<UtxoInfo>, WalletError> {
        log::debug!(
            "fetching UTXOs: wallet={} min_confirmations={}",
            wallet_name,
            min_confirmations
        );

        self.require_wallet(wallet_name)?;
        let addresses = self.stored_addresses(wallet_name)?;
        let wallet_cache = self.cache().wallet_cache(wallet_name);

        let tip_height = self.current_tip_height(session, &wallet_cache).await;

        let mut all_utxos = Vec::new();
        for addr in &addresses {
            let snapshot = self.address_snapshot(session, &wallet_cache, addr).await;

            for utxo in snapshot.utxos {
                let confirmations = if utxo.height > 0 {
                    if tip_height > 0 {
                        (tip_height - utxo.height + 1).max(0)
                    } else {
                        // In a block, but the tip is unknown.
                        1
                    }
                } else {
                    0
                };

                if confirmations < min_confirmations as i64 {
                    continue;
                }

                all_utxos.push(UtxoInfo {
                    txid: utxo.txid,
                    vout: utxo.vout,
                    value: utxo.value,
                    address: addr.address.clone(),
                    address_index: addr.index,
                    scripthash: addr.scripthash.clone(),
                    height: utxo.height,
                    confirmations,
                });
            }
        }

        log::debug!(
            "UTXOs fetched: wallet={} utxo_count={}",
            wallet_name,
            all_utxos.len()
        );
        Ok(all_utxos)
    }

    /// List UTXOs for the API, largest first.
    pub async fn list_utxos(
        &self,
        wallet_name: &str,
        min_confirmations: Option<u32>,
    ) -> Result<UtxoListing, WalletError> {
        let mut session = self.indexer_session().await?;
        let mut utxos = self
            .utxos_for_wallet(&mut session, wallet_name, min_confirmations.unwrap_or(0))
            .await?;

        utxos.sort_by(|a, b| b.value.cmp(&a.value));
        let total_value = utxos.iter().map(|u| u.value).sum();

        Ok(UtxoListing {
            utxo_count: utxos.len(),
            total_value,
            utxos,
        })
    }
}
