//! UTXO consolidation: many inputs, one fresh output.

use serde::Serialize;

use super::compact::CompactionResult;
use super::utxos::to_spendable;
use crate::backend::Backend;
use crate::bitcoin::transaction::{
    self, build_consolidation_transaction, estimate_fee_for_utxos, output_size_for, Utxo,
    DUST_LIMIT, TX_OVERHEAD,
};
use crate::error::WalletError;
use crate::storage::Storage;

const PRIVACY_WARNING: &str =
    "Consolidation links all input addresses together, revealing common ownership";

#[derive(Debug, Clone)]
pub struct ConsolidateRequest {
    pub fee_rate: i64,
    pub min_confirmations: Option<u32>,
    /// Only consolidate UTXOs below this value; 0 consolidates everything.
    pub below_value: i64,
    pub dry_run: bool,
    /// Run compaction after a successful broadcast.
    pub compact: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateResult {
    pub dry_run: bool,
    pub broadcast: bool,
    pub inputs_consolidated: usize,
    pub total_input: i64,
    pub fee_rate: i64,
    pub output_value: i64,
    pub output_address: String,
    pub privacy_warning: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_fee: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_vsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact_addresses_deleted: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact_new_first_active: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compact_error: Option<String>,
}

impl<S: Storage> Backend<S> {
    pub async fn consolidate(
        &self,
        name: &str,
        request: ConsolidateRequest,
    ) -> Result<ConsolidateResult, WalletError> {
        let ConsolidateRequest {
            fee_rate,
            min_confirmations,
            below_value,
            dry_run,
            compact,
        } = request;

        log::debug!(
            "consolidate request: wallet={} fee_rate={} below_value={} dry_run={} compact={}",
            name,
            fee_rate,
            below_value,
            dry_run,
            compact
        );

        if fee_rate <= 0 {
            return Err(WalletError::InvalidInput(
                "fee_rate must be positive".to_string(),
            ));
        }
        transaction::validate_fee_rate(fee_rate)?;

        let mut wallet = self.require_wallet(name)?;
        let network = self.network()?;

        let min_confirmations = match min_confirmations {
            Some(n) => n,
            None => self.min_confirmations()?,
        };

        let mut session = self.indexer_session().await?;
        let utxo_infos = self
            .utxos_for_wallet(&mut session, name, min_confirmations)
            .await?;
        if utxo_infos.is_empty() {
            return Err(WalletError::NoUtxos);
        }

        let selected_infos: Vec<_> = if below_value > 0 {
            let filtered: Vec<_> = utxo_infos
                .iter()
                .filter(|u| u.value < below_value)
                .cloned()
                .collect();
            log::debug!(
                "filtered UTXOs by value threshold: below_value={} selected={} total={}",
                below_value,
                filtered.len(),
                utxo_infos.len()
            );
            filtered
        } else {
            utxo_infos
        };

        if selected_infos.len() < 2 {
            return Err(WalletError::InvalidInput(if below_value > 0 {
                format!(
                    "only {} UTXO(s) below {} satoshis - need at least 2 to consolidate",
                    selected_infos.len(),
                    below_value
                )
            } else {
                format!(
                    "only {} UTXO(s) available - need at least 2 to consolidate",
                    selected_infos.len()
                )
            }));
        }

        log::warn!(
            "PRIVACY: consolidation links all input addresses together: wallet={} utxos_to_consolidate={}",
            name,
            selected_infos.len()
        );

        let utxos = to_spendable(&selected_infos, wallet.address_type, network);
        let total_input: i64 = utxos.iter().map(|u| u.value).sum();

        let estimated_fee =
            estimate_fee_for_utxos(&utxos, 1, fee_rate, Some(wallet.address_type));
        let input_vsize: i64 = utxos.iter().map(Utxo::input_vsize).sum();
        let estimated_vsize = TX_OVERHEAD + input_vsize + output_size_for(wallet.address_type);

        let output_value = total_input - estimated_fee;
        if output_value <= 0 {
            return Err(WalletError::InsufficientFunds {
                available: total_input,
                needed: 0,
                fee: estimated_fee,
            });
        }
        if output_value < DUST_LIMIT {
            return Err(WalletError::DustOutput {
                value: output_value,
                limit: DUST_LIMIT,
            });
        }

        if dry_run {
            // Preview only: derive the would-be destination without storing
            // a record or advancing the index.
            let destination = crate::bitcoin::address::address_from_seed(
                &wallet.seed,
                network,
                wallet.next_address_index,
                wallet.address_type,
            )?;

            log::debug!(
                "consolidate dry run complete: wallet={} inputs={} output_value={}",
                name,
                utxos.len(),
                output_value
            );
            return Ok(ConsolidateResult {
                dry_run: true,
                broadcast: false,
                inputs_consolidated: utxos.len(),
                total_input,
                fee_rate,
                output_value,
                output_address: destination,
                privacy_warning: PRIVACY_WARNING,
                estimated_fee: Some(estimated_fee),
                estimated_vsize: Some(estimated_vsize),
                fee: None,
                txid: None,
                hex: None,
                error: None,
                compact_addresses_deleted: None,
                compact_new_first_active: None,
                compact_error: None,
            });
        }

        let destination = self.register_external_address(&mut wallet, network)?.address;

        let tx_result =
            build_consolidation_transaction(&wallet.seed, network, &utxos, &destination, fee_rate)?;

        let txid = match session.client.broadcast_transaction(&tx_result.hex).await {
            Err(e) => {
                log::warn!("consolidation broadcast failed: wallet={} error={}", name, e);
                return Ok(ConsolidateResult {
                    dry_run: false,
                    broadcast: false,
                    inputs_consolidated: utxos.len(),
                    total_input,
                    fee_rate,
                    output_value,
                    output_address: destination,
                    privacy_warning: PRIVACY_WARNING,
                    estimated_fee: None,
                    estimated_vsize: None,
                    fee: Some(tx_result.fee),
                    txid: Some(tx_result.txid),
                    hex: Some(tx_result.hex),
                    error: Some(e.to_string()),
                    compact_addresses_deleted: None,
                    compact_new_first_active: None,
                    compact_error: None,
                });
            }
            Ok(txid) => txid,
        };

        self.cache().invalidate_wallet(name);

        let spent_indices: Vec<u32> = utxos.iter().map(|u| u.address_index).collect();
        if let Err(e) = self.mark_addresses_spent(name, &spent_indices) {
            // Non-fatal: the transaction is already on the network.
            log::warn!(
                "failed to mark addresses as spent: wallet={} error={}",
                name,
                e
            );
        }

        log::info!(
            "consolidation broadcast successful: wallet={} txid={} inputs_consolidated={} total_input={} fee={} output_value={}",
            name,
            txid,
            utxos.len(),
            total_input,
            tx_result.fee,
            output_value
        );

        let mut result = ConsolidateResult {
            dry_run: false,
            broadcast: true,
            inputs_consolidated: utxos.len(),
            total_input,
            fee_rate,
            output_value,
            output_address: destination,
            privacy_warning: PRIVACY_WARNING,
            estimated_fee: None,
            estimated_vsize: None,
            fee: Some(tx_result.fee),
            txid: Some(txid),
            hex: None,
            error: None,
            compact_addresses_deleted: None,
            compact_new_first_active: None,
            compact_error: None,
        };

        if compact {
            match self.run_compaction(&mut session, name).await {
                Ok(CompactionResult {
                    addresses_deleted,
                    new_first_active,
                    ..
                }) => {
                    log::info!(
                        "compaction after consolidation successful: wallet={} addresses_deleted={}",
                        name,
                        addresses_deleted
                    );
                    result.compact_addresses_deleted = Some(addresses_deleted);
                    result.compact_new_first_active = Some(new_first_active);
                }
                Err(e) => {
                    log::warn!(
                        "compaction after consolidation failed: wallet={} error={}",
                        name,
                        e
                    );
                    result.compact_error = Some(e.to_string());
                }
            }
        }

        Ok(result)
    }
}
