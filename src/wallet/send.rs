//! Sending: fee estimation, coin selection, change handling, broadcast and
//! the spent-flag bookkeeping that follows it.

use serde::Serialize;

use super::utxos::to_spendable;
use crate::backend::Backend;
use crate::bitcoin::address::{detect_script_form, validate_address, ScriptForm};
use crate::bitcoin::transaction::{
    self, build_consolidation_transaction, build_transaction, estimate_fee_for_utxos,
    output_size_for, select_utxos, TxOutputSpec, Utxo, DUST_LIMIT, TX_OVERHEAD,
};
use crate::error::WalletError;
use crate::storage::{AddressType, Storage};

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub to: String,
    /// Ignored when max_send is set.
    pub amount: Option<i64>,
    pub fee_rate: i64,
    pub min_confirmations: Option<u32>,
    pub dry_run: bool,
    pub max_send: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub dry_run: bool,
    pub broadcast: bool,
    pub max_send: bool,
    pub amount: i64,
    pub to: String,
    pub fee_rate: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_fee: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_vsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs_used: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_available: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<S: Storage> Backend<S> {
    /// Send bitcoin from a wallet. State transitions are ordered so a crash
    /// never loses funds: the change record is written before signing, the
    /// index advances before broadcast, and spent flags are set after.
    /// A refused broadcast keeps the already-written state and returns the
    /// hex and local txid for inspection.
    pub async fn send(&self, name: &str, request: SendRequest) -> Result<SendResult, WalletError> {
        let SendRequest {
            to,
            amount,
            fee_rate,
            min_confirmations,
            dry_run,
            max_send,
        } = request;
        let mut amount = amount.unwrap_or(0);

        log::debug!(
            "send request: wallet={} to={} amount={} fee_rate={} dry_run={} max_send={}",
            name,
            to,
            amount,
            fee_rate,
            dry_run,
            max_send
        );

        if !max_send {
            if amount <= 0 {
                return Err(WalletError::InvalidInput(
                    "amount must be positive (or use max_send=true)".to_string(),
                ));
            }
            if amount < DUST_LIMIT {
                return Err(WalletError::DustOutput {
                    value: amount,
                    limit: DUST_LIMIT,
                });
            }
        }

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

        validate_address(&to, network)?;

        let mut session = self.indexer_session().await?;
        let utxo_infos = self
            .utxos_for_wallet(&mut session, name, min_confirmations)
            .await?;
        if utxo_infos.is_empty() {
            return Err(WalletError::NoUtxos);
        }

        let utxos = to_spendable(&utxo_infos, wallet.address_type, network);
        let total_available: i64 = utxos.iter().map(|u| u.value).sum();

        let destination_type = match detect_script_form(&to, network)? {
            ScriptForm::P2tr => AddressType::P2tr,
            _ => AddressType::P2wpkh,
        };

        let selected: Vec<Utxo>;
        if max_send {
            // Spend everything to a single output, no change.
            selected = utxos;

            let estimated_fee =
                estimate_fee_for_utxos(&selected, 1, fee_rate, Some(destination_type));
            amount = total_available - estimated_fee;

            if amount <= 0 {
                return Err(WalletError::InsufficientFunds {
                    available: total_available,
                    needed: 0,
                    fee: estimated_fee,
                });
            }
            if amount < DUST_LIMIT {
                return Err(WalletError::DustOutput {
                    value: amount,
                    limit: DUST_LIMIT,
                });
            }
        } else {
            let (selection, _fee) = select_utxos(&utxos, amount, fee_rate)?;
            selected = selection;
        }

        // Fee preview using the actual input types and the real output mix.
        let input_vsize: i64 = selected.iter().map(Utxo::input_vsize).sum();
        let mut output_vsize = output_size_for(destination_type);
        if !max_send {
            output_vsize += output_size_for(wallet.address_type);
        }
        let estimated_vsize = TX_OVERHEAD + input_vsize + output_vsize;
        let estimated_fee = estimated_vsize * fee_rate;

        if dry_run {
            let change_amount = if max_send {
                0
            } else {
                let total_selected: i64 = selected.iter().map(|u| u.value).sum();
                total_selected - amount - estimated_fee
            };

            log::debug!(
                "send dry run: wallet={} amount={} fee={}",
                name,
                amount,
                estimated_fee
            );
            return Ok(SendResult {
                dry_run: true,
                broadcast: false,
                max_send,
                amount,
                to,
                fee_rate,
                txid: None,
                fee: None,
                estimated_fee: Some(estimated_fee),
                estimated_vsize: Some(estimated_vsize),
                inputs_used: Some(selected.len()),
                total_available: Some(total_available),
                change_amount: Some(change_amount),
                change_address: None,
                hex: None,
                error: None,
            });
        }

        // Persist the change address (and the advanced index) before any
        // signing or network effect; a failed broadcast reuses it later.
        let change_address = if max_send {
            None
        } else {
            Some(self.allocate_change_address(&mut wallet, network)?.address)
        };

        let tx_result = if max_send {
            build_consolidation_transaction(&wallet.seed, network, &selected, &to, fee_rate)?
        } else {
            build_transaction(
                &wallet.seed,
                network,
                &selected,
                &[TxOutputSpec {
                    address: to.clone(),
                    value: amount,
                }],
                change_address.as_deref().unwrap_or_default(),
                fee_rate,
            )?
        };

        match session.client.broadcast_transaction(&tx_result.hex).await {
            Err(e) => {
                log::warn!(
                    "broadcast failed: wallet={} txid={} error={}",
                    name,
                    tx_result.txid,
                    e
                );
                Ok(SendResult {
                    dry_run: false,
                    broadcast: false,
                    max_send,
                    amount,
                    to,
                    fee_rate,
                    txid: Some(tx_result.txid),
                    fee: Some(tx_result.fee),
                    estimated_fee: None,
                    estimated_vsize: None,
                    inputs_used: None,
                    total_available: None,
                    change_amount: change_address.as_ref().map(|_| tx_result.change_amount),
                    change_address,
                    hex: Some(tx_result.hex),
                    error: Some(e.to_string()),
                })
            }
            Ok(txid) => {
                // UTXO set changed; every cached entry is stale.
                self.cache().invalidate_wallet(name);

                let spent_indices: Vec<u32> =
                    selected.iter().map(|utxo| utxo.address_index).collect();
                if let Err(e) = self.mark_addresses_spent(name, &spent_indices) {
                    log::warn!(
                        "failed to mark addresses as spent: wallet={} error={}",
                        name,
                        e
                    );
                }

                log::info!(
                    "transaction broadcast: wallet={} txid={} amount={} to={} fee={} max_send={}",
                    name,
                    txid,
                    amount,
                    to,
                    tx_result.fee,
                    max_send
                );

                Ok(SendResult {
                    dry_run: false,
                    broadcast: true,
                    max_send,
                    amount,
                    to,
                    fee_rate,
                    txid: Some(txid),
                    fee: Some(tx_result.fee),
                    estimated_fee: None,
                    estimated_vsize: None,
                    inputs_used: Some(selected.len()),
                    total_available: None,
                    change_amount: change_address.as_ref().map(|_| tx_result.change_amount),
                    change_address,
                    hex: None,
                    error: None,
                })
            }
        }
    }
}
