//! PSBT operations: assemble unsigned packets, sign with wallet keys,
//! finalize and broadcast.

use std::collections::HashMap;

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use serde::{Deserialize, Serialize};

use super::utxos::to_spendable;
use crate::backend::Backend;
use crate::bitcoin::address::{script_pubkey, validate_address};
use crate::bitcoin::psbt::{
    decode_psbt, encode_psbt, extract_transaction, finalize_psbt, sign_psbt, SigningWallet,
};
use crate::bitcoin::keys;
use crate::bitcoin::transaction::{
    self, estimate_fee_for_types, output_size_for, select_utxos, DUST_LIMIT, SEQUENCE_FINAL,
};
use crate::error::WalletError;
use crate::storage::Storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsbtOutput {
    pub address: String,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct PsbtCreateRequest {
    pub outputs: Vec<PsbtOutput>,
    pub fee_rate: i64,
    pub min_confirmations: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PsbtCreateResult {
    pub psbt: String,
    pub fee: i64,
    pub inputs_count: usize,
    pub total_input: i64,
    pub total_output: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_amount: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PsbtSignResult {
    pub psbt: String,
    pub inputs_total: usize,
    pub inputs_signed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PsbtFinalizeResult {
    pub txid: String,
    pub hex: String,
    pub broadcast: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<S: Storage> Backend<S> {
    /// Assemble an unsigned PSBT spending this wallet's UTXOs into the given
    /// outputs, with change above dust returned to a fresh internal address.
    pub async fn create_psbt(
        &self,
        name: &str,
        request: PsbtCreateRequest,
    ) -> Result<PsbtCreateResult, WalletError> {
        let PsbtCreateRequest {
            outputs,
            fee_rate,
            min_confirmations,
        } = request;

        log::debug!("PSBT create request: wallet={} fee_rate={}", name, fee_rate);

        if fee_rate <= 0 {
            return Err(WalletError::InvalidInput(
                "fee_rate must be positive".to_string(),
            ));
        }
        transaction::validate_fee_rate(fee_rate)?;

        if outputs.is_empty() {
            return Err(WalletError::InvalidInput(
                "at least one output is required".to_string(),
            ));
        }

        let mut wallet = self.require_wallet(name)?;
        let network = self.network()?;

        let mut total_output: i64 = 0;
        for (i, out) in outputs.iter().enumerate() {
            if out.amount <= 0 {
                return Err(WalletError::InvalidInput(format!(
                    "output {}: amount must be positive",
                    i
                )));
            }
            if out.amount < DUST_LIMIT {
                return Err(WalletError::InvalidInput(format!(
                    "output {}: amount {} is below dust limit {}",
                    i, out.amount, DUST_LIMIT
                )));
            }
            validate_address(&out.address, network)
                .map_err(|e| WalletError::InvalidInput(format!("output {}: {}", i, e)))?;
            total_output += out.amount;
        }

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

        let utxos = to_spendable(&utxo_infos, wallet.address_type, network);
        let (selected, _) = select_utxos(&utxos, total_output, fee_rate)?;
        let total_selected: i64 = selected.iter().map(|u| u.value).sum();

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: selected
                .iter()
                .map(|utxo| {
                    let txid = utxo.txid.parse().map_err(|e| {
                        WalletError::InvalidInput(format!("invalid txid {}: {}", utxo.txid, e))
                    })?;
                    Ok(TxIn {
                        previous_output: OutPoint {
                            txid,
                            vout: utxo.vout,
                        },
                        script_sig: ScriptBuf::new(),
                        sequence: Sequence::from_consensus(SEQUENCE_FINAL),
                        witness: Witness::new(),
                    })
                })
                .collect::<Result<Vec<_>, WalletError>>()?,
            output: Vec::new(),
        };

        for out in &outputs {
            tx.output.push(TxOut {
                value: Amount::from_sat(out.amount as u64),
                script_pubkey: script_pubkey(&out.address, network)?,
            });
        }

        // Fee estimate reserves room for a potential change output.
        let output_size = output_size_for(wallet.address_type);
        let estimated_fee = estimate_fee_for_types(
            selected.len(),
            outputs.len(),
            fee_rate,
            Some(wallet.address_type),
            Some(wallet.address_type),
        ) + output_size * fee_rate;
        let mut change_amount = total_selected - total_output - estimated_fee;

        let mut change_address = None;
        if change_amount > DUST_LIMIT {
            let info = self.allocate_change_address(&mut wallet, network)?;

            tx.output.push(TxOut {
                value: Amount::from_sat(change_amount as u64),
                script_pubkey: script_pubkey(&info.address, network)?,
            });
            change_address = Some(info.address);
        } else {
            // Sub-dust change is absorbed into the fee.
            change_amount = 0;
        }

        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| WalletError::InvalidInput(format!("failed to create PSBT: {}", e)))?;

        for (i, utxo) in selected.iter().enumerate() {
            psbt.inputs[i].witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value as u64),
                script_pubkey: utxo.script_pub_key.clone(),
            });

            // Advertise the signing pubkey so other participants can route
            // the packet back to us.
            let Ok(key) = keys::derive_receiving_key(
                &wallet.seed,
                network,
                utxo.address_index,
                wallet.address_type,
            ) else {
                continue;
            };
            let pubkey = key
                .private_key
                .public_key(&bitcoin::secp256k1::Secp256k1::new());
            psbt.inputs[i]
                .bip32_derivation
                .insert(pubkey, (Fingerprint::default(), DerivationPath::master()));
        }

        Ok(PsbtCreateResult {
            psbt: encode_psbt(&psbt),
            fee: estimated_fee,
            inputs_count: selected.len(),
            total_input: total_selected,
            total_output,
            change_amount: change_address.as_ref().map(|_| change_amount),
            change_address,
        })
    }

    /// Sign a PSBT with this wallet's keys (§ strategies: address match,
    /// BIP32 derivation, witness-script scan).
    pub async fn sign_wallet_psbt(
        &self,
        name: &str,
        psbt_base64: &str,
    ) -> Result<PsbtSignResult, WalletError> {
        log::debug!("PSBT sign request: wallet={}", name);

        let wallet = self.require_wallet(name)?;
        let network = self.network()?;

        let mut psbt = decode_psbt(psbt_base64)?;

        let addresses = self.stored_addresses(name)?;
        let address_index: HashMap<String, u32> = addresses
            .into_iter()
            .map(|a| (a.address, a.index))
            .collect();

        let signer = SigningWallet {
            seed: &wallet.seed,
            network,
            address_type: wallet.address_type,
            next_address_index: wallet.next_address_index,
        };

        let inputs_total = psbt.inputs.len();
        let inputs_signed = sign_psbt(&mut psbt, &signer, &address_index);

        Ok(PsbtSignResult {
            psbt: encode_psbt(&psbt),
            inputs_total,
            inputs_signed,
        })
    }

    /// Finalize a signed PSBT and optionally broadcast the extracted
    /// transaction.
    pub async fn finalize_wallet_psbt(
        &self,
        name: &str,
        psbt_base64: &str,
        broadcast: bool,
    ) -> Result<PsbtFinalizeResult, WalletError> {
        log::debug!("PSBT finalize request: wallet={} broadcast={}", name, broadcast);

        self.require_wallet(name)?;

        let mut psbt = decode_psbt(psbt_base64)?;
        finalize_psbt(&mut psbt)?;

        let final_tx = extract_transaction(psbt);
        let hex = serialize_hex(&final_tx);
        let txid = final_tx.compute_txid().to_string();

        let mut result = PsbtFinalizeResult {
            txid: txid.clone(),
            hex: hex.clone(),
            broadcast: false,
            broadcast_txid: None,
            error: None,
        };

        if !broadcast {
            log::debug!("PSBT finalized without broadcast: wallet={} txid={}", name, txid);
            return Ok(result);
        }

        let client = match self.get_client().await {
            Ok(client) => client,
            Err(e) => {
                log::warn!(
                    "PSBT finalize: failed to connect for broadcast: wallet={} error={}",
                    name,
                    e
                );
                result.error = Some(format!("failed to connect: {}", e));
                return Ok(result);
            }
        };

        match client.broadcast_transaction(&hex).await {
            Err(e) => {
                log::warn!(
                    "PSBT finalize: broadcast failed: wallet={} txid={} error={}",
                    name,
                    txid,
                    e
                );
                result.error = Some(e.to_string());
                Ok(result)
            }
            Ok(broadcast_txid) => {
                // UTXOs changed under this wallet.
                self.cache().invalidate_wallet(name);
                log::info!(
                    "PSBT finalize: transaction broadcast: wallet={} txid={}",
                    name,
                    broadcast_txid
                );
                result.broadcast = true;
                result.broadcast_txid = Some(broadcast_txid);
                Ok(result)
            }
        }
    }
}
