//! Transaction assembly: coin selection, fee estimation, output composition
//! and witness signing for ECDSA (BIP143) and Schnorr key-path (BIP341)
//! inputs.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::key::{Keypair, TapTweak};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use super::{address, keys};
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::AddressType;

/// Minimum output value in satoshis.
pub const DUST_LIMIT: i64 = 546;

/// Default fee rate in satoshis per vbyte.
pub const DEFAULT_FEE_RATE: i64 = 10;

/// Virtual size of a P2WPKH input in vbytes (witness discounted).
pub const P2WPKH_INPUT_SIZE: i64 = 68;

/// Size of a P2WPKH output in bytes.
pub const P2WPKH_OUTPUT_SIZE: i64 = 31;

/// Virtual size of a P2TR key-path input in vbytes.
/// Witness is a single 64-byte Schnorr signature plus the count byte.
pub const P2TR_INPUT_SIZE: i64 = 58;

/// Size of a P2TR output in bytes: 8 value + 1 length + 34 script.
pub const P2TR_OUTPUT_SIZE: i64 = 43;

/// Base transaction overhead in vbytes.
pub const TX_OVERHEAD: i64 = 10;

/// Fee rates above this are rejected outright; even peak congestion rarely
/// exceeds half of it.
pub const MAX_REASONABLE_FEE_RATE: i64 = 1000;

/// Sequence value signalling opt-in Replace-By-Fee (BIP125).
pub const SEQUENCE_RBF: u32 = 0xFFFF_FFFD;

/// Final sequence value (no RBF).
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Unspent output ready for transaction building.
#[derive(Debug, Clone)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: i64,
    pub address: String,
    pub address_index: u32,
    pub script_pub_key: ScriptBuf,
    /// None defaults to P2WPKH (records written before taproot support
    /// carry no type).
    pub address_type: Option<AddressType>,
}

impl Utxo {
    pub fn effective_type(&self) -> AddressType {
        self.address_type.unwrap_or(AddressType::P2wpkh)
    }

    pub fn input_vsize(&self) -> i64 {
        match self.effective_type() {
            AddressType::P2wpkh => P2WPKH_INPUT_SIZE,
            AddressType::P2tr => P2TR_INPUT_SIZE,
        }
    }
}

/// Requested transaction output.
#[derive(Debug, Clone)]
pub struct TxOutputSpec {
    pub address: String,
    pub value: i64,
}

/// Result of building a signed transaction.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub txid: String,
    pub hex: String,
    pub fee: i64,
    pub total_input: i64,
    pub total_output: i64,
    pub change_amount: i64,
    pub size: usize,
    pub vsize: usize,
}

/// Reject fee rates above the safety limit. Callers surface this pre-flight
/// instead of clamping.
pub fn validate_fee_rate(fee_rate: i64) -> Result<(), WalletError> {
    if fee_rate > MAX_REASONABLE_FEE_RATE {
        return Err(WalletError::InvalidInput(format!(
            "fee_rate {} sat/vB exceeds safety limit of {} sat/vB - this would be extremely expensive",
            fee_rate, MAX_REASONABLE_FEE_RATE
        )));
    }
    Ok(())
}

pub fn output_size_for(address_type: AddressType) -> i64 {
    match address_type {
        AddressType::P2wpkh => P2WPKH_OUTPUT_SIZE,
        AddressType::P2tr => P2TR_OUTPUT_SIZE,
    }
}

fn input_size_for(address_type: Option<AddressType>) -> i64 {
    match address_type.unwrap_or(AddressType::P2wpkh) {
        AddressType::P2wpkh => P2WPKH_INPUT_SIZE,
        AddressType::P2tr => P2TR_INPUT_SIZE,
    }
}

/// Estimate the fee for a transaction with uniform input and output types.
pub fn estimate_fee_for_types(
    num_inputs: usize,
    num_outputs: usize,
    fee_rate: i64,
    input_type: Option<AddressType>,
    output_type: Option<AddressType>,
) -> i64 {
    let input_size = input_size_for(input_type);
    let output_size = output_size_for(output_type.unwrap_or(AddressType::P2wpkh));
    let vsize = TX_OVERHEAD + num_inputs as i64 * input_size + num_outputs as i64 * output_size;
    vsize * fee_rate
}

/// Estimate the fee using the actual type of every input UTXO.
pub fn estimate_fee_for_utxos(
    utxos: &[Utxo],
    num_outputs: usize,
    fee_rate: i64,
    output_type: Option<AddressType>,
) -> i64 {
    let input_vsize: i64 = utxos.iter().map(Utxo::input_vsize).sum();
    let output_size = output_size_for(output_type.unwrap_or(AddressType::P2wpkh));
    let vsize = TX_OVERHEAD + input_vsize + num_outputs as i64 * output_size;
    vsize * fee_rate
}

/// Select UTXOs to cover the target amount plus fee, largest first.
/// The fee is recomputed after each addition with the actual types of the
/// selected inputs and two assumed outputs (payment + change).
/// Returns the selection and the final fee estimate.
pub fn select_utxos(
    utxos: &[Utxo],
    target_amount: i64,
    fee_rate: i64,
) -> Result<(Vec<Utxo>, i64), WalletError> {
    if utxos.is_empty() {
        return Err(WalletError::NoUtxos);
    }

    let mut sorted = utxos.to_vec();
    sorted.sort_by(|a, b| b.value.cmp(&a.value));

    let mut selected: Vec<Utxo> = Vec::new();
    let mut total_input: i64 = 0;
    let mut estimated_fee: i64 = 0;

    for utxo in sorted {
        let output_type = utxo.effective_type();
        total_input += utxo.value;
        selected.push(utxo);

        estimated_fee = estimate_fee_for_utxos(&selected, 2, fee_rate, Some(output_type));

        if total_input >= target_amount + estimated_fee {
            return Ok((selected, estimated_fee));
        }
    }

    Err(WalletError::InsufficientFunds {
        available: total_input,
        needed: target_amount,
        fee: estimated_fee,
    })
}

/// Build and sign a transaction paying the given outputs, returning change
/// above the dust limit to `change_address`. All inputs opt into RBF.
pub fn build_transaction(
    seed: &[u8],
    network: Network,
    utxos: &[Utxo],
    outputs: &[TxOutputSpec],
    change_address: &str,
    fee_rate: i64,
) -> Result<TransactionResult, WalletError> {
    let mut total_output: i64 = 0;
    let mut output_vsize: i64 = 0;
    for out in outputs {
        if out.value < DUST_LIMIT {
            return Err(WalletError::DustOutput {
                value: out.value,
                limit: DUST_LIMIT,
            });
        }
        total_output += out.value;
        output_vsize += output_size_for(output_type_of(&out.address, network)?);
    }

    let total_input: i64 = utxos.iter().map(|u| u.value).sum();
    let input_vsize: i64 = utxos.iter().map(Utxo::input_vsize).sum();

    let base_fee = (TX_OVERHEAD + input_vsize + output_vsize) * fee_rate;
    let change_size = output_size_for(output_type_of(change_address, network)?);

    let mut change_amount = total_input - total_output - base_fee;
    let mut add_change = false;

    if change_amount > DUST_LIMIT {
        let fee_with_change = base_fee + change_size * fee_rate;
        let recomputed = total_input - total_output - fee_with_change;
        if recomputed > DUST_LIMIT {
            add_change = true;
            change_amount = recomputed;
        } else {
            // Change shrank below dust once its own cost was counted;
            // absorb it into the fee.
            change_amount = 0;
        }
    } else if change_amount < 0 {
        return Err(WalletError::InsufficientFunds {
            available: total_input,
            needed: total_output,
            fee: base_fee,
        });
    } else {
        change_amount = 0;
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: build_inputs(utxos)?,
        output: Vec::new(),
    };

    for out in outputs {
        tx.output.push(TxOut {
            value: Amount::from_sat(out.value as u64),
            script_pubkey: address::script_pubkey(&out.address, network)?,
        });
    }

    if add_change {
        tx.output.push(TxOut {
            value: Amount::from_sat(change_amount as u64),
            script_pubkey: address::script_pubkey(change_address, network)?,
        });
    }

    sign_inputs(&mut tx, seed, network, utxos)?;

    let hex = serialize_hex(&tx);
    Ok(TransactionResult {
        txid: tx.compute_txid().to_string(),
        fee: total_input - total_output - change_amount,
        total_input,
        total_output,
        change_amount,
        size: tx.total_size(),
        vsize: tx.vsize(),
        hex,
    })
}

/// Build and sign a transaction that consolidates at least two UTXOs into a
/// single output. All input value minus fee goes to the destination.
pub fn build_consolidation_transaction(
    seed: &[u8],
    network: Network,
    utxos: &[Utxo],
    destination_address: &str,
    fee_rate: i64,
) -> Result<TransactionResult, WalletError> {
    if utxos.len() < 2 {
        return Err(WalletError::InvalidInput(format!(
            "need at least 2 UTXOs to consolidate, got {}",
            utxos.len()
        )));
    }

    let total_input: i64 = utxos.iter().map(|u| u.value).sum();

    let output_type = output_type_of(destination_address, network)?;
    let fee = estimate_fee_for_utxos(utxos, 1, fee_rate, Some(output_type));

    let output_value = total_input - fee;
    if output_value <= 0 {
        return Err(WalletError::InsufficientFunds {
            available: total_input,
            needed: 0,
            fee,
        });
    }
    if output_value < DUST_LIMIT {
        return Err(WalletError::DustOutput {
            value: output_value,
            limit: DUST_LIMIT,
        });
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: build_inputs(utxos)?,
        output: vec![TxOut {
            value: Amount::from_sat(output_value as u64),
            script_pubkey: address::script_pubkey(destination_address, network)?,
        }],
    };

    sign_inputs(&mut tx, seed, network, utxos)?;

    let hex = serialize_hex(&tx);
    Ok(TransactionResult {
        txid: tx.compute_txid().to_string(),
        fee,
        total_input,
        total_output: output_value,
        change_amount: 0,
        size: tx.total_size(),
        vsize: tx.vsize(),
        hex,
    })
}

fn output_type_of(address: &str, network: Network) -> Result<AddressType, WalletError> {
    let form = address::detect_script_form(address, network)?;
    Ok(match form {
        address::ScriptForm::P2tr => AddressType::P2tr,
        _ => AddressType::P2wpkh,
    })
}

fn build_inputs(utxos: &[Utxo]) -> Result<Vec<TxIn>, WalletError> {
    utxos
        .iter()
        .map(|utxo| {
            let txid: Txid = utxo
                .txid
                .parse()
                .map_err(|e| WalletError::InvalidInput(format!("invalid txid {}: {}", utxo.txid, e)))?;
            Ok(TxIn {
                previous_output: OutPoint {
                    txid,
                    vout: utxo.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::from_consensus(SEQUENCE_RBF),
                witness: Witness::new(),
            })
        })
        .collect()
}

/// Sign every input with the receive-chain key at its address index.
/// P2WPKH inputs get an ECDSA witness (BIP143, SIGHASH_ALL); P2TR inputs a
/// single Schnorr signature over the BIP341 default sighash, using the
/// key-path tweak with an empty script tree.
fn sign_inputs(
    tx: &mut Transaction,
    seed: &[u8],
    network: Network,
    utxos: &[Utxo],
) -> Result<(), WalletError> {
    let secp = Secp256k1::new();

    let prevouts: Vec<TxOut> = utxos
        .iter()
        .map(|u| TxOut {
            value: Amount::from_sat(u.value as u64),
            script_pubkey: u.script_pub_key.clone(),
        })
        .collect();

    let unsigned = tx.clone();
    let mut sighash_cache = SighashCache::new(&unsigned);

    for (i, utxo) in utxos.iter().enumerate() {
        let address_type = utxo.effective_type();
        let key = keys::derive_receiving_key(seed, network, utxo.address_index, address_type)?;

        let witness = match address_type {
            AddressType::P2tr => {
                let sighash = sighash_cache
                    .taproot_key_spend_signature_hash(
                        i,
                        &Prevouts::All(&prevouts),
                        TapSighashType::Default,
                    )
                    .map_err(|e| {
                        WalletError::Derivation(format!(
                            "failed to compute taproot sighash for input {}: {}",
                            i, e
                        ))
                    })?;
                let message = Message::from_digest(sighash.to_byte_array());

                let keypair = Keypair::from_secret_key(&secp, &key.private_key);
                let tweaked = keypair.tap_tweak(&secp, None);
                let signature = secp.sign_schnorr_no_aux_rand(&message, &tweaked.to_inner());

                let mut witness = Witness::new();
                witness.push(signature.serialize());
                witness
            }
            AddressType::P2wpkh => {
                let sighash = sighash_cache
                    .p2wpkh_signature_hash(
                        i,
                        &utxo.script_pub_key,
                        Amount::from_sat(utxo.value as u64),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| {
                        WalletError::Derivation(format!(
                            "failed to compute sighash for input {}: {}",
                            i, e
                        ))
                    })?;
                let message = Message::from_digest(sighash.to_byte_array());

                let signature = secp.sign_ecdsa(&message, &key.private_key);
                let mut sig_with_hashtype = signature.serialize_der().to_vec();
                sig_with_hashtype.push(EcdsaSighashType::All.to_u32() as u8);

                let pubkey = key.private_key.public_key(&secp);
                let mut witness = Witness::new();
                witness.push(&sig_with_hashtype);
                witness.push(pubkey.serialize());
                witness
            }
        };

        tx.input[i].witness = witness;
    }

    Ok(())
}
