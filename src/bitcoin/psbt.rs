//! PSBT signing (three fallback strategies), finalization and extraction.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::bip32::ChildNumber;
use bitcoin::hashes::Hash;
use bitcoin::key::{Keypair, TapTweak};
use bitcoin::psbt::Input as PsbtInput;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{Address, Psbt, PublicKey, ScriptBuf, Transaction, TxOut, Witness};

use super::keys;
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::AddressType;

/// Key material and derivation bounds of the wallet doing the signing.
pub struct SigningWallet<'a> {
    pub seed: &'a [u8],
    pub network: Network,
    pub address_type: AddressType,
    pub next_address_index: u32,
}

/// Decode a base64-encoded BIP174 packet.
pub fn decode_psbt(encoded: &str) -> Result<Psbt, WalletError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| WalletError::InvalidInput(format!("invalid base64 PSBT: {}", e)))?;
    Psbt::deserialize(&bytes).map_err(|e| WalletError::InvalidInput(format!("invalid PSBT: {}", e)))
}

/// Serialize a packet to base64 for the API boundary.
pub fn encode_psbt(psbt: &Psbt) -> String {
    BASE64.encode(psbt.serialize())
}

/// Sign every input the wallet holds a key for. Three strategies are tried
/// in order per input:
///   1. direct address match against the wallet's stored addresses,
///   2. BIP32 derivation entries carried by the input,
///   3. scanning wallet keys against a multi-sig witness script.
/// Returns the number of inputs signed. Inputs without a witness UTXO and
/// inputs no strategy matches are left untouched for other signers.
pub fn sign_psbt(
    psbt: &mut Psbt,
    wallet: &SigningWallet<'_>,
    address_index: &HashMap<String, u32>,
) -> usize {
    let unsigned_tx = psbt.unsigned_tx.clone();
    let mut sighash_cache = SighashCache::new(&unsigned_tx);

    // Taproot sighashes commit to every prevout, so key-path signing is only
    // possible when the packet carries all witness UTXOs.
    let all_prevouts: Option<Vec<TxOut>> = psbt
        .inputs
        .iter()
        .map(|input| input.witness_utxo.clone())
        .collect();

    let mut signed_count = 0;

    for i in 0..psbt.inputs.len() {
        let input = psbt.inputs[i].clone();
        let Some(witness_utxo) = input.witness_utxo.clone() else {
            continue;
        };

        if try_sign_single_sig(
            psbt,
            i,
            &witness_utxo,
            wallet,
            address_index,
            &mut sighash_cache,
            all_prevouts.as_deref(),
        ) {
            signed_count += 1;
            continue;
        }

        if try_sign_by_bip32_derivation(
            psbt,
            i,
            &input,
            &witness_utxo,
            wallet,
            &mut sighash_cache,
            all_prevouts.as_deref(),
        ) {
            signed_count += 1;
            continue;
        }

        if input.witness_script.is_some()
            && try_sign_multisig(psbt, i, &input, &witness_utxo, wallet, &mut sighash_cache)
        {
            signed_count += 1;
        }
    }

    signed_count
}

/// Strategy 1: the input pays one of this wallet's stored addresses.
fn try_sign_single_sig(
    psbt: &mut Psbt,
    input_index: usize,
    witness_utxo: &TxOut,
    wallet: &SigningWallet<'_>,
    address_index: &HashMap<String, u32>,
    sighash_cache: &mut SighashCache<&Transaction>,
    all_prevouts: Option<&[TxOut]>,
) -> bool {
    let Ok(address) = Address::from_script(
        &witness_utxo.script_pubkey,
        wallet.network.chain_params(),
    ) else {
        return false;
    };

    let Some(&index) = address_index.get(&address.to_string()) else {
        return false;
    };

    let address_type = match address.address_type() {
        Some(bitcoin::AddressType::P2tr) => AddressType::P2tr,
        _ => AddressType::P2wpkh,
    };

    let Ok(key) = keys::derive_receiving_key(wallet.seed, wallet.network, index, address_type)
    else {
        return false;
    };

    sign_input(
        psbt,
        input_index,
        witness_utxo,
        &key,
        address_type,
        sighash_cache,
        all_prevouts,
    )
}

/// Strategy 2: one of the input's BIP32 derivation entries matches our
/// derivation pattern and pubkey.
fn try_sign_by_bip32_derivation(
    psbt: &mut Psbt,
    input_index: usize,
    input: &PsbtInput,
    witness_utxo: &TxOut,
    wallet: &SigningWallet<'_>,
    sighash_cache: &mut SighashCache<&Transaction>,
    all_prevouts: Option<&[TxOut]>,
) -> bool {
    let secp = Secp256k1::new();

    for (pubkey, (_fingerprint, path)) in &input.bip32_derivation {
        let path: &[ChildNumber] = path.as_ref();
        let Some((address_type, chain, index)) = match_derivation_path(path, wallet.network)
        else {
            continue;
        };

        let derived = if chain == 0 {
            keys::derive_receiving_key(wallet.seed, wallet.network, index, address_type)
        } else {
            keys::derive_change_key(wallet.seed, wallet.network, index, address_type)
        };
        let Ok(key) = derived else {
            continue;
        };

        if key.private_key.public_key(&secp) != *pubkey {
            continue;
        }

        log::debug!(
            "matched BIP32 derivation: input={} index={} type={}",
            input_index,
            index,
            address_type
        );

        if let Some(witness_script) = &input.witness_script {
            return sign_multisig_input(
                psbt,
                input_index,
                witness_utxo,
                witness_script,
                &key,
                sighash_cache,
            );
        }

        return sign_input(
            psbt,
            input_index,
            witness_utxo,
            &key,
            address_type,
            sighash_cache,
            all_prevouts,
        );
    }

    false
}

/// Strategy 3: scan wallet keys against the pubkeys pushed in a multi-sig
/// witness script.
fn try_sign_multisig(
    psbt: &mut Psbt,
    input_index: usize,
    input: &PsbtInput,
    witness_utxo: &TxOut,
    wallet: &SigningWallet<'_>,
    sighash_cache: &mut SighashCache<&Transaction>,
) -> bool {
    let Some(witness_script) = input.witness_script.clone() else {
        return false;
    };

    let script_pubkeys = extract_pubkeys_from_script(witness_script.as_bytes());
    if script_pubkeys.is_empty() {
        return false;
    }

    let secp = Secp256k1::new();
    let max_index = std::cmp::max(100, wallet.next_address_index + 20);

    for index in 0..max_index {
        for chain in [0u32, 1] {
            let derived = if chain == 0 {
                keys::derive_receiving_key(wallet.seed, wallet.network, index, wallet.address_type)
            } else {
                keys::derive_change_key(wallet.seed, wallet.network, index, wallet.address_type)
            };
            let Ok(key) = derived else {
                continue;
            };

            let pubkey = key.private_key.public_key(&secp).serialize();
            if script_pubkeys.iter().any(|pk| pk[..] == pubkey[..]) {
                log::debug!(
                    "found matching key in witness script: input={} index={} chain={}",
                    input_index,
                    index,
                    chain
                );
                return sign_multisig_input(
                    psbt,
                    input_index,
                    witness_utxo,
                    &witness_script,
                    &key,
                    sighash_cache,
                );
            }
        }
    }

    false
}

/// Check a BIP32 path against our derivation pattern
/// purpose'/coin'/account'/chain/index and return (type, chain, index).
fn match_derivation_path(
    path: &[ChildNumber],
    network: Network,
) -> Option<(AddressType, u32, u32)> {
    if path.len() < 5 {
        return None;
    }

    let address_type = match path[0] {
        ChildNumber::Hardened { index: 84 } => AddressType::P2wpkh,
        ChildNumber::Hardened { index: 86 } => AddressType::P2tr,
        _ => return None,
    };

    match path[1] {
        ChildNumber::Hardened { index } if index == network.coin_type() => {}
        _ => return None,
    }

    // Only account 0 is supported.
    if path[2] != (ChildNumber::Hardened { index: 0 }) {
        return None;
    }

    let chain = match path[3] {
        ChildNumber::Normal { index } if index <= 1 => index,
        _ => return None,
    };

    let index = match path[4] {
        ChildNumber::Normal { index } => index,
        _ => return None,
    };

    Some((address_type, chain, index))
}

/// Sign a single-sig input (P2WPKH or P2TR key-path).
fn sign_input(
    psbt: &mut Psbt,
    input_index: usize,
    witness_utxo: &TxOut,
    key: &bitcoin::bip32::Xpriv,
    address_type: AddressType,
    sighash_cache: &mut SighashCache<&Transaction>,
    all_prevouts: Option<&[TxOut]>,
) -> bool {
    let secp = Secp256k1::new();

    match address_type {
        AddressType::P2tr => {
            let Some(prevouts) = all_prevouts else {
                return false;
            };
            let Ok(sighash) = sighash_cache.taproot_key_spend_signature_hash(
                input_index,
                &Prevouts::All(prevouts),
                TapSighashType::Default,
            ) else {
                return false;
            };
            let message = Message::from_digest(sighash.to_byte_array());

            let keypair = Keypair::from_secret_key(&secp, &key.private_key);
            let tweaked = keypair.tap_tweak(&secp, None);
            let signature = secp.sign_schnorr_no_aux_rand(&message, &tweaked.to_inner());

            psbt.inputs[input_index].tap_key_sig = Some(bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            });
        }
        AddressType::P2wpkh => {
            let Ok(sighash) = sighash_cache.p2wpkh_signature_hash(
                input_index,
                &witness_utxo.script_pubkey,
                witness_utxo.value,
                EcdsaSighashType::All,
            ) else {
                return false;
            };
            let message = Message::from_digest(sighash.to_byte_array());

            let signature = secp.sign_ecdsa(&message, &key.private_key);
            let pubkey = PublicKey::new(key.private_key.public_key(&secp));

            psbt.inputs[input_index].partial_sigs.insert(
                pubkey,
                bitcoin::ecdsa::Signature {
                    signature,
                    sighash_type: EcdsaSighashType::All,
                },
            );
        }
    }

    true
}

/// Sign a multi-sig (P2WSH) input. The signature commits to the witness
/// script, not the scriptPubKey, and is appended to the partial signatures
/// without disturbing other signers' entries.
fn sign_multisig_input(
    psbt: &mut Psbt,
    input_index: usize,
    witness_utxo: &TxOut,
    witness_script: &ScriptBuf,
    key: &bitcoin::bip32::Xpriv,
    sighash_cache: &mut SighashCache<&Transaction>,
) -> bool {
    let secp = Secp256k1::new();

    let Ok(sighash) = sighash_cache.p2wsh_signature_hash(
        input_index,
        witness_script,
        witness_utxo.value,
        EcdsaSighashType::All,
    ) else {
        return false;
    };
    let message = Message::from_digest(sighash.to_byte_array());

    let signature = secp.sign_ecdsa(&message, &key.private_key);
    let pubkey = PublicKey::new(key.private_key.public_key(&secp));

    psbt.inputs[input_index].partial_sigs.insert(
        pubkey,
        bitcoin::ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        },
    );

    true
}

/// Extract compressed-pubkey pushes from a multi-sig witness script.
fn extract_pubkeys_from_script(script: &[u8]) -> Vec<Vec<u8>> {
    let mut pubkeys = Vec::new();

    let mut i = 0;
    while i < script.len() {
        let opcode = script[i];
        i += 1;

        if opcode == 0x21 && i + 33 <= script.len() {
            let candidate = &script[i..i + 33];
            if candidate[0] == 0x02 || candidate[0] == 0x03 {
                pubkeys.push(candidate.to_vec());
            }
            i += 33;
        } else if (0x01..=0x4b).contains(&opcode) {
            // Other data push, skip it.
            i += opcode as usize;
        }
    }

    pubkeys
}

/// Apply BIP174 finalization to every input: assemble the final witness from
/// the collected signatures and clear the signing fields.
pub fn finalize_psbt(psbt: &mut Psbt) -> Result<(), WalletError> {
    for i in 0..psbt.inputs.len() {
        if psbt.inputs[i].final_script_witness.is_some() {
            continue;
        }

        let witness = finalize_input(&psbt.inputs[i], i)?;

        let input = &mut psbt.inputs[i];
        input.final_script_witness = Some(witness);
        input.partial_sigs.clear();
        input.bip32_derivation.clear();
        input.tap_key_sig = None;
        input.witness_script = None;
        input.redeem_script = None;
        input.sighash_type = None;
    }
    Ok(())
}

fn finalize_input(input: &PsbtInput, index: usize) -> Result<Witness, WalletError> {
    let witness_utxo = input.witness_utxo.as_ref().ok_or_else(|| {
        WalletError::InvalidInput(format!("input {}: missing witness_utxo", index))
    })?;
    let script_pubkey = &witness_utxo.script_pubkey;

    if script_pubkey.is_p2tr() {
        let signature = input.tap_key_sig.clone().ok_or_else(|| {
            WalletError::InvalidInput(format!("input {}: missing taproot key-spend signature", index))
        })?;
        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        return Ok(witness);
    }

    if let Some(witness_script) = &input.witness_script {
        return finalize_multisig_input(input, witness_script, index);
    }

    if script_pubkey.is_p2wpkh() {
        let (pubkey, signature) = input.partial_sigs.iter().next().ok_or_else(|| {
            WalletError::InvalidInput(format!("input {}: no partial signature", index))
        })?;
        let mut witness = Witness::new();
        witness.push(signature.to_vec());
        witness.push(pubkey.to_bytes());
        return Ok(witness);
    }

    Err(WalletError::InvalidInput(format!(
        "input {}: unsupported script type for finalization",
        index
    )))
}

/// Assemble a P2WSH multi-sig witness: the CHECKMULTISIG dummy element,
/// signatures ordered by pubkey position in the witness script up to the
/// threshold, then the script itself.
fn finalize_multisig_input(
    input: &PsbtInput,
    witness_script: &ScriptBuf,
    index: usize,
) -> Result<Witness, WalletError> {
    let bytes = witness_script.as_bytes();

    let threshold = match bytes.first() {
        Some(op) if (0x51..=0x60).contains(op) => (op - 0x50) as usize,
        _ => {
            return Err(WalletError::InvalidInput(format!(
                "input {}: witness script is not a multi-sig script",
                index
            )))
        }
    };

    let mut witness = Witness::new();
    witness.push(Vec::<u8>::new());

    let mut pushed = 0;
    for pk_bytes in extract_pubkeys_from_script(bytes) {
        if pushed == threshold {
            break;
        }
        let Ok(pubkey) = PublicKey::from_slice(&pk_bytes) else {
            continue;
        };
        if let Some(signature) = input.partial_sigs.get(&pubkey) {
            witness.push(signature.to_vec());
            pushed += 1;
        }
    }

    if pushed < threshold {
        return Err(WalletError::InvalidInput(format!(
            "input {}: have {} of {} required signatures",
            index, pushed, threshold
        )));
    }

    witness.push(bytes);
    Ok(witness)
}

/// Extract the final transaction from a finalized packet. Fee-rate safety is
/// enforced at build time, not here.
pub fn extract_transaction(psbt: Psbt) -> Transaction {
    psbt.extract_tx_unchecked_fee_rate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::address::{address_from_seed, script_pubkey};
    use bitcoin::absolute::LockTime;
    use bitcoin::hex::FromHex;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, Sequence, TxIn};

    const TEST_SEED_HEX: &str = "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc1\
                                 9a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4";

    fn test_seed() -> Vec<u8> {
        Vec::from_hex(TEST_SEED_HEX).unwrap()
    }

    fn unsigned_tx_spending(value: u64, destination_script: ScriptBuf) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: "1111111111111111111111111111111111111111111111111111111111111111"
                        .parse()
                        .unwrap(),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value - 1_000),
                script_pubkey: destination_script,
            }],
        }
    }

    fn signing_wallet(seed: &[u8]) -> SigningWallet<'_> {
        SigningWallet {
            seed,
            network: Network::Mainnet,
            address_type: AddressType::P2wpkh,
            next_address_index: 5,
        }
    }

    #[test]
    fn test_sign_single_sig_by_address_match() {
        let seed = test_seed();
        let our_address =
            address_from_seed(&seed, Network::Mainnet, 4, AddressType::P2wpkh).unwrap();
        let our_script = script_pubkey(&our_address, Network::Mainnet).unwrap();
        let destination =
            address_from_seed(&seed, Network::Mainnet, 9, AddressType::P2wpkh).unwrap();

        let tx = unsigned_tx_spending(
            50_000,
            script_pubkey(&destination, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: our_script,
        });

        let mut address_index = HashMap::new();
        address_index.insert(our_address, 4u32);

        let wallet = signing_wallet(&seed);
        let signed = sign_psbt(&mut psbt, &wallet, &address_index);
        assert_eq!(signed, 1);
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);

        let secp = Secp256k1::new();
        let expected_key =
            keys::derive_receiving_key(&seed, Network::Mainnet, 4, AddressType::P2wpkh).unwrap();
        let expected_pubkey = PublicKey::new(expected_key.private_key.public_key(&secp));
        assert!(psbt.inputs[0].partial_sigs.contains_key(&expected_pubkey));

        // Re-signing the same input yields the same pubkey/signature pair.
        let before = psbt.inputs[0].partial_sigs.clone();
        let signed_again = sign_psbt(&mut psbt, &wallet, &address_index);
        assert_eq!(signed_again, 1);
        assert_eq!(psbt.inputs[0].partial_sigs, before);
    }

    #[test]
    fn test_sign_by_bip32_derivation() {
        let seed = test_seed();
        let secp = Secp256k1::new();

        let our_address =
            address_from_seed(&seed, Network::Mainnet, 7, AddressType::P2wpkh).unwrap();
        let our_script = script_pubkey(&our_address, Network::Mainnet).unwrap();
        let destination =
            address_from_seed(&seed, Network::Mainnet, 9, AddressType::P2wpkh).unwrap();

        let tx = unsigned_tx_spending(
            70_000,
            script_pubkey(&destination, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(70_000),
            script_pubkey: our_script,
        });

        let key = keys::derive_receiving_key(&seed, Network::Mainnet, 7, AddressType::P2wpkh)
            .unwrap();
        let pubkey = key.private_key.public_key(&secp);
        let path = bitcoin::bip32::DerivationPath::from(vec![
            ChildNumber::Hardened { index: 84 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index: 7 },
        ]);
        psbt.inputs[0]
            .bip32_derivation
            .insert(pubkey, (bitcoin::bip32::Fingerprint::default(), path));

        // No stored-address map entry: strategy 1 cannot match.
        let wallet = signing_wallet(&seed);
        let signed = sign_psbt(&mut psbt, &wallet, &HashMap::new());
        assert_eq!(signed, 1);
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 1);
    }

    #[test]
    fn test_bip32_derivation_rejects_foreign_paths() {
        // Wrong coin type for mainnet.
        let path = [
            ChildNumber::Hardened { index: 84 },
            ChildNumber::Hardened { index: 1 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index: 3 },
        ];
        assert!(match_derivation_path(&path, Network::Mainnet).is_none());
        assert_eq!(
            match_derivation_path(&path, Network::Testnet4),
            Some((AddressType::P2wpkh, 0, 3))
        );

        // Unknown purpose.
        let legacy = [
            ChildNumber::Hardened { index: 44 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index: 0 },
        ];
        assert!(match_derivation_path(&legacy, Network::Mainnet).is_none());

        // Non-zero account.
        let account1 = [
            ChildNumber::Hardened { index: 84 },
            ChildNumber::Hardened { index: 0 },
            ChildNumber::Hardened { index: 1 },
            ChildNumber::Normal { index: 0 },
            ChildNumber::Normal { index: 0 },
        ];
        assert!(match_derivation_path(&account1, Network::Mainnet).is_none());
    }

    #[test]
    fn test_sign_multisig_appends_partial_sig() {
        let seed = test_seed();
        let secp = Secp256k1::new();

        // 1-of-1 witness script holding our receive key at index 3, chain 0.
        let our_key =
            keys::derive_receiving_key(&seed, Network::Mainnet, 3, AddressType::P2wpkh).unwrap();
        let our_pubkey = our_key.private_key.public_key(&secp).serialize();

        let mut script = vec![0x51, 0x21];
        script.extend_from_slice(&our_pubkey);
        script.extend_from_slice(&[0x51, 0xae]);
        let witness_script = ScriptBuf::from_bytes(script);
        let p2wsh = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());

        let destination =
            address_from_seed(&seed, Network::Mainnet, 9, AddressType::P2wpkh).unwrap();
        let tx = unsigned_tx_spending(
            90_000,
            script_pubkey(&destination, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(90_000),
            script_pubkey: p2wsh,
        });
        psbt.inputs[0].witness_script = Some(witness_script);

        // A co-signer's entry must survive our signing pass.
        let foreign_key = keys::derive_receiving_key(
            &[0x42u8; 32],
            Network::Mainnet,
            0,
            AddressType::P2wpkh,
        )
        .unwrap();
        let foreign_pubkey = PublicKey::new(foreign_key.private_key.public_key(&secp));
        let placeholder = {
            let message = Message::from_digest([0x24; 32]);
            bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &foreign_key.private_key),
                sighash_type: EcdsaSighashType::All,
            }
        };
        psbt.inputs[0]
            .partial_sigs
            .insert(foreign_pubkey, placeholder);

        let wallet = signing_wallet(&seed);
        let signed = sign_psbt(&mut psbt, &wallet, &HashMap::new());
        assert_eq!(signed, 1);
        assert_eq!(psbt.inputs[0].partial_sigs.len(), 2);
        assert!(psbt.inputs[0].partial_sigs.contains_key(&foreign_pubkey));
    }

    #[test]
    fn test_extract_pubkeys_from_script() {
        let seed = test_seed();
        let secp = Secp256k1::new();
        let k1 = keys::derive_receiving_key(&seed, Network::Mainnet, 0, AddressType::P2wpkh)
            .unwrap();
        let k2 = keys::derive_receiving_key(&seed, Network::Mainnet, 1, AddressType::P2wpkh)
            .unwrap();
        let pk1 = k1.private_key.public_key(&secp).serialize();
        let pk2 = k2.private_key.public_key(&secp).serialize();

        // OP_2 <pk1> <pk2> OP_2 OP_CHECKMULTISIG
        let mut script = vec![0x52, 0x21];
        script.extend_from_slice(&pk1);
        script.push(0x21);
        script.extend_from_slice(&pk2);
        script.extend_from_slice(&[0x52, 0xae]);

        let extracted = extract_pubkeys_from_script(&script);
        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0], pk1.to_vec());
        assert_eq!(extracted[1], pk2.to_vec());

        assert!(extract_pubkeys_from_script(&[0x51, 0xae]).is_empty());
    }

    #[test]
    fn test_psbt_round_trip() {
        let seed = test_seed();
        let destination =
            address_from_seed(&seed, Network::Mainnet, 1, AddressType::P2wpkh).unwrap();
        let tx = unsigned_tx_spending(
            30_000,
            script_pubkey(&destination, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(30_000),
            script_pubkey: script_pubkey(&destination, Network::Mainnet).unwrap(),
        });

        let encoded = encode_psbt(&psbt);
        let decoded = decode_psbt(&encoded).unwrap();
        assert_eq!(decoded, psbt);

        assert!(decode_psbt("not-base64!").is_err());
        assert!(decode_psbt("aGVsbG8=").is_err());
    }

    #[test]
    fn test_finalize_and_extract_p2wpkh() {
        let seed = test_seed();
        let our_address =
            address_from_seed(&seed, Network::Mainnet, 2, AddressType::P2wpkh).unwrap();
        let destination =
            address_from_seed(&seed, Network::Mainnet, 9, AddressType::P2wpkh).unwrap();

        let tx = unsigned_tx_spending(
            40_000,
            script_pubkey(&destination, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(40_000),
            script_pubkey: script_pubkey(&our_address, Network::Mainnet).unwrap(),
        });

        let mut address_index = HashMap::new();
        address_index.insert(our_address, 2u32);
        let wallet = signing_wallet(&seed);
        assert_eq!(sign_psbt(&mut psbt, &wallet, &address_index), 1);

        finalize_psbt(&mut psbt).unwrap();
        assert!(psbt.inputs[0].partial_sigs.is_empty());

        let final_tx = extract_transaction(psbt);
        assert_eq!(final_tx.input[0].witness.len(), 2);
        assert_eq!(final_tx.input[0].witness[1].len(), 33);
    }

    #[test]
    fn test_finalize_multisig_witness_layout() {
        let seed = test_seed();
        let secp = Secp256k1::new();

        let our_key =
            keys::derive_receiving_key(&seed, Network::Mainnet, 0, AddressType::P2wpkh).unwrap();
        let our_pubkey = our_key.private_key.public_key(&secp).serialize();

        let mut script = vec![0x51, 0x21];
        script.extend_from_slice(&our_pubkey);
        script.extend_from_slice(&[0x51, 0xae]);
        let witness_script = ScriptBuf::from_bytes(script);
        let p2wsh = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());

        let destination =
            address_from_seed(&seed, Network::Mainnet, 9, AddressType::P2wpkh).unwrap();
        let tx = unsigned_tx_spending(
            80_000,
            script_pubkey(&destination, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(80_000),
            script_pubkey: p2wsh,
        });
        psbt.inputs[0].witness_script = Some(witness_script.clone());

        let wallet = signing_wallet(&seed);
        assert_eq!(sign_psbt(&mut psbt, &wallet, &HashMap::new()), 1);

        finalize_psbt(&mut psbt).unwrap();
        let final_tx = extract_transaction(psbt);

        let witness = &final_tx.input[0].witness;
        assert_eq!(witness.len(), 3);
        assert!(witness[0].is_empty());
        assert_eq!(witness[2], *witness_script.as_bytes());
    }

    #[test]
    fn test_finalize_fails_without_signatures() {
        let seed = test_seed();
        let our_address =
            address_from_seed(&seed, Network::Mainnet, 2, AddressType::P2wpkh).unwrap();
        let tx = unsigned_tx_spending(
            40_000,
            script_pubkey(&our_address, Network::Mainnet).unwrap(),
        );
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(40_000),
            script_pubkey: script_pubkey(&our_address, Network::Mainnet).unwrap(),
        });

        assert!(finalize_psbt(&mut psbt).is_err());
    }
}
