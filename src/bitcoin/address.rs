//! Address construction and the Electrum scripthash codec.

use std::str::FromStr;

use bitcoin::bip32::Xpriv;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::DisplayHex;
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, PublicKey, ScriptBuf};
use serde::Serialize;

use super::keys;
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::AddressType;

/// Script form of a decoded address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptForm {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    Unknown,
}

impl ScriptForm {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptForm::P2pkh => "p2pkh",
            ScriptForm::P2sh => "p2sh",
            ScriptForm::P2wpkh => "p2wpkh",
            ScriptForm::P2wsh => "p2wsh",
            ScriptForm::P2tr => "p2tr",
            ScriptForm::Unknown => "unknown",
        }
    }
}

/// Generate a native SegWit (bech32) address from an extended key.
pub fn p2wpkh_address(key: &Xpriv, network: Network) -> Result<Address, WalletError> {
    let secp = Secp256k1::new();
    let pubkey = PublicKey::new(key.private_key.public_key(&secp));
    let compressed = CompressedPublicKey::try_from(pubkey)
        .map_err(|e| WalletError::Derivation(e.to_string()))?;
    Ok(Address::p2wpkh(&compressed, network.chain_params()))
}

/// Generate a Taproot (bech32m) address from an extended key.
/// Key-path only spending per BIP86: the internal key is tweaked with an
/// empty script tree.
pub fn p2tr_address(key: &Xpriv, network: Network) -> Result<Address, WalletError> {
    let secp = Secp256k1::new();
    let (internal_key, _parity) = key.private_key.public_key(&secp).x_only_public_key();
    Ok(Address::p2tr(
        &secp,
        internal_key,
        None,
        network.chain_params(),
    ))
}

fn address_for_key(
    key: &Xpriv,
    network: Network,
    address_type: AddressType,
) -> Result<Address, WalletError> {
    match address_type {
        AddressType::P2wpkh => p2wpkh_address(key, network),
        AddressType::P2tr => p2tr_address(key, network),
    }
}

/// Generate a receiving address for a specific index.
pub fn address_from_seed(
    seed: &[u8],
    network: Network,
    index: u32,
    address_type: AddressType,
) -> Result<String, WalletError> {
    let key = keys::derive_receiving_key(seed, network, index, address_type)?;
    Ok(address_for_key(&key, network, address_type)?.to_string())
}

/// Generate a change address (internal chain, `.../1/index`).
pub fn change_address_from_seed(
    seed: &[u8],
    network: Network,
    index: u32,
    address_type: AddressType,
) -> Result<String, WalletError> {
    let key = keys::derive_change_key(seed, network, index, address_type)?;
    Ok(address_for_key(&key, network, address_type)?.to_string())
}

/// Parse an address and confirm it belongs to the configured network.
pub fn parse_address(address: &str, network: Network) -> Result<Address, WalletError> {
    let unchecked = Address::from_str(address)
        .map_err(|e| WalletError::InvalidInput(format!("invalid address: {}", e)))?;
    unchecked.require_network(network.chain_params()).map_err(|_| {
        WalletError::InvalidInput(format!("address is not for {} network", network))
    })
}

/// scriptPubKey for an address on the configured network.
pub fn script_pubkey(address: &str, network: Network) -> Result<ScriptBuf, WalletError> {
    Ok(parse_address(address, network)?.script_pubkey())
}

/// Electrum scripthash of a scriptPubKey: reversed SHA-256, lowercase hex.
pub fn script_hash(script: &ScriptBuf) -> String {
    let mut hash = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    hash.reverse();
    hash.to_lower_hex_string()
}

/// Electrum scripthash of an address.
pub fn address_scripthash(address: &str, network: Network) -> Result<String, WalletError> {
    Ok(script_hash(&script_pubkey(address, network)?))
}

/// Validate an address for the given network.
pub fn validate_address(address: &str, network: Network) -> Result<(), WalletError> {
    parse_address(address, network).map(|_| ())
}

/// Classify an address into its script form after a network check.
pub fn detect_script_form(address: &str, network: Network) -> Result<ScriptForm, WalletError> {
    let addr = parse_address(address, network)?;
    let form = match addr.address_type() {
        Some(bitcoin::AddressType::P2pkh) => ScriptForm::P2pkh,
        Some(bitcoin::AddressType::P2sh) => ScriptForm::P2sh,
        Some(bitcoin::AddressType::P2wpkh) => ScriptForm::P2wpkh,
        Some(bitcoin::AddressType::P2wsh) => ScriptForm::P2wsh,
        Some(bitcoin::AddressType::P2tr) => ScriptForm::P2tr,
        _ => ScriptForm::Unknown,
    };
    Ok(form)
}

/// Complete information about a derived address, ready for storage.
#[derive(Debug, Clone, Serialize)]
pub struct AddressInfo {
    pub address: String,
    pub index: u32,
    pub derivation_path: String,
    pub scripthash: String,
}

/// Generate complete receiving-address information for an index.
pub fn generate_address_info(
    seed: &[u8],
    network: Network,
    index: u32,
    address_type: AddressType,
) -> Result<AddressInfo, WalletError> {
    let address = address_from_seed(seed, network, index, address_type)?;
    let scripthash = address_scripthash(&address, network)?;

    Ok(AddressInfo {
        address,
        index,
        derivation_path: keys::derivation_path(network, 0, index, address_type),
        scripthash,
    })
}

/// Generate complete change-address information for an index (chain = 1).
pub fn generate_change_address_info(
    seed: &[u8],
    network: Network,
    index: u32,
    address_type: AddressType,
) -> Result<AddressInfo, WalletError> {
    let address = change_address_from_seed(seed, network, index, address_type)?;
    let scripthash = address_scripthash(&address, network)?;

    Ok(AddressInfo {
        address,
        index,
        derivation_path: keys::derivation_path(network, 1, index, address_type),
        scripthash,
    })
}
