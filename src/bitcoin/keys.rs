//! HD key derivation (BIP32/BIP84/BIP86) and account xpub export.

use bitcoin::base58;
use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::config::Network;
use crate::error::WalletError;
use crate::storage::{AddressType, SEED_LENGTH};

/// Purpose level for native SegWit (P2WPKH).
pub const BIP84_PURPOSE: u32 = 84;

/// Purpose level for Taproot (P2TR).
pub const BIP86_PURPOSE: u32 = 86;

/// SLIP-0132 version bytes: zpub (mainnet native segwit).
const ZPUB_VERSION: [u8; 4] = [0x04, 0xb2, 0x47, 0x46];

/// SLIP-0132 version bytes: vpub (testnet native segwit).
const VPUB_VERSION: [u8; 4] = [0x04, 0x5f, 0x1c, 0xf6];

/// BIP32 version bytes of standard xpub/tpub encodings, checked before the
/// SLIP-0132 replacement.
const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];
const TPUB_VERSION: [u8; 4] = [0x04, 0x35, 0x87, 0xcf];

/// Generate a wallet seed from the OS CSPRNG.
pub fn generate_seed() -> [u8; SEED_LENGTH] {
    let mut seed = [0u8; SEED_LENGTH];
    OsRng.fill_bytes(&mut seed);
    seed
}

fn purpose_for(address_type: AddressType) -> u32 {
    match address_type {
        AddressType::P2wpkh => BIP84_PURPOSE,
        AddressType::P2tr => BIP86_PURPOSE,
    }
}

/// Derive the account extended key for an address type.
/// BIP84 path: m/84'/coin'/account' (P2WPKH); BIP86: m/86'/coin'/account'.
pub fn derive_account_key(
    seed: &[u8],
    network: Network,
    account: u32,
    address_type: AddressType,
) -> Result<Xpriv, WalletError> {
    let secp = Secp256k1::new();

    let master = Xpriv::new_master(network.chain_params(), seed)
        .map_err(|e| WalletError::Derivation(format!("failed to create master key: {}", e)))?;

    let path = [
        hardened(purpose_for(address_type))?,
        hardened(network.coin_type())?,
        hardened(account)?,
    ];

    master
        .derive_priv(&secp, &path)
        .map_err(|e| WalletError::Derivation(format!("failed to derive account key: {}", e)))
}

/// Derive a key for a specific address index below an account key.
/// Path suffix: /chain/index with chain 0 = external, 1 = internal.
pub fn derive_address_key(
    account_key: &Xpriv,
    chain: u32,
    index: u32,
) -> Result<Xpriv, WalletError> {
    let secp = Secp256k1::new();

    let path = [normal(chain)?, normal(index)?];
    account_key
        .derive_priv(&secp, &path)
        .map_err(|e| WalletError::Derivation(format!("failed to derive address key: {}", e)))
}

/// Derive a receiving (external chain) key: m/purpose'/coin'/0'/0/index.
pub fn derive_receiving_key(
    seed: &[u8],
    network: Network,
    index: u32,
    address_type: AddressType,
) -> Result<Xpriv, WalletError> {
    let account = derive_account_key(seed, network, 0, address_type)?;
    derive_address_key(&account, 0, index)
}

/// Derive a change (internal chain) key: m/purpose'/coin'/0'/1/index.
pub fn derive_change_key(
    seed: &[u8],
    network: Network,
    index: u32,
    address_type: AddressType,
) -> Result<Xpriv, WalletError> {
    let account = derive_account_key(seed, network, 0, address_type)?;
    derive_address_key(&account, 1, index)
}

/// Extract the EC private key scalar from an extended key.
pub fn private_ec_key(key: &Xpriv) -> SecretKey {
    key.private_key
}

/// Extract the compressed EC public key from an extended key.
pub fn public_ec_key(key: &Xpriv) -> PublicKey {
    let secp = Secp256k1::new();
    key.private_key.public_key(&secp)
}

/// Derivation path string for an address: m/purpose'/coin'/0'/chain/index.
pub fn derivation_path(
    network: Network,
    chain: u32,
    index: u32,
    address_type: AddressType,
) -> String {
    format!(
        "m/{}'/{}'/0'/{}/{}",
        purpose_for(address_type),
        network.coin_type(),
        chain,
        index
    )
}

/// Export the account-level extended public key for watch-only import.
///
/// For BIP84 (p2wpkh) the standard xpub/tpub is re-encoded with SLIP-0132
/// version bytes (zpub on mainnet, vpub on test networks) so wallets like
/// Sparrow recognize the script type from the prefix. BIP86 (p2tr) has no
/// SLIP-0132 assignment and keeps the standard encoding.
///
/// Returns the encoded key and its derivation path.
pub fn account_xpub(
    seed: &[u8],
    network: Network,
    address_type: AddressType,
) -> Result<(String, String), WalletError> {
    let secp = Secp256k1::new();
    let account_key = derive_account_key(seed, network, 0, address_type)?;
    let account_pub = Xpub::from_priv(&secp, &account_key);

    let path = format!(
        "m/{}'/{}'/0'",
        purpose_for(address_type),
        network.coin_type()
    );

    let encoded = match address_type {
        AddressType::P2wpkh => convert_to_slip132(&account_pub.to_string(), network)?,
        AddressType::P2tr => account_pub.to_string(),
    };

    Ok((encoded, path))
}

/// Re-encode a standard xpub/tpub with SLIP-0132 zpub/vpub version bytes.
fn convert_to_slip132(xpub: &str, network: Network) -> Result<String, WalletError> {
    let decoded = base58::decode_check(xpub)
        .map_err(|e| WalletError::Derivation(format!("invalid xpub encoding: {}", e)))?;

    if decoded.len() != 78 {
        return Err(WalletError::Derivation(format!(
            "unexpected xpub payload length: {}",
            decoded.len()
        )));
    }

    let expected = match network {
        Network::Mainnet => XPUB_VERSION,
        Network::Testnet4 | Network::Signet => TPUB_VERSION,
    };
    if decoded[..4] != expected {
        return Err(WalletError::Derivation(format!(
            "unexpected version bytes: got {:02x?}, expected {:02x?}",
            &decoded[..4],
            expected
        )));
    }

    let version = match network {
        Network::Mainnet => ZPUB_VERSION,
        Network::Testnet4 | Network::Signet => VPUB_VERSION,
    };

    let mut payload = version.to_vec();
    payload.extend_from_slice(&decoded[4..]);
    Ok(base58::encode_check(&payload))
}

fn hardened(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_hardened_idx(index)
        .map_err(|e| WalletError::Derivation(format!("invalid hardened index {}: {}", index, e)))
}

fn normal(index: u32) -> Result<ChildNumber, WalletError> {
    ChildNumber::from_normal_idx(index)
        .map_err(|e| WalletError::Derivation(format!("invalid child index {}: {}", index, e)))
}
