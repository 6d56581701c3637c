//! Persisted record models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

/// Seed length in bytes (256 bits).
pub const SEED_LENGTH: usize = 32;

/// Script template used for every address of a wallet. Immutable after
/// wallet creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    /// Native SegWit (BIP84)
    P2wpkh,
    /// Taproot key-path only (BIP86)
    #[default]
    P2tr,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::P2wpkh => f.write_str("p2wpkh"),
            AddressType::P2tr => f.write_str("p2tr"),
        }
    }
}

impl FromStr for AddressType {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2wpkh" => Ok(AddressType::P2wpkh),
            "p2tr" => Ok(AddressType::P2tr),
            other => Err(WalletError::InvalidInput(format!(
                "invalid address_type {:?}: must be \"p2tr\" or \"p2wpkh\"",
                other
            ))),
        }
    }
}

/// Wallet record, one per name, stored at `wallets/{name}`.
/// The seed never leaves the record; the host's seal wrap is the enclosing
/// protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub seed: [u8; SEED_LENGTH],
    pub address_type: AddressType,
    /// Next index to allocate on the external chain.
    pub next_address_index: u32,
    /// Addresses below this index are spent+empty and may have their
    /// records deleted.
    #[serde(default)]
    pub first_active_index: u32,
    pub created_at: DateTime<Utc>,
}

/// Address record, keyed by `(wallet, index)` at `addresses/{name}/{index}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAddress {
    pub address: String,
    pub index: u32,
    pub derivation_path: String,
    pub scripthash: String,
    /// True once the address has contributed an input to a broadcast
    /// transaction; never cleared.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub spent: bool,
}
