//! Request bodies and query types for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::bitcoin::transaction::DEFAULT_FEE_RATE;
use crate::config::Network;
use crate::storage::AddressType;
use crate::wallet::psbt::PsbtOutput;

fn default_fee_rate() -> i64 {
    DEFAULT_FEE_RATE
}

fn default_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_address_type() -> AddressType {
    AddressType::P2tr
}

#[derive(Debug, Deserialize)]
pub struct ConfigBody {
    #[serde(default)]
    pub electrum_url: Option<String>,
    #[serde(default)]
    pub network: Option<Network>,
    #[serde(default)]
    pub min_confirmations: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub network: Network,
    pub min_confirmations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electrum_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub electrum_pool: Option<Vec<&'static str>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateWalletBody {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_address_type")]
    pub address_type: AddressType,
}

#[derive(Debug, Deserialize)]
pub struct UpdateWalletBody {
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateAddressesBody {
    #[serde(default = "default_count")]
    pub count: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct UtxosQuery {
    #[serde(default)]
    pub min_confirmations: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SendBody {
    pub to: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: i64,
    #[serde(default)]
    pub min_confirmations: Option<u32>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub max_send: bool,
}

#[derive(Debug, Deserialize)]
pub struct ConsolidateBody {
    #[serde(default = "default_fee_rate")]
    pub fee_rate: i64,
    #[serde(default)]
    pub min_confirmations: Option<u32>,
    #[serde(default)]
    pub below_value: i64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub compact: bool,
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    #[serde(default = "default_true")]
    pub retired: bool,
    #[serde(default)]
    pub gap: u32,
    #[serde(default)]
    pub sweep: bool,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: i64,
}

impl Default for ScanBody {
    fn default() -> Self {
        Self {
            retired: true,
            gap: 0,
            sweep: false,
            fee_rate: DEFAULT_FEE_RATE,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PsbtCreateBody {
    pub outputs: Vec<PsbtOutput>,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: i64,
    #[serde(default)]
    pub min_confirmations: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PsbtSignBody {
    pub psbt: String,
}

#[derive(Debug, Deserialize)]
pub struct PsbtFinalizeBody {
    pub psbt: String,
    #[serde(default = "default_true")]
    pub broadcast: bool,
}
