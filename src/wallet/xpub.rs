//! Account xpub export for watch-only wallets, plus the BIP21 receive URI.

use serde::Serialize;

use crate::backend::Backend;
use crate::bitcoin::keys;
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::{AddressType, Storage};

#[derive(Debug, Clone, Serialize)]
pub struct XpubInfo {
    pub xpub: String,
    pub format: &'static str,
    pub derivation_path: String,
    pub address_type: AddressType,
    pub network: Network,
    pub descriptor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiveUri {
    pub address: String,
    pub index: u32,
    pub uri: String,
}

impl<S: Storage> Backend<S> {
    /// Export the account-level extended public key (zpub/vpub for p2wpkh
    /// per SLIP-0132, plain xpub/tpub for p2tr) with a descriptor template
    /// for wallet import.
    pub fn export_xpub(&self, name: &str) -> Result<XpubInfo, WalletError> {
        log::debug!("reading wallet xpub: wallet={}", name);

        let wallet = self.require_wallet(name)?;
        let network = self.network()?;

        let (xpub, derivation_path) =
            keys::account_xpub(&wallet.seed, network, wallet.address_type)?;

        let format = match (wallet.address_type, network) {
            (AddressType::P2wpkh, Network::Mainnet) => "zpub",
            (AddressType::P2wpkh, _) => "vpub",
            (AddressType::P2tr, Network::Mainnet) => "xpub",
            (AddressType::P2tr, _) => "tpub",
        };

        let script_fn = match wallet.address_type {
            AddressType::P2wpkh => "wpkh",
            AddressType::P2tr => "tr",
        };
        let descriptor = format!(
            "{}([fingerprint{}]{}/<0;1>/*)",
            script_fn,
            &derivation_path[1..],
            xpub
        );

        log::debug!("xpub read complete: wallet={} format={}", name, format);

        Ok(XpubInfo {
            xpub,
            format,
            derivation_path,
            address_type: wallet.address_type,
            network,
            descriptor,
        })
    }

    /// BIP21 URI for the current receive address.
    pub async fn receive_uri(&self, name: &str) -> Result<ReceiveUri, WalletError> {
        let status = self.read_wallet(name).await?;

        let (address, index) = status
            .receive_address
            .zip(status.receive_index)
            .ok_or_else(|| {
                WalletError::InvalidInput(format!(
                    "no unused address available for wallet {:?} - generate one first",
                    name
                ))
            })?;

        Ok(ReceiveUri {
            uri: format!("bitcoin:{}", address),
            address,
            index,
        })
    }
}
