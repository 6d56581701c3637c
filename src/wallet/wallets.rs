//! Wallet record lifecycle: create, read with live balances, list, update,
//! delete.

use chrono::Utc;
use serde::Serialize;

use super::{address_prefix, wallet_key};
use crate::backend::Backend;
use crate::bitcoin::{address, keys};
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::{AddressType, Storage, StoredAddress, WalletRecord};

/// Address records generated atomically with a new wallet.
const INITIAL_ADDRESS_COUNT: u32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct WalletStatus {
    pub name: String,
    pub network: Network,
    pub address_type: AddressType,
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub total: i64,
    pub address_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_index: Option<u32>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl<S: Storage> Backend<S> {
    pub fn list_wallets(&self) -> Result<Vec<String>, WalletError> {
        log::debug!("listing wallets");
        Ok(self.storage().list(super::WALLETS_STORAGE_PREFIX)?)
    }

    /// Create a wallet: generate a seed, persist the record and its first
    /// five external addresses.
    pub fn create_wallet(
        &self,
        name: &str,
        description: Option<String>,
        address_type: AddressType,
    ) -> Result<WalletStatus, WalletError> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(WalletError::InvalidInput(format!(
                "wallet name {:?} must be a lowercase identifier",
                name
            )));
        }

        if self.get_wallet(name)?.is_some() {
            return Err(WalletError::InvalidInput(format!(
                "wallet {:?} already exists",
                name
            )));
        }

        let network = self.network()?;
        log::info!("creating new wallet: name={} address_type={}", name, address_type);

        let mut wallet = WalletRecord {
            name: name.to_string(),
            description,
            seed: keys::generate_seed(),
            address_type,
            next_address_index: 0,
            first_active_index: 0,
            created_at: Utc::now(),
        };

        for index in 0..INITIAL_ADDRESS_COUNT {
            let info =
                address::generate_address_info(&wallet.seed, network, index, address_type)?;
            self.store_address_record(
                name,
                &StoredAddress {
                    address: info.address,
                    index: info.index,
                    derivation_path: info.derivation_path,
                    scripthash: info.scripthash,
                    spent: false,
                },
            )?;
        }

        wallet.next_address_index = INITIAL_ADDRESS_COUNT;
        self.save_wallet(&wallet)?;

        let addresses = self.stored_addresses(name)?;
        let first = addresses.first();

        Ok(WalletStatus {
            name: wallet.name.clone(),
            network,
            address_type,
            confirmed: 0,
            unconfirmed: 0,
            total: 0,
            address_count: addresses.len(),
            receive_address: first.map(|a| a.address.clone()),
            receive_index: first.map(|a| a.index),
            created_at: wallet.created_at.to_rfc3339(),
            description: wallet.description,
            warning: None,
        })
    }

    /// Update the mutable parts of a wallet record (description only; the
    /// address type and seed are immutable).
    pub fn update_wallet(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<WalletStatus, WalletError> {
        let mut wallet = self.require_wallet(name)?;
        if let Some(description) = description {
            wallet.description = Some(description);
        }
        self.save_wallet(&wallet)?;

        let network = self.network()?;
        let addresses = self.stored_addresses(name)?;

        Ok(WalletStatus {
            name: wallet.name.clone(),
            network,
            address_type: wallet.address_type,
            confirmed: 0,
            unconfirmed: 0,
            total: 0,
            address_count: addresses.len(),
            receive_address: None,
            receive_index: None,
            created_at: wallet.created_at.to_rfc3339(),
            description: wallet.description,
            warning: None,
        })
    }

    /// Read a wallet with aggregated balances and the first unused receive
    /// address (skipping spent records and anything with history).
    pub async fn read_wallet(&self, name: &str) -> Result<WalletStatus, WalletError> {
        log::debug!("reading wallet: name={}", name);

        let wallet = self.require_wallet(name)?;
        let network = self.network()?;
        let addresses = self.stored_addresses(name)?;

        let mut session = self.indexer_session().await?;
        let wallet_cache = self.cache().wallet_cache(name);

        let mut confirmed: i64 = 0;
        let mut unconfirmed: i64 = 0;
        let mut receive: Option<(String, u32)> = None;

        log::debug!(
            "checking addresses for wallet: wallet={} address_count={}",
            name,
            addresses.len()
        );

        for addr in &addresses {
            let snapshot = self.address_snapshot(&mut session, &wallet_cache, addr).await;
            confirmed += snapshot.balance.confirmed;
            unconfirmed += snapshot.balance.unconfirmed;

            if receive.is_none() {
                if addr.spent {
                    log::debug!(
                        "address marked as spent, skipping: address={} index={}",
                        addr.address,
                        addr.index
                    );
                } else if !snapshot.history.is_empty() {
                    log::debug!(
                        "address has history, skipping: address={} tx_count={}",
                        addr.address,
                        snapshot.history.len()
                    );
                } else {
                    log::debug!(
                        "found unused address: address={} index={}",
                        addr.address,
                        addr.index
                    );
                    receive = Some((addr.address.clone(), addr.index));
                }
            }
        }

        let warning = if receive.is_none() {
            log::debug!(
                "no unused address available: wallet={} address_count={}",
                name,
                addresses.len()
            );
            Some(format!(
                "no unused address available - generate one via wallets/{}/addresses",
                name
            ))
        } else {
            None
        };

        Ok(WalletStatus {
            name: wallet.name.clone(),
            network,
            address_type: wallet.address_type,
            confirmed,
            unconfirmed,
            total: confirmed + unconfirmed,
            address_count: addresses.len(),
            receive_address: receive.as_ref().map(|(a, _)| a.clone()),
            receive_index: receive.as_ref().map(|(_, i)| *i),
            created_at: wallet.created_at.to_rfc3339(),
            description: wallet.description,
            warning,
        })
    }

    /// Delete a wallet record and every address record under it.
    /// Idempotent: deleting an absent wallet is not an error.
    pub fn delete_wallet(&self, name: &str) -> Result<usize, WalletError> {
        log::debug!("deleting wallet: name={}", name);

        self.cache().invalidate_wallet(name);
        self.storage().delete(&wallet_key(name))?;

        let prefix = address_prefix(name);
        let entries = self.storage().list(&prefix)?;
        for entry in &entries {
            self.storage().delete(&format!("{}{}", prefix, entry))?;
        }

        log::info!(
            "wallet deleted: name={} addresses_deleted={}",
            name,
            entries.len()
        );
        Ok(entries.len())
    }
}
