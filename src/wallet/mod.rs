//! Wallet operations: record lifecycle, address management, spending,
//! PSBT workflows, compaction and recovery scans.

pub mod addresses;
pub mod compact;
pub mod consolidate;
pub mod psbt;
pub mod scan;
pub mod send;
pub mod utxos;
pub mod wallets;
pub mod xpub;

use crate::backend::Backend;
use crate::bitcoin::address::{self, AddressInfo};
use crate::config::Network;
use crate::error::WalletError;
use crate::storage::{self, Storage, StoredAddress, WalletRecord};

pub const WALLETS_STORAGE_PREFIX: &str = "wallets/";
pub const ADDRESSES_STORAGE_PREFIX: &str = "addresses/";

fn wallet_key(name: &str) -> String {
    format!("{}{}", WALLETS_STORAGE_PREFIX, name)
}

fn address_key(wallet_name: &str, index: u32) -> String {
    format!("{}{}/{}", ADDRESSES_STORAGE_PREFIX, wallet_name, index)
}

fn address_prefix(wallet_name: &str) -> String {
    format!("{}{}/", ADDRESSES_STORAGE_PREFIX, wallet_name)
}

impl<S: Storage> Backend<S> {
    pub fn get_wallet(&self, name: &str) -> Result<Option<WalletRecord>, WalletError> {
        Ok(storage::get_json(self.storage(), &wallet_key(name))?)
    }

    /// Load a wallet or fail with NotFound.
    pub(crate) fn require_wallet(&self, name: &str) -> Result<WalletRecord, WalletError> {
        self.get_wallet(name)?
            .ok_or_else(|| WalletError::WalletNotFound(name.to_string()))
    }

    pub(crate) fn save_wallet(&self, wallet: &WalletRecord) -> Result<(), WalletError> {
        Ok(storage::put_json(
            self.storage(),
            &wallet_key(&wallet.name),
            wallet,
        )?)
    }

    /// All stored address records for a wallet, sorted by index.
    /// Unreadable entries are skipped.
    pub fn stored_addresses(&self, wallet_name: &str) -> Result<Vec<StoredAddress>, WalletError> {
        let prefix = address_prefix(wallet_name);
        let entries = self.storage().list(&prefix)?;

        let mut records: Vec<StoredAddress> = Vec::with_capacity(entries.len());
        for entry in entries {
            let key = format!("{}{}", prefix, entry);
            match storage::get_json(self.storage(), &key) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("skipping unreadable address record: key={} error={}", key, e);
                    continue;
                }
            }
        }

        records.sort_by_key(|record| record.index);
        Ok(records)
    }

    pub(crate) fn store_address_record(
        &self,
        wallet_name: &str,
        record: &StoredAddress,
    ) -> Result<(), WalletError> {
        Ok(storage::put_json(
            self.storage(),
            &address_key(wallet_name, record.index),
            record,
        )?)
    }

    pub(crate) fn delete_address_record(
        &self,
        wallet_name: &str,
        index: u32,
    ) -> Result<(), WalletError> {
        Ok(self.storage().delete(&address_key(wallet_name, index))?)
    }

    /// Mark addresses as spent after a broadcast. A missing record is
    /// logged and skipped; the transaction is already on the network.
    pub fn mark_addresses_spent(
        &self,
        wallet_name: &str,
        indices: &[u32],
    ) -> Result<(), WalletError> {
        for &index in indices {
            let key = address_key(wallet_name, index);
            let Some(mut record) = storage::get_json::<_, StoredAddress>(self.storage(), &key)?
            else {
                log::warn!(
                    "cannot mark missing address record as spent: wallet={} index={}",
                    wallet_name,
                    index
                );
                continue;
            };
            record.spent = true;
            storage::put_json(self.storage(), &key, &record)?;
        }
        Ok(())
    }

    /// Persist a new external-chain address at the next index and advance
    /// the wallet record.
    pub(crate) fn register_external_address(
        &self,
        wallet: &mut WalletRecord,
        network: Network,
    ) -> Result<AddressInfo, WalletError> {
        let info = address::generate_address_info(
            &wallet.seed,
            network,
            wallet.next_address_index,
            wallet.address_type,
        )?;

        self.store_address_record(
            &wallet.name,
            &StoredAddress {
                address: info.address.clone(),
                index: info.index,
                derivation_path: info.derivation_path.clone(),
                scripthash: info.scripthash.clone(),
                spent: false,
            },
        )?;

        wallet.next_address_index += 1;
        self.save_wallet(wallet)?;
        Ok(info)
    }

    /// Persist a new internal-chain (change) address at the next index and
    /// advance the wallet record. The spent flag is never set here.
    pub(crate) fn allocate_change_address(
        &self,
        wallet: &mut WalletRecord,
        network: Network,
    ) -> Result<AddressInfo, WalletError> {
        let info = address::generate_change_address_info(
            &wallet.seed,
            network,
            wallet.next_address_index,
            wallet.address_type,
        )?;

        self.store_address_record(
            &wallet.name,
            &StoredAddress {
                address: info.address.clone(),
                index: info.index,
                derivation_path: info.derivation_path.clone(),
                scripthash: info.scripthash.clone(),
                spent: false,
            },
        )?;

        wallet.next_address_index += 1;
        self.save_wallet(wallet)?;
        Ok(info)
    }
}
