//! Address listing and allocation of unused receive addresses.

use serde::Serialize;

use crate::backend::Backend;
use crate::error::WalletError;
use crate::storage::Storage;

#[derive(Debug, Clone, Serialize)]
pub struct AddressDetail {
    pub address: String,
    pub index: u32,
    pub derivation_path: String,
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub total: i64,
    pub tx_count: usize,
    pub used: bool,
    pub spent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressListing {
    pub addresses: Vec<AddressDetail>,
    pub address_count: usize,
    pub used_count: usize,
    pub unused_count: usize,
    pub total_confirmed: i64,
    pub total_unconfirmed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnusedAddress {
    pub address: String,
    pub index: u32,
    pub derivation_path: String,
}

impl<S: Storage> Backend<S> {
    /// List every stored address with its balance, history count and flags.
    pub async fn list_addresses(&self, name: &str) -> Result<AddressListing, WalletError> {
        log::debug!("reading wallet addresses: wallet={}", name);

        self.require_wallet(name)?;
        let addresses = self.stored_addresses(name)?;

        let mut session = self.indexer_session().await?;
        let wallet_cache = self.cache().wallet_cache(name);

        let mut details = Vec::with_capacity(addresses.len());
        for addr in &addresses {
            let snapshot = self.address_snapshot(&mut session, &wallet_cache, addr).await;
            details.push(AddressDetail {
                address: addr.address.clone(),
                index: addr.index,
                derivation_path: addr.derivation_path.clone(),
                confirmed: snapshot.balance.confirmed,
                unconfirmed: snapshot.balance.unconfirmed,
                total: snapshot.balance.confirmed + snapshot.balance.unconfirmed,
                tx_count: snapshot.history.len(),
                used: !snapshot.history.is_empty(),
                spent: addr.spent,
            });
        }

        let total_confirmed: i64 = details.iter().map(|d| d.confirmed).sum();
        let total_unconfirmed: i64 = details.iter().map(|d| d.unconfirmed).sum();
        let used_count = details.iter().filter(|d| d.used).count();

        log::debug!(
            "addresses read complete: wallet={} count={} used={}",
            name,
            details.len(),
            used_count
        );

        Ok(AddressListing {
            address_count: details.len(),
            used_count,
            unused_count: details.len() - used_count,
            total_confirmed,
            total_unconfirmed,
            total: total_confirmed + total_unconfirmed,
            addresses: details,
        })
    }

    /// Return up to `count` unused addresses, reusing fresh stored records
    /// first and deriving new indices when exhausted.
    pub async fn generate_addresses(
        &self,
        name: &str,
        count: u32,
    ) -> Result<Vec<UnusedAddress>, WalletError> {
        log::debug!("generating addresses: wallet={} count={}", name, count);

        if count < 1 {
            return Err(WalletError::InvalidInput(
                "count must be at least 1".to_string(),
            ));
        }
        if count > 100 {
            return Err(WalletError::InvalidInput(
                "count must not exceed 100".to_string(),
            ));
        }

        let mut wallet = self.require_wallet(name)?;
        let network = self.network()?;
        let addresses = self.stored_addresses(name)?;

        let mut session = self.indexer_session().await?;
        let wallet_cache = self.cache().wallet_cache(name);

        let mut unused: Vec<UnusedAddress> = Vec::new();

        for addr in &addresses {
            if unused.len() >= count as usize {
                break;
            }
            // Spent addresses are never handed out again.
            if addr.spent {
                continue;
            }

            let snapshot = self.address_snapshot(&mut session, &wallet_cache, addr).await;
            if snapshot.history.is_empty() {
                unused.push(UnusedAddress {
                    address: addr.address.clone(),
                    index: addr.index,
                    derivation_path: addr.derivation_path.clone(),
                });
            }
        }

        while unused.len() < count as usize {
            let info = self.register_external_address(&mut wallet, network)?;
            unused.push(UnusedAddress {
                address: info.address,
                index: info.index,
                derivation_path: info.derivation_path,
            });
        }

        log::debug!("addresses generated: wallet={} count={}", name, unused.len());
        Ok(unused)
    }
}
