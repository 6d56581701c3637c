//! Compaction: delete address records that are provably spent and empty,
//! advancing the first-active watermark.

use serde::Serialize;

use crate::backend::{Backend, IndexerSession};
use crate::error::WalletError;
use crate::storage::Storage;

#[derive(Debug, Clone, Serialize)]
pub struct CompactionResult {
    pub previous_first_active: u32,
    pub new_first_active: u32,
    pub addresses_deleted: usize,
    pub addresses_remaining: u32,
}

impl<S: Storage> Backend<S> {
    pub async fn compact_wallet(&self, name: &str) -> Result<CompactionResult, WalletError> {
        log::debug!("compacting wallet: wallet={}", name);
        let mut session = self.indexer_session().await?;
        self.run_compaction(&mut session, name).await
    }

    /// Advance the watermark while each index is spent with zero balance.
    /// Conservative: the walk stops at the first address that is unspent,
    /// holds a balance, or cannot be checked.
    pub(crate) async fn run_compaction(
        &self,
        session: &mut IndexerSession,
        wallet_name: &str,
    ) -> Result<CompactionResult, WalletError> {
        let mut wallet = self.require_wallet(wallet_name)?;
        let addresses = self.stored_addresses(wallet_name)?;

        let previous_first_active = wallet.first_active_index;
        let mut new_first_active = wallet.first_active_index;

        for index in wallet.first_active_index..wallet.next_address_index {
            // A missing record cannot be proven spent; stop here.
            let Some(addr) = addresses.iter().find(|a| a.index == index) else {
                break;
            };

            if !addr.spent {
                break;
            }

            let balance = match session.client.get_balance(&addr.scripthash).await {
                Ok(balance) => balance,
                Err(e) => {
                    log::warn!(
                        "failed to get balance: address={} error={}",
                        addr.address,
                        e
                    );
                    break;
                }
            };

            if balance.confirmed > 0 || balance.unconfirmed > 0 {
                log::debug!(
                    "address has balance, stopping compaction: address={} confirmed={}",
                    addr.address,
                    balance.confirmed
                );
                break;
            }

            new_first_active = index + 1;
        }

        let mut deleted = 0;
        for addr in &addresses {
            if addr.index < new_first_active {
                match self.delete_address_record(wallet_name, addr.index) {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        log::warn!(
                            "failed to delete address: index={} error={}",
                            addr.index,
                            e
                        );
                    }
                }
            }
        }

        if new_first_active != wallet.first_active_index {
            wallet.first_active_index = new_first_active;
            self.save_wallet(&wallet)?;
        }

        self.cache().invalidate_wallet(wallet_name);

        log::info!(
            "wallet compacted: wallet={} previous_first_active={} new_first_active={} addresses_deleted={}",
            wallet_name,
            previous_first_active,
            new_first_active,
            deleted
        );

        Ok(CompactionResult {
            previous_first_active,
            new_first_active,
            addresses_deleted: deleted,
            addresses_remaining: wallet.next_address_index - new_first_active,
        })
    }
}
