//! Recovery scans: retired addresses below the first-active watermark and
//! a bounded gap look-ahead past the next allocation index, with an
//! optional sweep of retired funds.

use serde::Serialize;

use crate::backend::Backend;
use crate::bitcoin::address::{generate_address_info, script_pubkey};
use crate::bitcoin::transaction::{
    self, build_consolidation_transaction, estimate_fee_for_utxos, Utxo, DUST_LIMIT,
};
use crate::error::WalletError;
use crate::storage::{Storage, StoredAddress};

#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Scan addresses below first_active_index.
    pub retired: bool,
    /// Scan this many addresses beyond next_address_index.
    pub gap: u32,
    /// Sweep found retired funds to a fresh address.
    pub sweep: bool,
    pub fee_rate: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FoundAddress {
    pub address: String,
    pub index: u32,
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisteredAddress {
    pub address: String,
    pub index: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_scanned: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retired_found: Vec<FoundAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_scanned: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gap_found: Vec<FoundAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_total: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gap_registered: Vec<RegisteredAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_next_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_broadcast: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_fee: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_output: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_error: Option<String>,
    pub total_found: i64,
    pub message: String,
}

impl<S: Storage> Backend<S> {
    pub async fn scan_wallet(
        &self,
        name: &str,
        request: ScanRequest,
    ) -> Result<ScanResult, WalletError> {
        let ScanRequest {
            retired,
            gap,
            sweep,
            fee_rate,
        } = request;

        log::debug!(
            "scanning wallet: wallet={} retired={} gap={} sweep={}",
            name,
            retired,
            gap,
            sweep
        );

        if sweep {
            if fee_rate <= 0 {
                return Err(WalletError::InvalidInput(
                    "fee_rate must be positive when sweep=true".to_string(),
                ));
            }
            transaction::validate_fee_rate(fee_rate)?;
        }

        let mut wallet = self.require_wallet(name)?;
        let network = self.network()?;
        let mut session = self.indexer_session().await?;

        let mut result = ScanResult::default();

        // ----- retired address scan -----
        let mut retired_total: i64 = 0;
        let mut utxos_for_sweep: Vec<Utxo> = Vec::new();

        if retired && wallet.first_active_index > 0 {
            log::debug!(
                "scanning retired addresses: count={}",
                wallet.first_active_index
            );

            for index in 0..wallet.first_active_index {
                let info = match generate_address_info(
                    &wallet.seed,
                    network,
                    index,
                    wallet.address_type,
                ) {
                    Ok(info) => info,
                    Err(e) => {
                        log::warn!("failed to regenerate address: index={} error={}", index, e);
                        continue;
                    }
                };

                let balance = match self
                    .balance_with_retry(&mut session, &info.scripthash)
                    .await
                {
                    Ok(balance) => balance,
                    Err(e) => {
                        log::warn!(
                            "failed to get balance: address={} error={}",
                            info.address,
                            e
                        );
                        continue;
                    }
                };

                let total = balance.confirmed + balance.unconfirmed;
                if total <= 0 {
                    continue;
                }

                log::warn!(
                    "found funds on retired address: address={} index={} confirmed={} unconfirmed={}",
                    info.address,
                    index,
                    balance.confirmed,
                    balance.unconfirmed
                );

                result.retired_found.push(FoundAddress {
                    address: info.address.clone(),
                    index,
                    confirmed: balance.confirmed,
                    unconfirmed: balance.unconfirmed,
                    total,
                });
                retired_total += total;

                if sweep {
                    let unspent = match session.client.list_unspent(&info.scripthash).await {
                        Ok(unspent) => unspent,
                        Err(e) => {
                            log::warn!(
                                "failed to list unspent: address={} error={}",
                                info.address,
                                e
                            );
                            continue;
                        }
                    };
                    let script = match script_pubkey(&info.address, network) {
                        Ok(script) => script,
                        Err(e) => {
                            log::warn!(
                                "failed to get scriptPubKey: address={} error={}",
                                info.address,
                                e
                            );
                            continue;
                        }
                    };

                    for u in unspent {
                        utxos_for_sweep.push(Utxo {
                            txid: u.tx_hash,
                            vout: u.tx_pos,
                            value: u.value,
                            address: info.address.clone(),
                            address_index: index,
                            script_pub_key: script.clone(),
                            address_type: Some(wallet.address_type),
                        });
                    }
                }
            }

            result.retired_scanned = Some(wallet.first_active_index);
            result.retired_total = Some(retired_total);
        }

        // ----- gap scan ahead of the allocation index -----
        let mut gap_total: i64 = 0;
        let mut highest_found: Option<u32> = None;

        if gap > 0 {
            let start = wallet.next_address_index;
            let end = start + gap;
            log::debug!("scanning gap addresses: start={} end={}", start, end);

            for index in start..end {
                let info = match generate_address_info(
                    &wallet.seed,
                    network,
                    index,
                    wallet.address_type,
                ) {
                    Ok(info) => info,
                    Err(e) => {
                        log::warn!("failed to generate address: index={} error={}", index, e);
                        continue;
                    }
                };

                let balance = match self
                    .balance_with_retry(&mut session, &info.scripthash)
                    .await
                {
                    Ok(balance) => balance,
                    Err(e) => {
                        log::warn!(
                            "failed to get balance: address={} error={}",
                            info.address,
                            e
                        );
                        continue;
                    }
                };

                let total = balance.confirmed + balance.unconfirmed;
                if total <= 0 {
                    continue;
                }

                log::info!(
                    "found funds on untracked address: address={} index={} confirmed={} unconfirmed={}",
                    info.address,
                    index,
                    balance.confirmed,
                    balance.unconfirmed
                );

                result.gap_found.push(FoundAddress {
                    address: info.address.clone(),
                    index,
                    confirmed: balance.confirmed,
                    unconfirmed: balance.unconfirmed,
                    total,
                });
                gap_total += total;
                highest_found = Some(highest_found.map_or(index, |h| h.max(index)));

                if let Err(e) = self.store_address_record(
                    name,
                    &StoredAddress {
                        address: info.address.clone(),
                        index,
                        derivation_path: info.derivation_path,
                        scripthash: info.scripthash,
                        spent: false,
                    },
                ) {
                    log::warn!("failed to store address: index={} error={}", index, e);
                    continue;
                }

                result.gap_registered.push(RegisteredAddress {
                    address: info.address,
                    index,
                });
            }

            // Found indices must leave no holes behind them: register every
            // intermediate address and advance the allocation index past the
            // highest find.
            if let Some(highest) = highest_found {
                let new_next_index = highest + 1;
                log::info!(
                    "updating next_address_index: old={} new={}",
                    wallet.next_address_index,
                    new_next_index
                );

                for fill_index in wallet.next_address_index..new_next_index {
                    if result.gap_registered.iter().any(|r| r.index == fill_index) {
                        continue;
                    }

                    let info = match generate_address_info(
                        &wallet.seed,
                        network,
                        fill_index,
                        wallet.address_type,
                    ) {
                        Ok(info) => info,
                        Err(e) => {
                            log::warn!(
                                "failed to generate gap-fill address: index={} error={}",
                                fill_index,
                                e
                            );
                            continue;
                        }
                    };

                    if let Err(e) = self.store_address_record(
                        name,
                        &StoredAddress {
                            address: info.address.clone(),
                            index: fill_index,
                            derivation_path: info.derivation_path,
                            scripthash: info.scripthash,
                            spent: false,
                        },
                    ) {
                        log::warn!(
                            "failed to store gap-fill address: index={} error={}",
                            fill_index,
                            e
                        );
                        continue;
                    }

                    log::debug!(
                        "filled gap address: index={} address={}",
                        fill_index,
                        info.address
                    );
                }

                wallet.next_address_index = new_next_index;
                self.save_wallet(&wallet)?;
                result.new_next_index = Some(new_next_index);
            }

            result.gap_scanned = Some(gap);
            result.gap_total = Some(gap_total);
        }

        // ----- sweep retired funds -----
        if sweep && !utxos_for_sweep.is_empty() {
            // Pre-validate before touching any state, so a dust-level sweep
            // does not burn an address allocation.
            let sweep_total: i64 = utxos_for_sweep.iter().map(|u| u.value).sum();
            let estimated_fee = estimate_fee_for_utxos(
                &utxos_for_sweep,
                1,
                fee_rate,
                Some(wallet.address_type),
            );
            let sweep_output = sweep_total - estimated_fee;

            if sweep_output <= 0 {
                return Err(WalletError::InsufficientFunds {
                    available: sweep_total,
                    needed: 0,
                    fee: estimated_fee,
                });
            }
            if sweep_output < DUST_LIMIT {
                return Err(WalletError::DustOutput {
                    value: sweep_output,
                    limit: DUST_LIMIT,
                });
            }

            let destination = self.register_external_address(&mut wallet, network)?.address;

            let tx_result = build_consolidation_transaction(
                &wallet.seed,
                network,
                &utxos_for_sweep,
                &destination,
                fee_rate,
            )?;

            match session.client.broadcast_transaction(&tx_result.hex).await {
                Err(e) => {
                    log::warn!("sweep broadcast failed: wallet={} error={}", name, e);
                    result.sweep_broadcast = Some(false);
                    result.sweep_error = Some(e.to_string());
                    result.sweep_hex = Some(tx_result.hex);
                }
                Ok(txid) => {
                    self.cache().invalidate_wallet(name);
                    log::info!(
                        "sweep broadcast successful: wallet={} txid={} swept_addresses={} total_swept={} fee={}",
                        name,
                        txid,
                        result.retired_found.len(),
                        retired_total,
                        tx_result.fee
                    );

                    result.sweep_broadcast = Some(true);
                    result.sweep_txid = Some(txid);
                    result.sweep_fee = Some(tx_result.fee);
                    result.sweep_output = Some(tx_result.total_output);
                    result.sweep_address = Some(destination);
                }
            }
        }

        // ----- summary -----
        result.total_found = retired_total + gap_total;
        result.message = if result.total_found == 0 {
            match (retired, gap > 0) {
                (true, true) => "no funds found on retired or gap addresses".to_string(),
                (true, false) => "no funds found on retired addresses".to_string(),
                (false, true) => "no funds found in gap scan".to_string(),
                (false, false) => String::new(),
            }
        } else {
            let mut parts = Vec::new();
            if retired_total > 0 {
                parts.push(format!(
                    "{} sats on {} retired",
                    retired_total,
                    result.retired_found.len()
                ));
            }
            if gap_total > 0 {
                parts.push(format!(
                    "{} sats on {} untracked (now registered)",
                    gap_total,
                    result.gap_found.len()
                ));
            }
            format!("found: {}", parts.join(", "))
        };

        Ok(result)
    }
}
