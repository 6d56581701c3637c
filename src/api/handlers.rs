//! Thin adapters between HTTP requests and engine operations.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::types::*;
use super::AppState;
use crate::error::WalletError;
use crate::wallet::addresses::{AddressListing, UnusedAddress};
use crate::wallet::compact::CompactionResult;
use crate::wallet::consolidate::{ConsolidateRequest, ConsolidateResult};
use crate::wallet::psbt::{
    PsbtCreateRequest, PsbtCreateResult, PsbtFinalizeResult, PsbtSignResult,
};
use crate::wallet::scan::{ScanRequest, ScanResult};
use crate::wallet::send::{SendRequest, SendResult};
use crate::wallet::utxos::UtxoListing;
use crate::wallet::wallets::WalletStatus;
use crate::wallet::xpub::{ReceiveUri, XpubInfo};

// ----- config -----

pub async fn read_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigResponse>, WalletError> {
    let config = state
        .backend
        .get_config()?
        .ok_or_else(|| WalletError::InvalidInput("engine is not configured".to_string()))?;

    let (electrum_url, electrum_pool) = match config.electrum_url.clone() {
        Some(url) => (Some(url), None),
        None => (None, Some(config.network.default_servers().to_vec())),
    };

    Ok(Json(ConfigResponse {
        network: config.network,
        min_confirmations: config.min_confirmations,
        electrum_url,
        electrum_pool,
    }))
}

pub async fn write_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ConfigBody>,
) -> Result<StatusCode, WalletError> {
    let mut config = state.backend.get_config()?.unwrap_or_default();

    if let Some(url) = body.electrum_url {
        config.electrum_url = if url.is_empty() { None } else { Some(url) };
    }
    if let Some(network) = body.network {
        config.network = network;
    }
    if let Some(min_confirmations) = body.min_confirmations {
        config.min_confirmations = min_confirmations;
    }

    state.backend.put_config(&config)?;
    // New settings take effect on the next connection.
    state.backend.reset().await;

    log::info!(
        "config saved: network={} electrum_url={:?} min_confirmations={}",
        config.network,
        config.electrum_url,
        config.min_confirmations
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_config(
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, WalletError> {
    state.backend.delete_config()?;
    state.backend.reset().await;
    log::info!("config deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ----- wallets -----

pub async fn list_wallets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, WalletError> {
    let wallets = state.backend.list_wallets()?;
    Ok(Json(json!({ "wallets": wallets })))
}

pub async fn read_wallet(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<WalletStatus>, WalletError> {
    Ok(Json(state.backend.read_wallet(&name).await?))
}

pub async fn create_wallet(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<CreateWalletBody>>,
) -> Result<Json<WalletStatus>, WalletError> {
    let Json(body) = body.unwrap_or_default();
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    Ok(Json(state.backend.create_wallet(
        &name,
        body.description,
        body.address_type,
    )?))
}

pub async fn update_wallet(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<UpdateWalletBody>,
) -> Result<Json<WalletStatus>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    Ok(Json(state.backend.update_wallet(&name, body.description)?))
}

pub async fn delete_wallet(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    let addresses_deleted = state.backend.delete_wallet(&name)?;
    Ok(Json(json!({ "addresses_deleted": addresses_deleted })))
}

// ----- addresses -----

pub async fn list_addresses(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AddressListing>, WalletError> {
    Ok(Json(state.backend.list_addresses(&name).await?))
}

pub async fn generate_addresses(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<GenerateAddressesBody>,
) -> Result<Json<serde_json::Value>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    let addresses: Vec<UnusedAddress> =
        state.backend.generate_addresses(&name, body.count).await?;
    Ok(Json(json!({
        "addresses": addresses,
        "count": addresses.len(),
    })))
}

// ----- utxos / xpub / qr -----

pub async fn list_utxos(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<UtxosQuery>,
) -> Result<Json<UtxoListing>, WalletError> {
    Ok(Json(
        state
            .backend
            .list_utxos(&name, query.min_confirmations)
            .await?,
    ))
}

pub async fn read_xpub(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<XpubInfo>, WalletError> {
    Ok(Json(state.backend.export_xpub(&name)?))
}

pub async fn read_qr(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ReceiveUri>, WalletError> {
    Ok(Json(state.backend.receive_uri(&name).await?))
}

// ----- spending -----

pub async fn send(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<SendBody>,
) -> Result<Json<SendResult>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    let request = SendRequest {
        to: body.to,
        amount: body.amount,
        fee_rate: body.fee_rate,
        min_confirmations: body.min_confirmations,
        dry_run: body.dry_run,
        max_send: body.max_send,
    };
    Ok(Json(state.backend.send(&name, request).await?))
}

pub async fn consolidate(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<ConsolidateBody>,
) -> Result<Json<ConsolidateResult>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    let request = ConsolidateRequest {
        fee_rate: body.fee_rate,
        min_confirmations: body.min_confirmations,
        below_value: body.below_value,
        dry_run: body.dry_run,
        compact: body.compact,
    };
    Ok(Json(state.backend.consolidate(&name, request).await?))
}

pub async fn compact(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<CompactionResult>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    Ok(Json(state.backend.compact_wallet(&name).await?))
}

pub async fn scan(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<ScanBody>>,
) -> Result<Json<ScanResult>, WalletError> {
    let Json(body) = body.unwrap_or_default();
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    let request = ScanRequest {
        retired: body.retired,
        gap: body.gap,
        sweep: body.sweep,
        fee_rate: body.fee_rate,
    };
    Ok(Json(state.backend.scan_wallet(&name, request).await?))
}

// ----- psbt -----

pub async fn psbt_create(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<PsbtCreateBody>,
) -> Result<Json<PsbtCreateResult>, WalletError> {
    let lock = state.wallet_lock(&name).await;
    let _guard = lock.lock().await;

    let request = PsbtCreateRequest {
        outputs: body.outputs,
        fee_rate: body.fee_rate,
        min_confirmations: body.min_confirmations,
    };
    Ok(Json(state.backend.create_psbt(&name, request).await?))
}

pub async fn psbt_sign(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<PsbtSignBody>,
) -> Result<Json<PsbtSignResult>, WalletError> {
    Ok(Json(state.backend.sign_wallet_psbt(&name, &body.psbt).await?))
}

pub async fn psbt_finalize(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<PsbtFinalizeBody>,
) -> Result<Json<PsbtFinalizeResult>, WalletError> {
    Ok(Json(
        state
            .backend
            .finalize_wallet_psbt(&name, &body.psbt, body.broadcast)
            .await?,
    ))
}
