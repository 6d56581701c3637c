use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("address at index {0} not found")]
    AddressNotFound(u32),

    #[error("insufficient funds: have {available}, need {needed} + {fee} fee")]
    InsufficientFunds {
        available: i64,
        needed: i64,
        fee: i64,
    },

    #[error("output value {value} is below dust limit {limit}")]
    DustOutput { value: i64, limit: i64 },

    #[error("no UTXOs available")]
    NoUtxos,

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("indexer protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record at {0}")]
    CorruptRecord(String),
}

impl IntoResponse for WalletError {
    fn into_response(self) -> Response {
        let status = match self {
            WalletError::InvalidInput(_)
            | WalletError::InsufficientFunds { .. }
            | WalletError::DustOutput { .. }
            | WalletError::NoUtxos => StatusCode::BAD_REQUEST,
            WalletError::WalletNotFound(_) | WalletError::AddressNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            WalletError::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
            WalletError::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
