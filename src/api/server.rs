use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use super::{handlers, AppState};

pub async fn start_server(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = Router::new()
        .route(
            "/api/config",
            get(handlers::read_config)
                .post(handlers::write_config)
                .delete(handlers::delete_config),
        )
        .route("/api/wallets", get(handlers::list_wallets))
        .route(
            "/api/wallets/:name",
            get(handlers::read_wallet)
                .post(handlers::create_wallet)
                .put(handlers::update_wallet)
                .delete(handlers::delete_wallet),
        )
        .route(
            "/api/wallets/:name/addresses",
            get(handlers::list_addresses).post(handlers::generate_addresses),
        )
        .route("/api/wallets/:name/utxos", get(handlers::list_utxos))
        .route("/api/wallets/:name/qr", get(handlers::read_qr))
        .route("/api/wallets/:name/xpub", get(handlers::read_xpub))
        .route("/api/wallets/:name/send", post(handlers::send))
        .route("/api/wallets/:name/psbt/create", post(handlers::psbt_create))
        .route("/api/wallets/:name/psbt/sign", post(handlers::psbt_sign))
        .route(
            "/api/wallets/:name/psbt/finalize",
            post(handlers::psbt_finalize),
        )
        .route(
            "/api/wallets/:name/consolidate",
            post(handlers::consolidate),
        )
        .route("/api/wallets/:name/compact", post(handlers::compact))
        .route(
            "/api/wallets/:name/scan",
            get(handlers::scan).post(handlers::scan),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("wallet service listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
