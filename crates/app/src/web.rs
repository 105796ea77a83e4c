use crate::error::ApiError;
use crate::middleware::gateway;
use crate::routes_admin;
use crate::routes_dashboard;
use crate::routes_oracle;
use crate::routes_webhooks;
use crate::state::SharedState;
use crate::ws::ws_endpoint;
use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{BoxError, Json, Router};
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

pub fn build_router(state: SharedState) -> Router {
    let body_limit = state.config.gateway.body_limit_bytes;
    let timeout_secs = state.config.gateway.body_read_timeout_seconds.max(1);

    Router::new()
        .route("/healthz", get(healthz))
        // Dashboard surface.
        .route("/k-metric", get(routes_dashboard::k_metric))
        .route("/k-metric/history", get(routes_dashboard::k_history))
        .route("/k-metric/holders", get(routes_dashboard::k_holders))
        .route("/k-metric/status", get(routes_dashboard::k_status))
        .route(
            "/k-metric/wallet/:addr/k-score",
            get(routes_dashboard::wallet_k_score),
        )
        .route(
            "/k-metric/wallet/:addr/k-global",
            get(routes_dashboard::wallet_k_global),
        )
        .route("/k-metric/webhook", post(routes_dashboard::push_webhook))
        .route("/k-metric/sync", post(routes_dashboard::trigger_sync))
        .route("/k-metric/backup", post(routes_dashboard::trigger_backup))
        // External oracle surface.
        .route("/api/v1/status", get(routes_oracle::status))
        .route("/api/v1/token/:mint", get(routes_oracle::token_score))
        .route("/api/v1/wallet/:addr", get(routes_oracle::wallet_score))
        .route("/api/v1/wallets", post(routes_oracle::wallets_batch))
        .route("/api/v1/tokens", post(routes_oracle::tokens_batch))
        .route("/api/v1/holders", get(routes_oracle::holders))
        // Webhook subscription management.
        .route("/api/v1/webhooks/events", get(routes_webhooks::events))
        .route(
            "/api/v1/webhooks",
            get(routes_webhooks::list).post(routes_webhooks::create),
        )
        .route(
            "/api/v1/webhooks/:id",
            get(routes_webhooks::show).delete(routes_webhooks::remove),
        )
        .route(
            "/api/v1/webhooks/:id/deliveries",
            get(routes_webhooks::deliveries),
        )
        // Admin surface.
        .route(
            "/admin/keys",
            get(routes_admin::list_keys).post(routes_admin::create_key),
        )
        .route("/admin/keys/:id", delete(routes_admin::deactivate_key))
        .route("/admin/keys/:id/usage", get(routes_admin::key_usage))
        .route("/admin/queues", get(routes_admin::queue_status))
        .route(
            "/admin/k-wallet/backfill",
            post(routes_admin::k_wallet_backfill),
        )
        .route(
            "/admin/tokens/recalculate",
            post(routes_admin::tokens_recalculate),
        )
        // Real-time fan-out.
        .route("/ws", get(ws_endpoint))
        .fallback(not_found)
        .layer(axum::middleware::from_fn_with_state(state.clone(), gateway))
        .layer(RequestBodyLimitLayer::new(body_limit))
        // tower's timeout is fallible, so it cannot sit on the Router
        // directly; HandleErrorLayer turns the elapsed error into a 408.
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(move |error: BoxError| async move {
                    handle_timeout_error(error, timeout_secs)
                }))
                .timeout(Duration::from_secs(timeout_secs)),
        )
        .with_state(state)
}

fn handle_timeout_error(error: BoxError, timeout_secs: u64) -> Response {
    if error.is::<tower::timeout::error::Elapsed>() {
        (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({
                "error": "request_timeout",
                "message": format!("request exceeded the {timeout_secs}s read timeout"),
            })),
        )
            .into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "internal_error",
                "message": error.to_string(),
            })),
        )
            .into_response()
    }
}

pub async fn serve(state: SharedState) -> Result<()> {
    let bind = format!(
        "{}:{}",
        state.config.gateway.host, state.config.gateway.port
    );
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind gateway on {bind}"))?;
    info!(bind = %bind, "gateway started");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("gateway server failed")?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "ts": Utc::now() }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": "unknown route" })),
    )
}

/// Base58 shape check for Solana addresses and mints: the base58 alphabet
/// (no 0, O, I, l) at plausible key length.
pub fn validate_address(value: &str) -> Result<(), ApiError> {
    let value = value.trim();
    if value.len() < 32 || value.len() > 44 {
        return Err(ApiError::validation("address must be 32-44 characters"));
    }
    const ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    if value.chars().any(|ch| !ALPHABET.contains(ch)) {
        return Err(ApiError::validation("address is not valid base58"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_addresses_pass() {
        assert!(validate_address("So11111111111111111111111111111111111111112").is_ok());
        assert!(validate_address("DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263").is_ok());
    }

    #[test]
    fn malformed_addresses_fail_validation() {
        assert!(validate_address("short").is_err());
        assert!(validate_address("0OIl111111111111111111111111111111111111111").is_err());
        assert!(validate_address(&"x".repeat(64)).is_err());
    }
}
