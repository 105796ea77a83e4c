use crate::error::ApiError;
use crate::gating::ensure_admin;
use crate::rate_limit::tier_limits;
use crate::state::SharedState;
use crate::web::validate_address;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use oracle_core_types::Tier;
use oracle_scoring::{mint_in_ecosystem, WALLET_PRIORITY_STALE};
use oracle_storage::QueueKind;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    name: String,
    tier: String,
    per_minute_limit: Option<u32>,
    per_day_limit: Option<u32>,
    expires_in_days: Option<u32>,
}

pub async fn create_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Result<Response, ApiError> {
    ensure_admin(&state, &headers)?;

    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::validation("name is required"));
    }
    let tier = Tier::parse(&body.tier)
        .ok_or_else(|| ApiError::validation(format!("unknown tier: {}", body.tier)))?;
    let (default_minute, default_day) = tier_limits(tier).unwrap_or((0, 0));
    let per_minute = body.per_minute_limit.unwrap_or(default_minute);
    let per_day = body.per_day_limit.unwrap_or(default_day);
    let expires_at = body
        .expires_in_days
        .map(|days| Utc::now() + Duration::days(days.max(1) as i64));

    let created = state
        .write_db(move |store| store.create_api_key(&name, tier, per_minute, per_day, expires_at))
        .await?;

    info!(key_id = %created.record.id, tier = tier.as_str(), "api key created");
    // The plaintext key appears exactly once, in this response.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": created.plaintext,
            "id": created.record.id,
            "name": created.record.name,
            "tier": created.record.tier.as_str(),
            "per_minute_limit": created.record.per_minute_limit,
            "per_day_limit": created.record.per_day_limit,
            "expires_at": created.record.expires_at,
        })),
    )
        .into_response())
}

pub async fn list_keys(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let rows = state.read_db(|store| store.list_api_keys()).await?;
    let keys: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.id,
                "name": row.name,
                "tier": row.tier.as_str(),
                "per_minute_limit": row.per_minute_limit,
                "per_day_limit": row.per_day_limit,
                "is_active": row.is_active,
                "created_at": row.created_at,
                "expires_at": row.expires_at,
                "last_used_at": row.last_used_at,
            })
        })
        .collect();
    Ok(Json(json!({ "keys": keys, "count": keys.len() })))
}

pub async fn deactivate_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let deactivated = state
        .write_db(move |store| store.deactivate_api_key(&id))
        .await?;
    if !deactivated {
        return Err(ApiError::not_found("api key not found"));
    }
    Ok(Json(json!({ "deactivated": true })))
}

#[derive(Debug, Deserialize, Default)]
pub struct UsageQuery {
    days: Option<usize>,
}

pub async fn key_usage(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let days = query.days.unwrap_or(30).clamp(1, 365);
    let stats = state
        .read_db(move |store| store.usage_stats(&id, days))
        .await?;
    let total: u64 = stats.iter().map(|stat| stat.requests).sum();
    let usage: Vec<Value> = stats
        .iter()
        .map(|stat| json!({ "date": stat.date, "requests": stat.requests }))
        .collect();
    Ok(Json(json!({ "usage": usage, "total_requests": total })))
}

pub async fn queue_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let snapshot = state
        .read_db(|store| {
            let now = Utc::now();
            let wallet = store.queue_stats(QueueKind::Wallet, now)?;
            let token = store.queue_stats(QueueKind::Token, now)?;
            Ok(json!({
                "k_wallet": { "pending": wallet.pending, "leased": wallet.leased },
                "token": { "pending": token.pending, "leased": token.leased },
                "webhook_deliveries_pending": store.pending_delivery_count()?,
            }))
        })
        .await?;
    Ok(Json(snapshot))
}

/// Queues every current holder for a K_wallet pass at the low priority;
/// transaction-triggered work still preempts the backfill.
pub async fn k_wallet_backfill(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let enqueued = state
        .write_db(|store| {
            let wallets = store.get_wallets(1)?;
            let mut enqueued = 0usize;
            for wallet in &wallets {
                if store.enqueue(QueueKind::Wallet, &wallet.address, WALLET_PRIORITY_STALE)? {
                    enqueued += 1;
                }
            }
            Ok(enqueued)
        })
        .await?;
    info!(enqueued, "k_wallet backfill queued");
    Ok(Json(json!({ "enqueued": enqueued })))
}

#[derive(Debug, Deserialize)]
pub struct RecalculateBody {
    tokens: Vec<String>,
}

pub async fn tokens_recalculate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<RecalculateBody>,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    if body.tokens.is_empty() || body.tokens.len() > 50 {
        return Err(ApiError::validation("between 1 and 50 tokens per request"));
    }
    for mint in &body.tokens {
        validate_address(mint)?;
        if !mint_in_ecosystem(mint, &state.config.scoring.ecosystem_suffixes) {
            return Err(ApiError::validation("mint is outside the tracked ecosystem")
                .with_field("mint", json!(mint)));
        }
    }

    let tokens = body.tokens;
    let enqueued = state
        .write_db(move |store| {
            let mut enqueued = 0usize;
            for mint in &tokens {
                if store.enqueue(QueueKind::Token, mint, 10)? {
                    enqueued += 1;
                }
            }
            Ok(enqueued)
        })
        .await?;
    Ok(Json(json!({ "enqueued": enqueued })))
}
