use crate::error::ApiError;
use crate::state::SharedState;
use crate::web::validate_address;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use oracle_core_types::{retention, Classification};
use oracle_scoring::mint_in_ecosystem;
use oracle_storage::{QueueKind, SqliteStore};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const MAX_WALLET_BATCH: usize = 100;
const MAX_TOKEN_BATCH: usize = 50;
const TOKEN_QUEUE_PRIORITY: i64 = 5;
const WALLET_QUEUE_PRIORITY: i64 = 5;

pub async fn status(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .read_db(|store| {
            Ok(json!({
                "slot": store.last_processed_slot()?,
                "holders": store.holder_count()?,
                "k": store.latest_snapshot()?.map(|row| row.k),
            }))
        })
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "chain": snapshot,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    })))
}

/// Wallet item shape shared by the single and batch endpoints. Runs
/// against an already-open store so batches reuse one handle.
fn wallet_item(store: &SqliteStore, address: &str) -> anyhow::Result<(Value, &'static str)> {
    let row = store.get_wallet(address)?;
    if let Some(row) = &row {
        if let Some(k_wallet) = row.k_wallet {
            return Ok((
                json!({
                    "address": address,
                    "status": "ready",
                    "k_wallet": k_wallet,
                    "tokens_analyzed": row.k_wallet_tokens_analyzed,
                    "updated_at": row.k_wallet_updated_at,
                    "slot": row.k_wallet_slot,
                }),
                "ready",
            ));
        }
    }

    let entry = store.queue_entry(QueueKind::Wallet, address, Utc::now())?;
    let status = match entry {
        Some(true) => "calculating",
        Some(false) => "queued",
        None => {
            store.enqueue(QueueKind::Wallet, address, WALLET_QUEUE_PRIORITY)?;
            "queued"
        }
    };
    Ok((
        json!({ "address": address, "status": status, "retry_after": 30 }),
        status,
    ))
}

fn token_item(
    store: &SqliteStore,
    mint: &str,
    ttl_seconds: u64,
) -> anyhow::Result<(Value, &'static str)> {
    let fresh_after = Utc::now() - Duration::seconds(ttl_seconds.max(1) as i64);
    if let Some(row) = store.get_token_score(mint)? {
        if row.last_sync >= fresh_after {
            return Ok((
                json!({
                    "mint": mint,
                    "status": "ready",
                    "k": row.k,
                    "holders_sampled": row.holders_sampled,
                    "accumulators": row.accumulators_count,
                    "maintained": row.maintained_count,
                    "partialSellers": row.reducers_count,
                    "majorSellers": row.extractors_count,
                    "last_sync": row.last_sync,
                }),
                "ready",
            ));
        }
    }

    let entry = store.queue_entry(QueueKind::Token, mint, Utc::now())?;
    let status = match entry {
        Some(true) => "syncing",
        Some(false) => "queued",
        None => {
            store.enqueue(QueueKind::Token, mint, TOKEN_QUEUE_PRIORITY)?;
            "queued"
        }
    };
    Ok((
        json!({ "mint": mint, "status": status, "retry_after": 60 }),
        status,
    ))
}

pub async fn token_score(
    State(state): State<SharedState>,
    Path(mint): Path<String>,
) -> Result<Response, ApiError> {
    validate_address(&mint)?;
    if !mint_in_ecosystem(&mint, &state.config.scoring.ecosystem_suffixes) {
        return Err(ApiError::validation(
            "mint is outside the tracked ecosystem",
        ));
    }

    if let Some(cached) = state.caches.tokens.get(&mint).await {
        let (value, _) = token_row_to_ready(&mint, &cached);
        return Ok(Json(value).into_response());
    }

    let ttl = state.config.scoring.token_result_ttl_seconds;
    let lookup = mint.clone();
    let (value, status) = state
        .write_db(move |store| token_item(store, &lookup, ttl))
        .await?;

    if status == "ready" {
        let row_mint = mint.clone();
        let row = state
            .read_db(move |store| store.get_token_score(&row_mint))
            .await?;
        if let Some(row) = row {
            state.caches.tokens.insert(mint, Arc::new(row)).await;
        }
        Ok(Json(value).into_response())
    } else {
        Ok((StatusCode::ACCEPTED, Json(value)).into_response())
    }
}

fn token_row_to_ready(mint: &str, row: &oracle_storage::TokenScoreRow) -> (Value, &'static str) {
    (
        json!({
            "mint": mint,
            "status": "ready",
            "k": row.k,
            "holders_sampled": row.holders_sampled,
            "accumulators": row.accumulators_count,
            "maintained": row.maintained_count,
            "partialSellers": row.reducers_count,
            "majorSellers": row.extractors_count,
            "last_sync": row.last_sync,
        }),
        "ready",
    )
}

pub async fn wallet_score(
    State(state): State<SharedState>,
    Path(addr): Path<String>,
) -> Result<Response, ApiError> {
    validate_address(&addr)?;
    let lookup = addr.clone();
    let (value, status) = state
        .write_db(move |store| wallet_item(store, &lookup))
        .await?;
    if status == "ready" {
        Ok(Json(value).into_response())
    } else {
        Ok((StatusCode::ACCEPTED, Json(value)).into_response())
    }
}

#[derive(Debug, Deserialize)]
pub struct WalletsBatchBody {
    wallets: Vec<String>,
}

pub async fn wallets_batch(
    State(state): State<SharedState>,
    Json(body): Json<WalletsBatchBody>,
) -> Result<Json<Value>, ApiError> {
    if body.wallets.is_empty() {
        return Err(ApiError::validation("wallets must not be empty"));
    }
    if body.wallets.len() > MAX_WALLET_BATCH {
        return Err(ApiError::validation(format!(
            "at most {MAX_WALLET_BATCH} wallets per batch"
        )));
    }
    for wallet in &body.wallets {
        validate_address(wallet)?;
    }

    let wallets = body.wallets;
    let (items, summary) = state
        .write_db(move |store| {
            let mut items = Vec::with_capacity(wallets.len());
            let mut ready = 0usize;
            let mut queued = 0usize;
            let mut calculating = 0usize;
            for wallet in &wallets {
                let (value, status) = wallet_item(store, wallet)?;
                match status {
                    "ready" => ready += 1,
                    "calculating" => calculating += 1,
                    _ => queued += 1,
                }
                items.push(value);
            }
            Ok((
                items,
                json!({
                    "total": wallets.len(),
                    "ready": ready,
                    "queued": queued,
                    "calculating": calculating,
                }),
            ))
        })
        .await?;

    Ok(Json(json!({ "results": items, "summary": summary })))
}

#[derive(Debug, Deserialize)]
pub struct TokensBatchBody {
    tokens: Vec<String>,
}

pub async fn tokens_batch(
    State(state): State<SharedState>,
    Json(body): Json<TokensBatchBody>,
) -> Result<Json<Value>, ApiError> {
    if body.tokens.is_empty() {
        return Err(ApiError::validation("tokens must not be empty"));
    }
    if body.tokens.len() > MAX_TOKEN_BATCH {
        return Err(ApiError::validation(format!(
            "at most {MAX_TOKEN_BATCH} tokens per batch"
        )));
    }
    for mint in &body.tokens {
        validate_address(mint)?;
        if !mint_in_ecosystem(mint, &state.config.scoring.ecosystem_suffixes) {
            return Err(
                ApiError::validation("mint is outside the tracked ecosystem")
                    .with_field("mint", json!(mint)),
            );
        }
    }

    let ttl = state.config.scoring.token_result_ttl_seconds;
    let tokens = body.tokens;
    let (items, summary) = state
        .write_db(move |store| {
            let mut items = Vec::with_capacity(tokens.len());
            let mut ready = 0usize;
            let mut queued = 0usize;
            let mut syncing = 0usize;
            for mint in &tokens {
                let (value, status) = token_item(store, mint, ttl)?;
                match status {
                    "ready" => ready += 1,
                    "syncing" => syncing += 1,
                    _ => queued += 1,
                }
                items.push(value);
            }
            Ok((
                items,
                json!({
                    "total": tokens.len(),
                    "ready": ready,
                    "queued": queued,
                    "syncing": syncing,
                }),
            ))
        })
        .await?;

    Ok(Json(json!({ "results": items, "summary": summary })))
}

#[derive(Debug, Deserialize, Default)]
pub struct HoldersQuery {
    limit: Option<usize>,
}

pub async fn holders(
    State(state): State<SharedState>,
    Query(query): Query<HoldersQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1_000);
    let calculator = state.calculator.clone();
    let rows = state
        .read_db(move |store| {
            let threshold = calculator.qualifying_threshold(store)?;
            store.get_holders_filtered(threshold, None, Some(limit))
        })
        .await?;

    let holders: Vec<Value> = rows
        .iter()
        .map(|row| {
            let row_retention = retention(row.current_balance, row.first_buy_amount);
            json!({
                "address": row.address,
                "balance": row.current_balance.to_string(),
                "retention": row_retention,
                "classification": Classification::from_retention(row_retention).as_str(),
                "k_wallet": row.k_wallet,
            })
        })
        .collect();
    Ok(Json(json!({ "holders": holders, "count": holders.len() })))
}
