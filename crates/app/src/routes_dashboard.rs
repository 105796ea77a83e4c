use crate::error::ApiError;
use crate::gating::{ensure_admin, ensure_k_global_access};
use crate::middleware::RequestAuth;
use crate::state::SharedState;
use crate::web::validate_address;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use oracle_core_types::{retention, Classification};
use oracle_fanout::verify_signature_hex;
use oracle_ingestion::parse_push_batch;
use oracle_scoring::{KMetrics, WALLET_PRIORITY_STALE};
use oracle_storage::{QueueKind, SYNC_LAST_FULL_SYNC};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const PUSH_SIGNATURE_HEADER: &str = "X-Helius-Signature";
const K_GLOBAL_QUEUE_PRIORITY: i64 = 5;

async fn cached_metrics(state: &SharedState) -> Result<Arc<KMetrics>, ApiError> {
    let calculator = state.calculator.clone();
    let state_for_read = SharedState::clone(state);
    state
        .caches
        .k_metric
        .try_get_with("k", async move {
            state_for_read
                .read_db(move |store| calculator.compute(store, Utc::now()))
                .await
                .map(Arc::new)
                .map_err(|error| error.message)
        })
        .await
        .map_err(|error| ApiError::internal(error.to_string()))
}

pub async fn k_metric(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let metrics = cached_metrics(&state).await?;
    let price = state.read_db(|store| store.token_price()).await?;

    Ok(Json(json!({
        "k": metrics.k,
        "holders": metrics.holders,
        "neverSold": metrics.never_sold,
        "accumulators": metrics.accumulators,
        "maintained": metrics.maintained,
        "partialSellers": metrics.reducers,
        "majorSellers": metrics.extractors,
        "avgHoldDays": metrics.avg_hold_days,
        "og": metrics.og,
        "token": {
            "mint": state.config.token.mint,
            "symbol": state.config.token.symbol,
            "decimals": state.config.token.decimals,
            "price": price,
        },
        "calculatedAt": metrics.calculated_at,
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct HistoryQuery {
    days: Option<u32>,
}

pub async fn k_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let days = query.days.unwrap_or(30).clamp(1, 365);
    let rows = state
        .read_db(move |store| store.snapshot_history(days, Utc::now()))
        .await?;

    let history: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "date": row.created_at,
                "k": row.k,
                "holders": row.holders,
                "accumulators": row.accumulators_count,
                "maintained": row.maintained_count,
                "partialSellers": row.reducers_count,
                "majorSellers": row.extractors_count,
                "og": row.og_count,
                "avgHoldDays": row.avg_hold_days,
            })
        })
        .collect();
    Ok(Json(json!({ "count": history.len(), "history": history })))
}

#[derive(Debug, Deserialize, Default)]
pub struct HoldersQuery {
    limit: Option<usize>,
    exclude_pools: Option<bool>,
    min_usd: Option<f64>,
    classification: Option<String>,
}

pub async fn k_holders(
    State(state): State<SharedState>,
    Query(query): Query<HoldersQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1_000);
    let exclude_pools = query.exclude_pools.unwrap_or(false);
    let min_usd = query.min_usd;
    let class_filter = match query.classification.as_deref() {
        Some(raw) => Some(
            Classification::parse(raw)
                .ok_or_else(|| ApiError::validation("unknown classification"))?,
        ),
        None => None,
    };
    let calculator = state.calculator.clone();
    let decimals = state.config.token.decimals;

    let (rows, threshold) = state
        .read_db(move |store| {
            let threshold = match min_usd {
                Some(usd) if usd > 0.0 => {
                    let price = store.token_price()?.unwrap_or(0.0);
                    if price > 0.0 {
                        ((usd / price) * 10f64.powi(decimals.min(18) as i32)).round() as u128
                    } else {
                        calculator.qualifying_threshold(store)?
                    }
                }
                _ => calculator.qualifying_threshold(store)?,
            };
            // Fetch beyond the cap so pool exclusion does not starve the
            // page.
            let rows = store.get_holders_filtered(threshold, None, Some(limit * 2))?;
            Ok((rows, threshold))
        })
        .await?;

    let addresses: Vec<String> = rows.iter().map(|row| row.address.clone()).collect();
    let classes = state
        .adapter
        .classify_addresses(&addresses)
        .await
        .unwrap_or_else(|error| {
            warn!(error = %error, "pool classification unavailable; serving unclassified");
            Default::default()
        });

    let now = Utc::now();
    let mut pools_detected = 0usize;
    let mut with_k_wallet = 0usize;
    let mut holders = Vec::new();
    for row in &rows {
        let class = classes.get(&row.address);
        let is_pool = class.map(|c| c.is_pool).unwrap_or(false);
        if is_pool {
            pools_detected += 1;
            if exclude_pools {
                continue;
            }
        }
        if holders.len() >= limit {
            continue;
        }
        if row.k_wallet.is_some() {
            with_k_wallet += 1;
        }
        let row_retention = retention(row.current_balance, row.first_buy_amount);
        let row_class = Classification::from_retention(row_retention);
        if class_filter.is_some_and(|wanted| wanted != row_class) {
            continue;
        }
        holders.push(json!({
            "address": row.address,
            "balance": row.current_balance.to_string(),
            "retention": row_retention,
            "classification": row_class.as_str(),
            "holdDays": state.calculator.hold_days(row, now),
            "isOG": state.calculator.is_og(row, now),
            "isPool": is_pool,
            "poolProgram": class.and_then(|c| c.program.clone()),
            "k_wallet": row.k_wallet,
            "firstBuyAmount": row.first_buy_amount.map(|v| v.to_string()),
            "peakBalance": row.peak_balance.to_string(),
        }));
    }

    let coverage = if rows.is_empty() {
        0.0
    } else {
        with_k_wallet as f64 / rows.len() as f64
    };
    Ok(Json(json!({
        "holders": holders,
        "total": rows.len(),
        "pools_detected": pools_detected,
        "filter": {
            "min_balance_raw": threshold.to_string(),
            "exclude_pools": exclude_pools,
            "classification": class_filter.map(|c| c.as_str()),
            "limit": limit,
        },
        "k_wallet_coverage": coverage,
    })))
}

pub async fn k_status(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state
        .read_db(move |store| {
            let now = Utc::now();
            Ok(json!({
                "last_processed_slot": store.last_processed_slot()?,
                "wallets": store.wallet_count()?,
                "holders": store.holder_count()?,
                "transactions": store.transaction_count()?,
                "last_full_sync": store.get_sync_value(SYNC_LAST_FULL_SYNC)?,
                "token_price": store.token_price()?,
                "one_usd_threshold": store.one_usd_threshold()?.map(|v| v.to_string()),
                "latest_k": store.latest_snapshot()?.map(|row| json!({
                    "k": row.k,
                    "holders": row.holders,
                    "created_at": row.created_at,
                })),
                "queues": {
                    "k_wallet": queue_stats_json(store, QueueKind::Wallet, now)?,
                    "token": queue_stats_json(store, QueueKind::Token, now)?,
                    "webhook_deliveries_pending": store.pending_delivery_count()?,
                },
            }))
        })
        .await?;

    let contention = oracle_storage::contention_stats();
    Ok(Json(json!({
        "sync": snapshot,
        "gating": {
            "k_global_gated": state.config.gating.k_global_gated,
            "fail_closed": state.config.gating.k_global_fail_closed,
        },
        "cache": state.caches.stats(),
        "ws": {
            "connections": state.hub.connection_count(),
            "subscribers": state.hub.subscriber_count(),
        },
        "rate_limiter_identities": state.limiter.tracked_identities(),
        "sqlite_contention": {
            "write_retries": contention.retries,
            "busy_errors": contention.busy_hits,
        },
        "maintenance": state.config.system.maintenance,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "memory_rss_kb": state.memory_rss_kb(),
    })))
}

fn queue_stats_json(
    store: &oracle_storage::SqliteStore,
    kind: QueueKind,
    now: chrono::DateTime<Utc>,
) -> anyhow::Result<Value> {
    let stats = store.queue_stats(kind, now)?;
    Ok(json!({ "pending": stats.pending, "leased": stats.leased }))
}

pub async fn wallet_k_score(
    State(state): State<SharedState>,
    Path(addr): Path<String>,
) -> Result<Json<Value>, ApiError> {
    validate_address(&addr)?;
    let lookup = addr.clone();
    let row = state
        .read_db(move |store| store.get_wallet(&lookup))
        .await?
        .ok_or_else(|| ApiError::not_found("wallet has no recorded position"))?;

    let now = Utc::now();
    let row_retention = retention(row.current_balance, row.first_buy_amount);
    Ok(Json(json!({
        "address": row.address,
        "balance": row.current_balance.to_string(),
        "peakBalance": row.peak_balance.to_string(),
        "firstBuyAmount": row.first_buy_amount.map(|v| v.to_string()),
        "firstBuyTs": row.first_buy_ts,
        "retention": row_retention,
        "classification": Classification::from_retention(row_retention).as_str(),
        "holdDays": state.calculator.hold_days(&row, now),
        "isOG": state.calculator.is_og(&row, now),
        "lastSlot": row.last_slot,
        "lastTxSignature": row.last_tx_signature,
    })))
}

pub async fn wallet_k_global(
    State(state): State<SharedState>,
    Extension(auth): Extension<RequestAuth>,
    Path(addr): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    validate_address(&addr)?;
    ensure_k_global_access(&state, &auth, &headers, &addr).await?;

    let stale_after = state.config.scoring.wallet_stale_seconds.max(1) as i64;
    let now = Utc::now();

    if let Some(cached) = state.caches.wallets.get(&addr).await {
        return Ok(k_global_response(&cached, "memory", stale_after, now).into_response());
    }

    let lookup = addr.clone();
    let row = state
        .read_db(move |store| store.get_wallet(&lookup))
        .await?;

    let scored = row.as_ref().and_then(|row| {
        row.k_wallet.map(|k_wallet| {
            json!({
                "address": row.address,
                "k_wallet": k_wallet,
                "tokens_analyzed": row.k_wallet_tokens_analyzed,
                "updated_at": row.k_wallet_updated_at,
                "slot": row.k_wallet_slot,
            })
        })
    });

    match scored {
        Some(value) => {
            let value = Arc::new(value);
            state
                .caches
                .wallets
                .insert(addr.clone(), Arc::clone(&value))
                .await;

            // A stale score still serves, but queues a refresh behind it.
            let age = row
                .as_ref()
                .and_then(|r| r.k_wallet_updated_at)
                .map(|ts| (now - ts).num_seconds())
                .unwrap_or(i64::MAX);
            if age > stale_after {
                let enqueue_addr = addr.clone();
                let _ = state
                    .write_db(move |store| {
                        store.enqueue(QueueKind::Wallet, &enqueue_addr, WALLET_PRIORITY_STALE)
                    })
                    .await;
            }
            Ok(k_global_response(&value, "db", stale_after, now).into_response())
        }
        None => {
            let enqueue_addr = addr.clone();
            let leased = state
                .write_db(move |store| {
                    let entry =
                        store.queue_entry(QueueKind::Wallet, &enqueue_addr, Utc::now())?;
                    if entry.is_none() {
                        store.enqueue(QueueKind::Wallet, &enqueue_addr, K_GLOBAL_QUEUE_PRIORITY)?;
                    }
                    Ok(entry.unwrap_or(false))
                })
                .await?;
            let status = if leased { "calculating" } else { "queued" };
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "address": addr,
                    "status": status,
                    "retry_after": 30,
                })),
            )
                .into_response())
        }
    }
}

fn k_global_response(
    value: &Value,
    source: &str,
    stale_after: i64,
    now: chrono::DateTime<Utc>,
) -> Json<Value> {
    let age_seconds = value
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| (now - ts.with_timezone(&Utc)).num_seconds().max(0))
        .unwrap_or(0);
    let slot = value.get("slot").cloned().unwrap_or(Value::Null);
    Json(json!({
        "address": value.get("address"),
        "k_wallet": value.get("k_wallet"),
        "tokens_analyzed": value.get("tokens_analyzed"),
        "updated_at": value.get("updated_at"),
        "source": source,
        "stale": age_seconds > stale_after,
        "age_seconds": age_seconds,
        "poh": { "slot": slot },
    }))
}

/// Signed push ingest. The HMAC is computed over the raw request body and
/// compared constant-time; verification failures are a 401 and nothing is
/// parsed.
pub async fn push_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state.config.helius.webhook_secret.trim();
    if secret.is_empty() {
        if state.is_production() {
            return Err(ApiError::unauthorized("push ingest is not configured"));
        }
        warn!("accepting unsigned push batch outside production");
    } else {
        let presented = headers
            .get(PUSH_SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing push signature"))?;
        if !verify_signature_hex(secret.as_bytes(), &body, presented) {
            return Err(ApiError::unauthorized("push signature mismatch"));
        }
    }

    let changes = parse_push_batch(
        &body,
        &state.config.token.mint,
        state.config.token.decimals,
    )
    .map_err(|error| ApiError::validation(error.to_string()))?;

    let received = changes.len();
    let pipeline = state.pipeline.clone();
    let summary = state
        .write_db(move |store| pipeline.apply_batch(store, changes))
        .await?;

    info!(
        received,
        applied = summary.applied,
        duplicates = summary.duplicates,
        "push batch ingested"
    );
    Ok(Json(json!({
        "received": true,
        "events": received,
        "applied": summary.applied,
    })))
}

pub async fn trigger_sync(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let pull = state.pull.clone();
    tokio::spawn(async move {
        match pull.run_once().await {
            Ok(summary) => info!(
                applied = summary.batch.applied,
                fresh = summary.fresh,
                "manual pull sync finished"
            ),
            Err(error) => warn!(error = %error, "manual pull sync failed"),
        }
    });
    Ok(Json(json!({ "triggered": true })))
}

pub async fn trigger_backup(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    ensure_admin(&state, &headers)?;
    let backup_dir = std::path::PathBuf::from(&state.config.sqlite.backup_dir);
    let retain = state.config.sqlite.backup_retain;
    let path = state
        .write_db(move |store| store.backup_to(&backup_dir, retain))
        .await?;
    Ok(Json(json!({ "backup": path.display().to_string() })))
}
