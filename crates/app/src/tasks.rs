use crate::state::SharedState;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use oracle_fanout::DeliveryWorker;
use oracle_scoring::{aggregate_token_k, compute_wallet_score, WALLET_PRIORITY_STALE};
use oracle_storage::{DeliveryClaim, QueueKind, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

const WORKER_IDLE_SLEEP: Duration = Duration::from_secs(2);
const MAINTENANCE_PERIOD: Duration = Duration::from_secs(10 * 60);
const STALE_SCAN_PERIOD: Duration = Duration::from_secs(30 * 60);
const STALE_SCAN_BATCH: usize = 500;
const QUEUE_MAX_ATTEMPTS: u32 = 5;

/// Spawns every long-lived background activity. Each service is its own
/// task with its own store handles; sequential loops make single-flight
/// the default.
pub fn spawn_all(state: &SharedState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(pull_service(SharedState::clone(state))));
    for worker_id in 0..state.config.scoring.wallet_workers {
        handles.push(tokio::spawn(wallet_worker(
            SharedState::clone(state),
            worker_id,
        )));
    }
    for worker_id in 0..state.config.scoring.token_workers {
        handles.push(tokio::spawn(token_worker(
            SharedState::clone(state),
            worker_id,
        )));
    }
    handles.push(tokio::spawn(delivery_service(SharedState::clone(state))));
    handles.push(tokio::spawn(heartbeat_service(SharedState::clone(state))));
    handles.push(tokio::spawn(snapshot_service(SharedState::clone(state))));
    handles.push(tokio::spawn(backup_service(SharedState::clone(state))));
    handles.push(tokio::spawn(maintenance_service(SharedState::clone(state))));
    handles.push(tokio::spawn(stale_scan_service(SharedState::clone(state))));
    handles
}

fn open_store(path: &PathBuf) -> Result<SqliteStore> {
    SqliteStore::open(path).with_context(|| format!("failed opening store at {}", path.display()))
}

async fn blocking_db<T, F>(state: &SharedState, action: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
{
    let path = state.sqlite_path.clone();
    tokio::task::spawn_blocking(move || {
        let store = open_store(&path)?;
        action(&store)
    })
    .await
    .context("blocking db task join failed")?
}

async fn pull_service(state: SharedState) {
    let mut ticker = time::interval(Duration::from_secs(
        state.config.ingest.poll_interval_seconds.max(10),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match state.pull.run_once().await {
            Ok(summary) => {
                if summary.fresh > 0 {
                    info!(
                        fresh = summary.fresh,
                        applied = summary.batch.applied,
                        duplicates = summary.batch.duplicates,
                        "scheduled pull sync applied changes"
                    );
                }
                // Sync telemetry goes to premium and internal tiers only.
                state.hub.publish_to_tier(
                    "status",
                    serde_json::json!({
                        "watermark": summary.watermark,
                        "applied": summary.batch.applied,
                        "price_refreshed": summary.price_refreshed,
                    }),
                    oracle_core_types::Tier::Premium,
                );
            }
            Err(error) => warn!(error = %error, "scheduled pull sync failed"),
        }
    }
}

async fn wallet_worker(state: SharedState, worker_id: usize) {
    let lease = ChronoDuration::seconds(state.config.scoring.wallet_lease_seconds.max(1) as i64);
    loop {
        let item = match blocking_db(&state, move |store| {
            store.dequeue(QueueKind::Wallet, lease, Utc::now())
        })
        .await
        {
            Ok(item) => item,
            Err(error) => {
                warn!(worker_id, error = %error, "wallet dequeue failed");
                time::sleep(WORKER_IDLE_SLEEP).await;
                continue;
            }
        };

        let Some(item) = item else {
            time::sleep(WORKER_IDLE_SLEEP).await;
            continue;
        };

        let address = item.key.clone();
        debug!(worker_id, wallet = %address, attempts = item.attempts, "scoring wallet");

        let history = state
            .adapter
            .cross_token_history(&address, state.config.scoring.wallet_history_max_pages)
            .await;

        match history {
            Ok(positions) => {
                let suffixes = state.config.scoring.ecosystem_suffixes.clone();
                let primary_mint = state.config.token.mint.clone();
                let write_address = address.clone();
                let result = blocking_db(&state, move |store| {
                    let row = store.get_wallet(&write_address)?;
                    let watermark = store.last_processed_slot()?;
                    let score = compute_wallet_score(
                        &positions,
                        &suffixes,
                        &primary_mint,
                        row.as_ref(),
                        watermark,
                        Utc::now(),
                    );
                    store.ensure_wallet_row(&write_address)?;
                    store.update_wallet_score(
                        &write_address,
                        score.k_wallet,
                        score.tokens_analyzed,
                        score.slot,
                        score.computed_at,
                    )?;
                    store.complete(QueueKind::Wallet, &write_address)?;
                    Ok(score)
                })
                .await;

                match result {
                    Ok(score) => {
                        state.caches.wallets.invalidate(&address).await;
                        debug!(
                            worker_id,
                            wallet = %address,
                            k_wallet = score.k_wallet,
                            tokens = score.tokens_analyzed,
                            "wallet scored"
                        );
                    }
                    Err(error) => {
                        warn!(worker_id, wallet = %address, error = %error, "wallet score write failed");
                        let fail_address = address.clone();
                        let message = error.to_string();
                        let _ = blocking_db(&state, move |store| {
                            store.fail(QueueKind::Wallet, &fail_address, &message)
                        })
                        .await;
                    }
                }
            }
            Err(error) => {
                warn!(worker_id, wallet = %address, error = %error, "cross-token history failed");
                let message = error.to_string();
                let fail_address = address.clone();
                let _ = blocking_db(&state, move |store| {
                    store.fail(QueueKind::Wallet, &fail_address, &message)
                })
                .await;
            }
        }
    }
}

async fn token_worker(state: SharedState, worker_id: usize) {
    let lease = ChronoDuration::seconds(state.config.scoring.token_lease_seconds.max(1) as i64);
    loop {
        let item = match blocking_db(&state, move |store| {
            store.dequeue(QueueKind::Token, lease, Utc::now())
        })
        .await
        {
            Ok(item) => item,
            Err(error) => {
                warn!(worker_id, error = %error, "token dequeue failed");
                time::sleep(WORKER_IDLE_SLEEP).await;
                continue;
            }
        };

        let Some(item) = item else {
            time::sleep(WORKER_IDLE_SLEEP).await;
            continue;
        };

        let mint = item.key.clone();
        info!(worker_id, mint = %mint, "scoring token");
        match score_token(&state, &mint).await {
            Ok(sampled) => {
                state.caches.tokens.invalidate(&mint).await;
                let done_mint = mint.clone();
                let _ = blocking_db(&state, move |store| {
                    store.complete(QueueKind::Token, &done_mint)
                })
                .await;
                info!(worker_id, mint = %mint, sampled, "token scored");
            }
            Err(error) => {
                warn!(worker_id, mint = %mint, error = %error, "token scoring failed");
                let message = error.to_string();
                let fail_mint = mint.clone();
                let _ = blocking_db(&state, move |store| {
                    store.fail(QueueKind::Token, &fail_mint, &message)
                })
                .await;
            }
        }
    }
}

/// Samples the mint's top holders, reconstructs each holder's position via
/// their history, and aggregates K. Holder history fetches run with
/// bounded concurrency.
async fn score_token(state: &SharedState, mint: &str) -> Result<usize> {
    let holders = state.adapter.fetch_holders(mint).await?;
    let top: Vec<String> = holders
        .iter()
        .take(state.config.scoring.token_top_holders.max(1))
        .map(|holder| holder.owner.clone())
        .collect();

    let semaphore = Arc::new(Semaphore::new(
        state.config.scoring.token_fetch_concurrency.max(1),
    ));
    let mut tasks: JoinSet<Option<f64>> = JoinSet::new();
    for owner in top.iter().cloned() {
        let adapter = Arc::clone(&state.adapter);
        let semaphore = Arc::clone(&semaphore);
        let mint = mint.to_string();
        let pages = state.config.scoring.wallet_history_max_pages.min(3);
        tasks.spawn(async move {
            let _permit = semaphore.acquire().await.ok()?;
            let positions = adapter.cross_token_history(&owner, pages).await.ok()?;
            let position = positions.get(&mint)?;
            let first_buy = if position.first_buy_amount > 0 {
                Some(position.first_buy_amount)
            } else {
                None
            };
            Some(oracle_core_types::retention(position.current, first_buy))
        });
    }

    let mut retentions = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(value)) = joined {
            retentions.push(value);
        }
    }

    let sampled = retentions.len();
    let aggregate = aggregate_token_k(&retentions);
    let row = aggregate.into_row(mint, Utc::now());
    blocking_db(state, move |store| store.upsert_token_score(&row)).await?;
    Ok(sampled)
}

async fn delivery_service(state: SharedState) {
    let period = Duration::from_secs(state.config.fanout.delivery_period_seconds.max(1));
    let timeout = Duration::from_secs(state.config.fanout.delivery_timeout_seconds.max(1));
    let batch = state.config.fanout.delivery_batch.max(1);
    let worker = match DeliveryWorker::new(timeout) {
        Ok(worker) => worker,
        Err(error) => {
            warn!(error = %error, "webhook delivery worker failed to start");
            return;
        }
    };

    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let claims: Vec<DeliveryClaim> = match blocking_db(&state, move |store| {
            store.claim_due_deliveries(batch, Utc::now())
        })
        .await
        {
            Ok(claims) => claims,
            Err(error) => {
                warn!(error = %error, "claiming webhook deliveries failed");
                continue;
            }
        };

        for claim in claims {
            let attempt = worker.attempt(&claim).await;
            let delivery_id = claim.delivery_id.clone();
            let subscription_id = claim.subscription_id.clone();
            let result = blocking_db(&state, move |store| {
                if attempt.delivered {
                    store.mark_delivery_success(
                        &delivery_id,
                        &subscription_id,
                        attempt.response_code.unwrap_or(200),
                        Utc::now(),
                    )?;
                } else {
                    store.mark_delivery_failure(
                        &delivery_id,
                        &subscription_id,
                        attempt.response_code,
                        attempt.response_body.as_deref(),
                        Utc::now(),
                    )?;
                }
                Ok(())
            })
            .await;
            if let Err(error) = result {
                warn!(
                    delivery_id = %claim.delivery_id,
                    error = %error,
                    "recording delivery outcome failed"
                );
            }
        }
    }
}

async fn heartbeat_service(state: SharedState) {
    let mut ticker = time::interval(Duration::from_secs(
        state.config.system.heartbeat_seconds.max(1),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if let Err(error) =
            blocking_db(&state, |store| store.record_heartbeat("oracle-app", "alive")).await
        {
            warn!(error = %error, "heartbeat write failed");
        }
    }
}

async fn snapshot_service(state: SharedState) {
    let mut ticker = time::interval(Duration::from_secs(
        state.config.scoring.snapshot_interval_seconds.max(60),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup does not write
    // a snapshot before any data lands.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let calculator = state.calculator.clone();
        match blocking_db(&state, move |store| {
            calculator.calculate_and_save(store, Utc::now())
        })
        .await
        {
            Ok(metrics) => info!(k = metrics.k, holders = metrics.holders, "daily snapshot saved"),
            Err(error) => warn!(error = %error, "daily snapshot failed"),
        }
    }
}

async fn backup_service(state: SharedState) {
    let mut ticker = time::interval(Duration::from_secs(
        state.config.sqlite.backup_interval_seconds.max(60),
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let dir = PathBuf::from(&state.config.sqlite.backup_dir);
        let retain = state.config.sqlite.backup_retain;
        match blocking_db(&state, move |store| store.backup_to(&dir, retain)).await {
            Ok(path) => info!(path = %path.display(), "scheduled backup written"),
            Err(error) => warn!(error = %error, "scheduled backup failed"),
        }
    }
}

/// Queue hygiene and limiter sweeps.
async fn maintenance_service(state: SharedState) {
    let mut ticker = time::interval(MAINTENANCE_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        state.limiter.sweep(Utc::now());
        let result = blocking_db(&state, |store| {
            let wallets = store.cleanup_queue(QueueKind::Wallet, QUEUE_MAX_ATTEMPTS)?;
            let tokens = store.cleanup_queue(QueueKind::Token, QUEUE_MAX_ATTEMPTS)?;
            Ok((wallets, tokens))
        })
        .await;
        match result {
            Ok((wallets, tokens)) if wallets + tokens > 0 => {
                info!(wallets, tokens, "exhausted queue entries cleaned")
            }
            Ok(_) => {}
            Err(error) => warn!(error = %error, "queue cleanup failed"),
        }
    }
}

/// Enqueues holders whose K_wallet is older than the staleness threshold,
/// at the low priority so fresh transaction work wins.
async fn stale_scan_service(state: SharedState) {
    let stale_seconds = state.config.scoring.wallet_stale_seconds.max(60) as i64;
    let mut ticker = time::interval(STALE_SCAN_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let result = blocking_db(&state, move |store| {
            let cutoff = Utc::now() - ChronoDuration::seconds(stale_seconds);
            let stale = store.stale_score_wallets(cutoff, STALE_SCAN_BATCH)?;
            let mut enqueued = 0usize;
            for address in &stale {
                if store.enqueue(QueueKind::Wallet, address, WALLET_PRIORITY_STALE)? {
                    enqueued += 1;
                }
            }
            Ok(enqueued)
        })
        .await;
        match result {
            Ok(enqueued) if enqueued > 0 => info!(enqueued, "stale wallet scores queued"),
            Ok(_) => {}
            Err(error) => warn!(error = %error, "stale score scan failed"),
        }
    }
}
