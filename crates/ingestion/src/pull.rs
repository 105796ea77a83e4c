use super::pipeline::{BatchSummary, IngestPipeline};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use oracle_chain::{parse_balance_changes, HeliusAdapter, SignatureInfo};
use oracle_config::{IngestConfig, TokenConfig};
use oracle_core_types::BalanceChange;
use oracle_storage::{SqliteStore, SYNC_LAST_FULL_SYNC, SYNC_ONE_USD_THRESHOLD, SYNC_TOKEN_PRICE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Periodic pull side of the ingest merge: scans recent signatures above
/// the slot watermark, fetches details with bounded concurrency, and runs
/// the parsed changes through the shared pipeline. The caller enforces
/// single-flight; this type enforces the per-run deadline.
#[derive(Clone)]
pub struct PullSync {
    adapter: Arc<HeliusAdapter>,
    pipeline: IngestPipeline,
    sqlite_path: PathBuf,
    token: TokenConfig,
    ingest: IngestConfig,
    in_flight: Arc<AsyncMutex<()>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PullSummary {
    pub watermark: u64,
    pub scanned: usize,
    pub fresh: usize,
    pub fetch_failures: usize,
    pub batch: BatchSummary,
    pub price_refreshed: bool,
}

impl PullSync {
    pub fn new(
        adapter: Arc<HeliusAdapter>,
        pipeline: IngestPipeline,
        sqlite_path: PathBuf,
        token: TokenConfig,
        ingest: IngestConfig,
    ) -> Self {
        Self {
            adapter,
            pipeline,
            sqlite_path,
            token,
            ingest,
            in_flight: Arc::new(AsyncMutex::new(())),
        }
    }

    /// At most one pull runs at a time, across both the scheduled ticker
    /// and manual admin triggers.
    pub async fn run_once(&self) -> Result<PullSummary> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Err(anyhow!("pull sync already in flight"));
        };
        let deadline = Duration::from_secs(self.ingest.pull_deadline_seconds.max(1));
        tokio::time::timeout(deadline, self.run_inner())
            .await
            .map_err(|_| anyhow!("pull sync exceeded {}s deadline", deadline.as_secs()))?
    }

    async fn run_inner(&self) -> Result<PullSummary> {
        let sqlite_path = self.sqlite_path.clone();
        let watermark = tokio::task::spawn_blocking(move || -> Result<u64> {
            let store = SqliteStore::open_read_only(&sqlite_path)?;
            store.last_processed_slot()
        })
        .await
        .context("watermark read task failed")??;

        let signatures = self
            .adapter
            .signatures_since(&self.token.mint, self.ingest.signature_scan_limit)
            .await?;
        let mut summary = PullSummary {
            watermark,
            scanned: signatures.len(),
            ..PullSummary::default()
        };

        let fresh = fresh_signatures(signatures, watermark);
        summary.fresh = fresh.len();

        if !fresh.is_empty() {
            let (changes, failures) = self.fetch_changes(fresh).await;
            summary.fetch_failures = failures;

            let pipeline = self.pipeline.clone();
            let sqlite_path = self.sqlite_path.clone();
            summary.batch =
                tokio::task::spawn_blocking(move || -> Result<BatchSummary> {
                    let store = SqliteStore::open(&sqlite_path)?;
                    pipeline.apply_batch(&store, changes)
                })
                .await
                .context("pull apply task failed")??;
        }

        summary.price_refreshed = self.refresh_price().await;

        let sqlite_path = self.sqlite_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let store = SqliteStore::open(&sqlite_path)?;
            store.set_sync_value(SYNC_LAST_FULL_SYNC, &Utc::now().to_rfc3339())
        })
        .await
        .context("sync stamp task failed")??;

        info!(
            watermark = summary.watermark,
            scanned = summary.scanned,
            fresh = summary.fresh,
            applied = summary.batch.applied,
            duplicates = summary.batch.duplicates,
            fetch_failures = summary.fetch_failures,
            "pull sync completed"
        );
        Ok(summary)
    }

    /// Transaction details arrive in parallel, capped by the configured
    /// fetch concurrency. A failed fetch drops that signature for this
    /// round; the next scan retries it because the watermark has not
    /// passed it.
    async fn fetch_changes(
        &self,
        fresh: Vec<SignatureInfo>,
    ) -> (Vec<BalanceChange>, usize) {
        let semaphore = Arc::new(Semaphore::new(self.ingest.fetch_concurrency.max(1)));
        let mut tasks: JoinSet<Result<Vec<BalanceChange>>> = JoinSet::new();

        for sig in fresh {
            let adapter = Arc::clone(&self.adapter);
            let semaphore = Arc::clone(&semaphore);
            let mint = self.token.mint.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .context("fetch semaphore closed")?;
                let raw = adapter.fetch_transaction(&sig.signature).await?;
                Ok(parse_balance_changes(&raw, &mint))
            });
        }

        let mut changes = Vec::new();
        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(parsed)) => changes.extend(parsed),
                Ok(Err(error)) => {
                    failures += 1;
                    warn!(error = %error, "transaction fetch failed during pull sync");
                }
                Err(error) => {
                    failures += 1;
                    warn!(error = %error, "transaction fetch task join failed");
                }
            }
        }
        (changes, failures)
    }

    /// Refreshes the persisted price and the USD-derived qualifying
    /// threshold. Price failures are routine (the calculator falls back to
    /// the static minimum), so they only log.
    async fn refresh_price(&self) -> bool {
        let info = match self.adapter.fetch_token_info(&self.token.mint).await {
            Ok(info) => info,
            Err(error) => {
                warn!(error = %error, "token info fetch failed during pull sync");
                return false;
            }
        };
        let Some(price) = info.price_usd else {
            return false;
        };
        let Some(threshold) = raw_threshold(self.token.usd_minimum, price, self.token.decimals)
        else {
            return false;
        };

        let sqlite_path = self.sqlite_path.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let store = SqliteStore::open(&sqlite_path)?;
            store.set_sync_value(SYNC_TOKEN_PRICE, &price.to_string())?;
            store.set_sync_value(SYNC_ONE_USD_THRESHOLD, &threshold.to_string())?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                warn!(error = %error, "failed persisting refreshed price");
                false
            }
            Err(error) => {
                warn!(error = %error, "price persist task join failed");
                false
            }
        }
    }
}

fn fresh_signatures(signatures: Vec<SignatureInfo>, watermark: u64) -> Vec<SignatureInfo> {
    signatures
        .into_iter()
        .filter(|sig| sig.slot > watermark)
        .collect()
}

/// Raw-unit equivalent of the configured USD minimum at the given price.
fn raw_threshold(usd_minimum: f64, price_usd: f64, decimals: u8) -> Option<u128> {
    if !(price_usd.is_finite() && price_usd > 0.0) || !(usd_minimum.is_finite() && usd_minimum > 0.0)
    {
        return None;
    }
    let raw = (usd_minimum / price_usd) * 10f64.powi(decimals.min(18) as i32);
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    Some(raw.round() as u128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(signature: &str, slot: u64) -> SignatureInfo {
        SignatureInfo {
            signature: signature.to_string(),
            slot,
        }
    }

    #[test]
    fn watermark_filter_keeps_strictly_newer_slots() {
        let fresh = fresh_signatures(
            vec![sig("a", 99), sig("b", 100), sig("c", 101), sig("d", 150)],
            100,
        );
        let kept: Vec<&str> = fresh.iter().map(|s| s.signature.as_str()).collect();
        assert_eq!(kept, vec!["c", "d"]);
    }

    #[test]
    fn usd_threshold_translates_into_raw_units() {
        // $1 at $0.00002 per token with 5 decimals = 50_000 ui = 5e9 raw.
        assert_eq!(raw_threshold(1.0, 0.000_02, 5), Some(5_000_000_000));
        assert_eq!(raw_threshold(1.0, 0.0, 5), None);
        assert_eq!(raw_threshold(0.0, 1.0, 5), None);
        assert_eq!(raw_threshold(f64::NAN, 1.0, 5), None);
    }
}
