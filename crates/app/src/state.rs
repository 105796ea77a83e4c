use crate::caches::AppCaches;
use crate::error::ApiError;
use crate::rate_limit::TierLimiter;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oracle_chain::HeliusAdapter;
use oracle_config::AppConfig;
use oracle_fanout::BroadcastHub;
use oracle_ingestion::{IngestPipeline, PullSync};
use oracle_scoring::KCalculator;
use oracle_storage::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

pub type SharedState = Arc<AppContext>;

/// Top-level context owning every long-lived collaborator. Handlers and
/// background services receive clones of this Arc; nothing lives in module
/// statics.
pub struct AppContext {
    pub config: AppConfig,
    pub sqlite_path: PathBuf,
    pub hub: BroadcastHub,
    pub pipeline: IngestPipeline,
    pub calculator: KCalculator,
    pub adapter: Arc<HeliusAdapter>,
    pub pull: PullSync,
    pub caches: AppCaches,
    pub limiter: TierLimiter,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    pub fn build(config: AppConfig) -> Result<Self> {
        let sqlite_path = PathBuf::from(&config.sqlite.path);
        let adapter =
            Arc::new(HeliusAdapter::new(&config.helius).context("failed to build chain adapter")?);
        let hub = BroadcastHub::new(config.fanout.ws_max_connections_per_key);
        let calculator = KCalculator::new(config.token.clone());
        let pipeline = IngestPipeline::new(
            hub.clone(),
            calculator.clone(),
            config.token.clone(),
            config.scoring.k_alert_thresholds.clone(),
        );
        let pull = PullSync::new(
            Arc::clone(&adapter),
            pipeline.clone(),
            sqlite_path.clone(),
            config.token.clone(),
            config.ingest.clone(),
        );

        Ok(Self {
            config,
            sqlite_path,
            hub,
            pipeline,
            calculator,
            adapter,
            pull,
            caches: AppCaches::new(),
            limiter: TierLimiter::new(),
            started_at: Utc::now(),
        })
    }

    pub fn is_production(&self) -> bool {
        self.config.system.is_production()
    }

    /// Read path: a read-only store on a blocking thread, shared by every
    /// GET handler.
    pub async fn read_db<T, F>(&self, action: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
    {
        let sqlite_path = self.sqlite_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let store = SqliteStore::open_read_only(&sqlite_path)
                .with_context(|| format!("failed opening read-only sqlite: {}", sqlite_path.display()))?;
            action(&store)
        })
        .await
        .map_err(|error| ApiError::internal(format!("sqlite read task failed: {error}")))?;
        joined.map_err(|error| ApiError::internal(error.to_string()))
    }

    /// Write path: a writer store on a blocking thread.
    pub async fn write_db<T, F>(&self, action: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
    {
        let sqlite_path = self.sqlite_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let store = SqliteStore::open(&sqlite_path)
                .with_context(|| format!("failed opening sqlite: {}", sqlite_path.display()))?;
            action(&store)
        })
        .await
        .map_err(|error| ApiError::internal(format!("sqlite write task failed: {error}")))?;
        joined.map_err(|error| ApiError::internal(error.to_string()))
    }

    /// Process RSS in kilobytes, for the status endpoint. Linux-only read;
    /// other platforms report none.
    pub fn memory_rss_kb(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                return rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse::<u64>()
                    .ok();
            }
        }
        None
    }
}
