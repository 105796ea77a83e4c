use moka::future::Cache;
use oracle_scoring::KMetrics;
use oracle_storage::{ApiKeyRecord, TokenScoreRow};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// One TTL+LRU cache per semantic namespace, in front of the hot read
/// paths. moka runs its own expiry maintenance, which covers the periodic
/// sweep requirement.
pub struct AppCaches {
    /// Aggregate K metrics; 30 s freshness bound for cached reads.
    pub k_metric: Cache<&'static str, Arc<KMetrics>>,
    /// Key lookups, positive and negative (`None` = known-bad key).
    pub api_keys: Cache<String, Option<ApiKeyRecord>>,
    /// Per-wallet cross-token score responses.
    pub wallets: Cache<String, Arc<Value>>,
    /// On-demand token score rows.
    pub tokens: Cache<String, Arc<TokenScoreRow>>,
}

impl AppCaches {
    pub fn new() -> Self {
        Self {
            k_metric: Cache::builder()
                .time_to_live(Duration::from_secs(30))
                .max_capacity(4)
                .build(),
            api_keys: Cache::builder()
                .time_to_live(Duration::from_secs(5 * 60))
                .max_capacity(10_000)
                .build(),
            wallets: Cache::builder()
                .time_to_live(Duration::from_secs(60 * 60))
                .max_capacity(50_000)
                .build(),
            tokens: Cache::builder()
                .time_to_live(Duration::from_secs(5 * 60))
                .max_capacity(5_000)
                .build(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            k_metric_entries: self.k_metric.entry_count(),
            api_key_entries: self.api_keys.entry_count(),
            wallet_entries: self.wallets.entry_count(),
            token_entries: self.tokens.entry_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub k_metric_entries: u64,
    pub api_key_entries: u64,
    pub wallet_entries: u64,
    pub token_entries: u64,
}
