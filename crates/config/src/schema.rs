use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub sqlite: SqliteConfig,
    pub token: TokenConfig,
    pub helius: HeliusConfig,
    pub ingest: IngestConfig,
    pub scoring: ScoringConfig,
    pub fanout: FanoutConfig,
    pub gateway: GatewayConfig,
    pub gating: GatingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
    pub heartbeat_seconds: u64,
    pub migrations_dir: String,
    pub maintenance: bool,
}

impl SystemConfig {
    pub fn is_production(&self) -> bool {
        self.env.eq_ignore_ascii_case("production")
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            heartbeat_seconds: 30,
            migrations_dir: "migrations".to_string(),
            maintenance: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub path: String,
    pub backup_dir: String,
    pub backup_retain: usize,
    pub backup_interval_seconds: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "state/oracle.db".to_string(),
            backup_dir: "state/backups".to_string(),
            backup_retain: 5,
            backup_interval_seconds: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub mint: String,
    pub symbol: String,
    pub decimals: u8,
    /// Unix seconds of the token launch; anchors the OG early window.
    pub launch_ts: i64,
    pub og_early_window_days: u32,
    pub og_hold_threshold_days: u32,
    /// Static qualifying minimum in raw units, used when no price is known.
    pub min_balance: u64,
    /// USD amount translated into raw units for the dynamic threshold.
    pub usd_minimum: f64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            mint: String::new(),
            symbol: String::new(),
            decimals: 9,
            launch_ts: 0,
            og_early_window_days: 7,
            og_hold_threshold_days: 30,
            min_balance: 1,
            usd_minimum: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeliusConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub rpc_url: String,
    pub api_url: String,
    pub rpc_rps_limit: u64,
    pub rpc_burst: u64,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for HeliusConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            webhook_secret: String::new(),
            rpc_url: "https://mainnet.helius-rpc.com".to_string(),
            api_url: "https://api.helius.xyz".to_string(),
            rpc_rps_limit: 10,
            rpc_burst: 20,
            request_timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_initial_ms: 250,
            retry_max_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub poll_interval_seconds: u64,
    pub signature_scan_limit: usize,
    pub fetch_concurrency: usize,
    pub pull_deadline_seconds: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 300,
            signature_scan_limit: 1_000,
            fetch_concurrency: 8,
            pull_deadline_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub wallet_workers: usize,
    pub wallet_lease_seconds: u64,
    pub wallet_stale_seconds: u64,
    pub wallet_max_attempts: u32,
    pub wallet_history_max_pages: usize,
    pub token_workers: usize,
    pub token_lease_seconds: u64,
    pub token_result_ttl_seconds: u64,
    pub token_top_holders: usize,
    pub token_fetch_concurrency: usize,
    pub ecosystem_suffixes: Vec<String>,
    pub snapshot_interval_seconds: u64,
    /// K levels whose crossing raises a `threshold_alert` webhook event.
    pub k_alert_thresholds: Vec<u32>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            wallet_workers: 3,
            wallet_lease_seconds: 300,
            wallet_stale_seconds: 24 * 60 * 60,
            wallet_max_attempts: 5,
            wallet_history_max_pages: 10,
            token_workers: 2,
            token_lease_seconds: 600,
            token_result_ttl_seconds: 60 * 60,
            token_top_holders: 50,
            token_fetch_concurrency: 5,
            ecosystem_suffixes: vec!["bonk".to_string()],
            snapshot_interval_seconds: 24 * 60 * 60,
            k_alert_thresholds: vec![25, 50, 75],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub delivery_period_seconds: u64,
    pub delivery_batch: usize,
    pub delivery_timeout_seconds: u64,
    pub ws_heartbeat_seconds: u64,
    pub ws_pong_deadline_seconds: u64,
    pub ws_max_connections_per_key: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            delivery_period_seconds: 30,
            delivery_batch: 50,
            delivery_timeout_seconds: 10,
            ws_heartbeat_seconds: 30,
            ws_pong_deadline_seconds: 60,
            ws_max_connections_per_key: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub admin_key: String,
    pub body_limit_bytes: usize,
    pub body_read_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
            admin_key: String::new(),
            body_limit_bytes: 1024 * 1024,
            body_read_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatingConfig {
    pub k_global_gated: bool,
    pub k_global_min_balance: u64,
    pub k_global_fail_closed: bool,
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            k_global_gated: true,
            k_global_min_balance: 1,
            k_global_fail_closed: true,
        }
    }
}
