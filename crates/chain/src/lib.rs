use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

mod classify;
mod client;
mod history;
mod parser;
mod rate_limit;

pub use classify::{AddressClass, AMM_PROGRAM_IDS};
pub use parser::parse_balance_changes;
pub use rate_limit::RpcPacer;

use oracle_config::HeliusConfig;

/// Translator between the upstream indexer and the internal balance-change
/// records. Stateless apart from the outbound call pacer and the
/// classification memo.
pub struct HeliusAdapter {
    http: reqwest::Client,
    rpc_url: String,
    api_url: String,
    api_key: String,
    pacer: Option<Arc<RpcPacer>>,
    retry_max_attempts: u32,
    retry_initial_ms: u64,
    retry_max_ms: u64,
    classify_memo: Mutex<HashMap<String, (AddressClass, Instant)>>,
}

#[derive(Debug, Clone)]
pub struct HolderBalance {
    pub owner: String,
    pub balance: u128,
}

/// Token-level market info. Upstream fields fail independently; absent
/// values stay `None` rather than failing the whole fetch.
#[derive(Debug, Clone, Default)]
pub struct TokenInfo {
    pub supply: Option<u128>,
    pub price_usd: Option<f64>,
    pub price_native: Option<f64>,
    pub liquidity: Option<f64>,
    pub mcap: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
}

/// One cross-token position reconstructed from a wallet's history.
/// `first_buy_amount` is the earliest positive delta: history is walked
/// newest-to-oldest and every receive overwrites the previous value, so the
/// oldest receive wins.
#[derive(Debug, Clone, Default)]
pub struct TokenPosition {
    pub first_buy_amount: u128,
    pub total_bought: u128,
    pub total_sold: u128,
    pub current: u128,
    pub tx_count: u32,
    pub last_tx_ts: Option<DateTime<Utc>>,
}

impl HeliusAdapter {
    pub fn new(config: &HeliusConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .map_err(|error| anyhow::anyhow!("failed to build http client: {error}"))?;
        Ok(Self {
            http,
            rpc_url: config.rpc_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            pacer: RpcPacer::new(config.rpc_rps_limit, config.rpc_burst),
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_initial_ms: config.retry_initial_ms.max(1),
            retry_max_ms: config.retry_max_ms.max(1),
            classify_memo: Mutex::new(HashMap::new()),
        })
    }
}
