use super::{HeliusAdapter, HolderBalance, SignatureInfo, TokenInfo};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

const HOLDERS_PAGE_LIMIT: usize = 1_000;
const HOLDERS_MAX_PAGES: usize = 100;

impl HeliusAdapter {
    /// JSON-RPC call with rate limiting and capped exponential retry on
    /// transient upstream failures. Permanent (4xx / RPC error object)
    /// responses propagate to the caller.
    pub(crate) async fn rpc_call(&self, method: &str, params: Value) -> Result<Value> {
        let url = format!("{}/?api-key={}", self.rpc_url, self.api_key);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut backoff_ms = self.retry_initial_ms;
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..self.retry_max_attempts {
            if let Some(pacer) = self.pacer.as_ref() {
                pacer.acquire().await;
            }

            let response = self.http.post(&url).json(&body).send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let payload: Value = response
                            .json()
                            .await
                            .context("failed to decode rpc response json")?;
                        if let Some(error) = payload.get("error") {
                            if !error.is_null() {
                                bail!("rpc {method} returned error: {error}");
                            }
                        }
                        return Ok(payload.get("result").cloned().unwrap_or(Value::Null));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = Some(anyhow!("rpc {method} upstream status {status}"));
                    } else {
                        bail!("rpc {method} rejected with status {status}");
                    }
                }
                Err(error) if error.is_timeout() || error.is_connect() || error.is_request() => {
                    last_error = Some(anyhow::Error::new(error).context(format!(
                        "rpc {method} transport failure"
                    )));
                }
                Err(error) => {
                    return Err(anyhow::Error::new(error)
                        .context(format!("rpc {method} request failed")));
                }
            }

            if attempt + 1 < self.retry_max_attempts {
                debug!(method, attempt = attempt + 1, backoff_ms, "retrying rpc call");
                time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(self.retry_max_ms);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("rpc {method} failed without a response")))
    }

    pub(crate) async fn api_get(&self, path_and_query: &str) -> Result<Value> {
        let separator = if path_and_query.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}{}{}api-key={}",
            self.api_url, path_and_query, separator, self.api_key
        );

        let mut backoff_ms = self.retry_initial_ms;
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..self.retry_max_attempts {
            if let Some(pacer) = self.pacer.as_ref() {
                pacer.acquire().await;
            }

            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .context("failed to decode enhanced api response json");
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = Some(anyhow!("enhanced api status {status}"));
                    } else {
                        bail!("enhanced api rejected with status {status}");
                    }
                }
                Err(error) if error.is_timeout() || error.is_connect() || error.is_request() => {
                    last_error =
                        Some(anyhow::Error::new(error).context("enhanced api transport failure"));
                }
                Err(error) => {
                    return Err(anyhow::Error::new(error).context("enhanced api request failed"));
                }
            }

            if attempt + 1 < self.retry_max_attempts {
                time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(self.retry_max_ms);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("enhanced api call failed without a response")))
    }

    /// Paginated full holder scan for a mint.
    pub async fn fetch_holders(&self, mint: &str) -> Result<Vec<HolderBalance>> {
        let mut holders: Vec<HolderBalance> = Vec::new();
        for page in 1..=HOLDERS_MAX_PAGES {
            let result = self
                .rpc_call(
                    "getTokenAccounts",
                    json!({
                        "mint": mint,
                        "page": page,
                        "limit": HOLDERS_PAGE_LIMIT,
                    }),
                )
                .await?;

            let accounts = result
                .get("token_accounts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if accounts.is_empty() {
                break;
            }

            for account in &accounts {
                let Some(owner) = account.get("owner").and_then(Value::as_str) else {
                    continue;
                };
                let balance = account
                    .get("amount")
                    .and_then(raw_u128)
                    .unwrap_or_default();
                if balance == 0 {
                    continue;
                }
                holders.push(HolderBalance {
                    owner: owner.to_string(),
                    balance,
                });
            }

            if accounts.len() < HOLDERS_PAGE_LIMIT {
                break;
            }
        }

        // Owners holding through several token accounts collapse to one row.
        holders.sort_by(|a, b| a.owner.cmp(&b.owner));
        holders.dedup_by(|b, a| {
            if a.owner == b.owner {
                a.balance = a.balance.saturating_add(b.balance);
                true
            } else {
                false
            }
        });
        holders.sort_by(|a, b| b.balance.cmp(&a.balance).then(a.owner.cmp(&b.owner)));
        Ok(holders)
    }

    /// Supply and pricing; each field is optional and a missing one never
    /// fails the fetch.
    pub async fn fetch_token_info(&self, mint: &str) -> Result<TokenInfo> {
        let result = self
            .rpc_call("getAsset", json!({ "id": mint }))
            .await
            .context("failed to fetch token asset info")?;

        let token_info = result.get("token_info");
        let mut info = TokenInfo {
            supply: token_info
                .and_then(|node| node.get("supply"))
                .and_then(raw_u128),
            ..TokenInfo::default()
        };
        if let Some(price_info) = token_info.and_then(|node| node.get("price_info")) {
            info.price_usd = price_info.get("price_per_token").and_then(Value::as_f64);
            info.price_native = price_info.get("price_per_token_native").and_then(Value::as_f64);
        }
        if let Some(supply) = info.supply {
            if let Some(price) = info.price_usd {
                let decimals = token_info
                    .and_then(|node| node.get("decimals"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let ui_supply = supply as f64 / 10f64.powi(decimals.min(30) as i32);
                info.mcap = Some(ui_supply * price);
            }
        }
        if info.price_usd.is_none() {
            warn!(mint, "token info fetched without usd price");
        }
        Ok(info)
    }

    /// Recent signatures touching the mint, newest first. The caller
    /// filters against its slot watermark.
    pub async fn signatures_since(&self, mint: &str, limit: usize) -> Result<Vec<SignatureInfo>> {
        let result = self
            .rpc_call(
                "getSignaturesForAddress",
                json!([mint, { "limit": limit.clamp(1, 1_000) }]),
            )
            .await?;

        let mut out = Vec::new();
        for item in result.as_array().into_iter().flatten() {
            let Some(signature) = item.get("signature").and_then(Value::as_str) else {
                continue;
            };
            // Failed transactions change no balances.
            if item.get("err").map(|err| !err.is_null()).unwrap_or(false) {
                continue;
            }
            let slot = item.get("slot").and_then(Value::as_u64).unwrap_or_default();
            out.push(SignatureInfo {
                signature: signature.to_string(),
                slot,
            });
        }
        Ok(out)
    }

    /// Sum of a wallet's token-account balances for one mint. Backs the
    /// holder-gating fallback when the store has no row for the wallet.
    pub async fn wallet_token_balance(&self, wallet: &str, mint: &str) -> Result<u128> {
        let result = self
            .rpc_call(
                "getTokenAccountsByOwner",
                json!([
                    wallet,
                    { "mint": mint },
                    { "encoding": "jsonParsed" }
                ]),
            )
            .await?;

        let mut total: u128 = 0;
        for account in result
            .get("value")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let amount = account
                .pointer("/account/data/parsed/info/tokenAmount/amount")
                .and_then(raw_u128)
                .unwrap_or_default();
            total = total.saturating_add(amount);
        }
        Ok(total)
    }

    pub async fn fetch_transaction(&self, signature: &str) -> Result<Value> {
        self.rpc_call(
            "getTransaction",
            json!([
                signature,
                {
                    "encoding": "jsonParsed",
                    "maxSupportedTransactionVersion": 0,
                    "commitment": "confirmed",
                }
            ]),
        )
        .await
        .with_context(|| format!("failed to fetch transaction {signature}"))
    }
}

pub(crate) fn raw_u128(value: &Value) -> Option<u128> {
    if let Some(raw) = value.as_str() {
        return raw.parse::<u128>().ok();
    }
    value.as_u64().map(u128::from)
}
