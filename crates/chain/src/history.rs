use super::{HeliusAdapter, TokenPosition};
use anyhow::Result;
use chrono::{DateTime, Utc};
use oracle_core_types::apply_delta;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

const HISTORY_PAGE_LIMIT: usize = 100;

impl HeliusAdapter {
    /// Walks a wallet's enhanced transaction history newest-to-oldest and
    /// folds per-mint positions. Because pages arrive backwards in time,
    /// every receive overwrites `first_buy_amount`; once the walk ends the
    /// earliest receive is the one that stuck.
    pub async fn cross_token_history(
        &self,
        wallet: &str,
        max_pages: usize,
    ) -> Result<HashMap<String, TokenPosition>> {
        let mut positions: HashMap<String, TokenPosition> = HashMap::new();
        let mut net_delta: HashMap<String, i128> = HashMap::new();
        let mut before: Option<String> = None;

        for page in 0..max_pages.max(1) {
            let path = match &before {
                Some(cursor) => format!(
                    "/v0/addresses/{wallet}/transactions?limit={HISTORY_PAGE_LIMIT}&before={cursor}"
                ),
                None => format!("/v0/addresses/{wallet}/transactions?limit={HISTORY_PAGE_LIMIT}"),
            };
            let payload = self.api_get(&path).await?;
            let Some(items) = payload.as_array() else {
                break;
            };
            if items.is_empty() {
                break;
            }

            for item in items {
                fold_transaction(item, wallet, &mut positions, &mut net_delta);
            }

            before = items
                .last()
                .and_then(|item| item.get("signature"))
                .and_then(Value::as_str)
                .map(ToString::to_string);
            if items.len() < HISTORY_PAGE_LIMIT {
                break;
            }
            debug!(wallet, page, "continuing cross-token history walk");
        }

        // The balance sums fold in reverse order; the sum is order-free.
        for (mint, position) in positions.iter_mut() {
            let delta = net_delta.get(mint).copied().unwrap_or(0);
            position.current = apply_delta(0, delta);
        }
        Ok(positions)
    }
}

fn fold_transaction(
    item: &Value,
    wallet: &str,
    positions: &mut HashMap<String, TokenPosition>,
    net_delta: &mut HashMap<String, i128>,
) {
    let ts = item
        .get("timestamp")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    let transfers = item
        .get("tokenTransfers")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for transfer in &transfers {
        let Some(mint) = transfer.get("mint").and_then(Value::as_str) else {
            continue;
        };
        let from = transfer.get("fromUserAccount").and_then(Value::as_str);
        let to = transfer.get("toUserAccount").and_then(Value::as_str);
        let incoming = to == Some(wallet);
        let outgoing = from == Some(wallet);
        if !incoming && !outgoing {
            continue;
        }
        let Some(amount) = transfer_raw_amount(transfer) else {
            continue;
        };
        if amount == 0 {
            continue;
        }

        let position = positions.entry(mint.to_string()).or_default();
        position.tx_count = position.tx_count.saturating_add(1);
        if position.last_tx_ts.is_none() {
            // Newest-first walk: the first timestamp seen is the latest.
            position.last_tx_ts = ts;
        }

        if incoming {
            position.total_bought = position.total_bought.saturating_add(amount);
            position.first_buy_amount = amount;
            *net_delta.entry(mint.to_string()).or_default() += amount as i128;
        }
        if outgoing {
            position.total_sold = position.total_sold.saturating_add(amount);
            *net_delta.entry(mint.to_string()).or_default() -= amount as i128;
        }
    }
}

/// Enhanced-API transfers carry a float `tokenAmount` plus, for newer
/// payloads, `rawTokenAmount.tokenAmount` with `decimals`. The raw form is
/// preferred; the float is scaled only as a fallback.
fn transfer_raw_amount(transfer: &Value) -> Option<u128> {
    if let Some(raw) = transfer.pointer("/rawTokenAmount/tokenAmount") {
        if let Some(text) = raw.as_str() {
            if let Ok(parsed) = text.parse::<u128>() {
                return Some(parsed);
            }
        }
        if let Some(number) = raw.as_u64() {
            return Some(u128::from(number));
        }
    }

    let ui_amount = transfer.get("tokenAmount").and_then(Value::as_f64)?;
    if !ui_amount.is_finite() || ui_amount < 0.0 {
        return None;
    }
    let decimals = transfer
        .pointer("/rawTokenAmount/decimals")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .min(18);
    Some((ui_amount * 10f64.powi(decimals as i32)).round() as u128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer(mint: &str, from: &str, to: &str, raw: u64) -> Value {
        json!({
            "mint": mint,
            "fromUserAccount": from,
            "toUserAccount": to,
            "tokenAmount": raw as f64,
            "rawTokenAmount": { "tokenAmount": raw.to_string(), "decimals": 0 }
        })
    }

    #[test]
    fn earliest_receive_wins_when_walking_backwards() {
        let mut positions = HashMap::new();
        let mut net = HashMap::new();

        // Newest first: a later top-up of 200, then the original buy of 50.
        let newer = json!({
            "signature": "s2", "timestamp": 1_700_000_100,
            "tokenTransfers": [transfer("MintA", "pool", "me", 200)]
        });
        let older = json!({
            "signature": "s1", "timestamp": 1_700_000_000,
            "tokenTransfers": [transfer("MintA", "pool", "me", 50)]
        });
        fold_transaction(&newer, "me", &mut positions, &mut net);
        fold_transaction(&older, "me", &mut positions, &mut net);

        let position = positions.get("MintA").expect("position");
        assert_eq!(position.first_buy_amount, 50);
        assert_eq!(position.total_bought, 250);
        assert_eq!(position.tx_count, 2);
        assert_eq!(net.get("MintA"), Some(&250));
    }

    #[test]
    fn sells_reduce_net_without_touching_first_buy() {
        let mut positions = HashMap::new();
        let mut net = HashMap::new();

        let sell = json!({
            "signature": "s2", "timestamp": 1_700_000_100,
            "tokenTransfers": [transfer("MintA", "me", "pool", 30)]
        });
        let buy = json!({
            "signature": "s1", "timestamp": 1_700_000_000,
            "tokenTransfers": [transfer("MintA", "pool", "me", 100)]
        });
        fold_transaction(&sell, "me", &mut positions, &mut net);
        fold_transaction(&buy, "me", &mut positions, &mut net);

        let position = positions.get("MintA").expect("position");
        assert_eq!(position.first_buy_amount, 100);
        assert_eq!(position.total_sold, 30);
        assert_eq!(net.get("MintA"), Some(&70));
    }

    #[test]
    fn unrelated_transfers_are_ignored() {
        let mut positions = HashMap::new();
        let mut net = HashMap::new();
        let other = json!({
            "signature": "s1", "timestamp": 1_700_000_000,
            "tokenTransfers": [transfer("MintA", "alice", "bob", 10)]
        });
        fold_transaction(&other, "me", &mut positions, &mut net);
        assert!(positions.is_empty());
    }

    #[test]
    fn raw_amount_prefers_exact_raw_field() {
        let exact = json!({
            "tokenAmount": 1.5,
            "rawTokenAmount": { "tokenAmount": "1500000", "decimals": 6 }
        });
        assert_eq!(transfer_raw_amount(&exact), Some(1_500_000));

        let float_only = json!({ "tokenAmount": 2.0 });
        assert_eq!(transfer_raw_amount(&float_only), Some(2));
    }
}
