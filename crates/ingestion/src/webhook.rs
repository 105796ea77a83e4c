use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oracle_core_types::BalanceChange;
use serde_json::Value;

/// Decodes a verified indexer push batch into balance changes for the
/// tracked mint. Events with a non-transfer type or transfers of other
/// mints are skipped; each matching transfer yields one leg per side.
/// Signature verification happens at the gateway before this runs.
pub fn parse_push_batch(body: &[u8], mint: &str, decimals: u8) -> Result<Vec<BalanceChange>> {
    let events: Value =
        serde_json::from_slice(body).context("failed to parse push webhook body as json")?;
    let Some(events) = events.as_array() else {
        return Ok(Vec::new());
    };

    let mut changes = Vec::new();
    for event in events {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
        if !event_type.eq_ignore_ascii_case("TRANSFER") {
            continue;
        }
        let Some(signature) = event.get("signature").and_then(Value::as_str) else {
            continue;
        };
        let slot = event.get("slot").and_then(Value::as_u64).unwrap_or_default();
        let block_time = event
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        for transfer in event
            .get("tokenTransfers")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if transfer.get("mint").and_then(Value::as_str) != Some(mint) {
                continue;
            }
            let Some(amount) = transfer_amount_raw(transfer, decimals) else {
                continue;
            };
            if amount == 0 {
                continue;
            }

            if let Some(to) = transfer
                .get("toUserAccount")
                .and_then(Value::as_str)
                .filter(|account| !account.is_empty())
            {
                changes.push(BalanceChange {
                    mint: mint.to_string(),
                    wallet: to.to_string(),
                    slot,
                    block_time,
                    amount: amount as i128,
                    signature: signature.to_string(),
                });
            }
            if let Some(from) = transfer
                .get("fromUserAccount")
                .and_then(Value::as_str)
                .filter(|account| !account.is_empty())
            {
                changes.push(BalanceChange {
                    mint: mint.to_string(),
                    wallet: from.to_string(),
                    slot,
                    block_time,
                    amount: -(amount as i128),
                    signature: signature.to_string(),
                });
            }
        }
    }
    Ok(changes)
}

/// Push payloads carry a ui-scale `tokenAmount`; newer ones also include
/// the exact `rawTokenAmount`. Prefer the exact form.
fn transfer_amount_raw(transfer: &Value, decimals: u8) -> Option<u128> {
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
    Some((ui_amount * 10f64.powi(decimals.min(18) as i32)).round() as u128)
}
