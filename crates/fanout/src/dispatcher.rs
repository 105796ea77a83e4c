use anyhow::{Context, Result};
use chrono::Utc;
use oracle_core_types::WebhookEventKind;
use oracle_storage::SqliteStore;
use serde_json::{json, Value};
use tracing::debug;

/// Queues one pending delivery per matching active subscription and
/// returns. The payload envelope is frozen here so retries re-send
/// byte-identical bodies.
pub fn dispatch(store: &SqliteStore, event: WebhookEventKind, data: Value) -> Result<usize> {
    let payload = json!({
        "event": event.as_str(),
        "timestamp": Utc::now().timestamp(),
        "data": data,
    });
    let payload_json =
        serde_json::to_string(&payload).context("failed to serialize webhook payload")?;
    let queued = store.create_deliveries(event, &payload_json)?;
    if queued > 0 {
        debug!(event = event.as_str(), queued, "webhook deliveries queued");
    }
    Ok(queued)
}

pub fn k_change_payload(previous_k: u32, new_k: u32, holders: u64) -> Value {
    let delta = new_k as i64 - previous_k as i64;
    json!({
        "previous_k": previous_k,
        "new_k": new_k,
        "delta": delta,
        "holders": holders,
        "direction": if delta >= 0 { "up" } else { "down" },
    })
}

pub fn holder_new_payload(address: &str, balance: u128, tx_signature: &str) -> Value {
    json!({
        "address": address,
        "balance": balance.to_string(),
        "tx_signature": tx_signature,
    })
}

pub fn holder_exit_payload(address: &str, previous_balance: u128, tx_signature: &str) -> Value {
    json!({
        "address": address,
        "previous_balance": previous_balance.to_string(),
        "tx_signature": tx_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_change_payload_reports_direction_and_delta() {
        let up = k_change_payload(50, 52, 120);
        assert_eq!(up["previous_k"], 50);
        assert_eq!(up["new_k"], 52);
        assert_eq!(up["delta"], 2);
        assert_eq!(up["direction"], "up");
        assert_eq!(up["holders"], 120);

        let down = k_change_payload(52, 47, 120);
        assert_eq!(down["delta"], -5);
        assert_eq!(down["direction"], "down");
    }

    #[test]
    fn holder_payloads_render_amounts_as_decimal_strings() {
        let new = holder_new_payload("wallet-1", u128::MAX, "sig-1");
        assert_eq!(
            new["balance"],
            "340282366920938463463374607431768211455"
        );
        let exit = holder_exit_payload("wallet-1", 1_000, "sig-2");
        assert_eq!(exit["previous_balance"], "1000");
    }
}
