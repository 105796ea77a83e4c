use chrono::{DateTime, Utc};
use oracle_core_types::BalanceChange;
use serde_json::Value;
use std::collections::BTreeMap;

/// Pure diff of pre/post token balances for the given mint. Emits one
/// change per affected owner; owners whose balance did not move are
/// skipped. Works over `getTransaction` results in jsonParsed encoding.
pub fn parse_balance_changes(raw: &Value, mint: &str) -> Vec<BalanceChange> {
    let Some(signature) = raw
        .pointer("/transaction/signatures/0")
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };
    let Some(meta) = raw.get("meta") else {
        return Vec::new();
    };
    if meta.get("err").map(|err| !err.is_null()).unwrap_or(false) {
        return Vec::new();
    }

    let slot = raw.get("slot").and_then(Value::as_u64).unwrap_or_default();
    let block_time = raw
        .get("blockTime")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    // owner -> (pre, post); BTreeMap keeps emission order deterministic.
    let mut balances: BTreeMap<String, (u128, u128)> = BTreeMap::new();
    accumulate(meta.get("preTokenBalances"), mint, &mut balances, true);
    accumulate(meta.get("postTokenBalances"), mint, &mut balances, false);

    balances
        .into_iter()
        .filter_map(|(owner, (pre, post))| {
            if pre == post {
                return None;
            }
            let amount = post as i128 - pre as i128;
            Some(BalanceChange {
                mint: mint.to_string(),
                wallet: owner,
                slot,
                block_time,
                amount,
                signature: signature.to_string(),
            })
        })
        .collect()
}

fn accumulate(
    entries: Option<&Value>,
    mint: &str,
    balances: &mut BTreeMap<String, (u128, u128)>,
    is_pre: bool,
) {
    for item in entries.and_then(Value::as_array).into_iter().flatten() {
        if item.get("mint").and_then(Value::as_str) != Some(mint) {
            continue;
        }
        let Some(owner) = item.get("owner").and_then(Value::as_str) else {
            continue;
        };
        let Some(amount) = item
            .pointer("/uiTokenAmount/amount")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<u128>().ok())
        else {
            continue;
        };
        let entry = balances.entry(owner.to_string()).or_insert((0, 0));
        if is_pre {
            entry.0 = entry.0.saturating_add(amount);
        } else {
            entry.1 = entry.1.saturating_add(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transfer_tx(mint: &str) -> Value {
        json!({
            "slot": 12_345,
            "blockTime": 1_750_000_000,
            "transaction": { "signatures": ["sig-1"] },
            "meta": {
                "err": null,
                "preTokenBalances": [
                    { "mint": mint, "owner": "sender",
                      "uiTokenAmount": { "amount": "5000", "decimals": 6 } },
                    { "mint": mint, "owner": "receiver",
                      "uiTokenAmount": { "amount": "0", "decimals": 6 } },
                    { "mint": "OtherMint", "owner": "sender",
                      "uiTokenAmount": { "amount": "77", "decimals": 6 } }
                ],
                "postTokenBalances": [
                    { "mint": mint, "owner": "sender",
                      "uiTokenAmount": { "amount": "3000", "decimals": 6 } },
                    { "mint": mint, "owner": "receiver",
                      "uiTokenAmount": { "amount": "2000", "decimals": 6 } },
                    { "mint": "OtherMint", "owner": "sender",
                      "uiTokenAmount": { "amount": "77", "decimals": 6 } }
                ]
            }
        })
    }

    #[test]
    fn emits_one_change_per_affected_owner() {
        let changes = parse_balance_changes(&transfer_tx("Mintbonk"), "Mintbonk");
        assert_eq!(changes.len(), 2);

        let receiver = changes.iter().find(|c| c.wallet == "receiver").expect("receiver");
        assert_eq!(receiver.amount, 2_000);
        assert_eq!(receiver.slot, 12_345);
        assert_eq!(receiver.signature, "sig-1");
        assert!(receiver.block_time.is_some());

        let sender = changes.iter().find(|c| c.wallet == "sender").expect("sender");
        assert_eq!(sender.amount, -2_000);
    }

    #[test]
    fn other_mints_and_unchanged_owners_are_skipped() {
        let changes = parse_balance_changes(&transfer_tx("Mintbonk"), "OtherMint");
        assert!(changes.is_empty());
    }

    #[test]
    fn failed_transactions_emit_nothing() {
        let mut tx = transfer_tx("Mintbonk");
        tx["meta"]["err"] = json!({"InstructionError": [0, "Custom"]});
        assert!(parse_balance_changes(&tx, "Mintbonk").is_empty());
    }

    #[test]
    fn amounts_beyond_u64_parse_without_truncation() {
        let big = "36893488147419103232"; // 2^65
        let tx = json!({
            "slot": 1,
            "transaction": { "signatures": ["sig-big"] },
            "meta": {
                "err": null,
                "preTokenBalances": [],
                "postTokenBalances": [
                    { "mint": "Mintbonk", "owner": "whale",
                      "uiTokenAmount": { "amount": big, "decimals": 9 } }
                ]
            }
        });
        let changes = parse_balance_changes(&tx, "Mintbonk");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].amount, 36_893_488_147_419_103_232_i128);
    }
}
