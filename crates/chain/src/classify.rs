use super::HeliusAdapter;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Pool/DEX program allow-set: an address owned by one of these programs is
/// an AMM state account, not a person.
pub const AMM_PROGRAM_IDS: [(&str, &str); 6] = [
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "raydium-amm"),
    ("CPMMoo8L3F4NbTegBCKVN6DKuQh8fYfY4yR4j3uP9s5", "raydium-cpmm"),
    ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "raydium-clmm"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "orca-whirlpool"),
    ("LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo", "meteora-dlmm"),
    ("pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA", "pumpswap"),
];

const CLASSIFY_TTL: Duration = Duration::from_secs(60 * 60);
const CLASSIFY_BATCH: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct AddressClass {
    pub is_pool: bool,
    pub program: Option<String>,
}

pub(crate) fn classify_owner_program(owner: Option<&str>) -> AddressClass {
    let Some(owner) = owner else {
        return AddressClass::default();
    };
    for (program_id, label) in AMM_PROGRAM_IDS {
        if owner == program_id {
            return AddressClass {
                is_pool: true,
                program: Some(label.to_string()),
            };
        }
    }
    AddressClass::default()
}

impl HeliusAdapter {
    /// Batched owner-program lookup, memoized for an hour. Addresses the
    /// memo already covers cost no upstream calls.
    pub async fn classify_addresses(
        &self,
        addresses: &[String],
    ) -> Result<HashMap<String, AddressClass>> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        {
            let memo = self
                .classify_memo
                .lock()
                .expect("classification memo poisoned");
            for address in addresses {
                match memo.get(address) {
                    Some((class, cached_at)) if cached_at.elapsed() < CLASSIFY_TTL => {
                        out.insert(address.clone(), class.clone());
                    }
                    _ => missing.push(address.clone()),
                }
            }
        }

        for batch in missing.chunks(CLASSIFY_BATCH) {
            let result = self
                .rpc_call(
                    "getMultipleAccounts",
                    json!([batch, { "encoding": "base64" }]),
                )
                .await?;
            let accounts = result
                .get("value")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            let now = Instant::now();
            let mut memo = self
                .classify_memo
                .lock()
                .expect("classification memo poisoned");
            for (address, account) in batch.iter().zip(accounts.iter()) {
                let owner = account.get("owner").and_then(Value::as_str);
                let class = classify_owner_program(owner);
                memo.insert(address.clone(), (class.clone(), now));
                out.insert(address.clone(), class);
            }
            // Addresses past the end of a short response stay unclassified.
            for address in batch.iter().skip(accounts.len()) {
                memo.insert(address.clone(), (AddressClass::default(), now));
                out.entry(address.clone()).or_default();
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amm_owned_accounts_classify_as_pools() {
        let class = classify_owner_program(Some("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8"));
        assert!(class.is_pool);
        assert_eq!(class.program.as_deref(), Some("raydium-amm"));
    }

    #[test]
    fn ordinary_owners_are_not_pools() {
        assert!(!classify_owner_program(Some("TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA")).is_pool);
        assert!(!classify_owner_program(None).is_pool);
    }
}
