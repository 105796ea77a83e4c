use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use oracle_config::TokenConfig;
use oracle_core_types::{retention, Classification};
use oracle_storage::{SnapshotRow, SqliteStore, WalletRow};
use serde::Serialize;
use tracing::info;

/// Token-wide conviction metrics for one computation instant.
#[derive(Debug, Clone, Serialize)]
pub struct KMetrics {
    pub k: u32,
    pub holders: u64,
    pub accumulators: u64,
    pub maintained: u64,
    pub reducers: u64,
    pub extractors: u64,
    pub never_sold: u64,
    pub og: u64,
    pub avg_hold_days: f64,
    #[serde(serialize_with = "serialize_u128_string")]
    pub threshold_used: u128,
    pub calculated_at: DateTime<Utc>,
}

fn serialize_u128_string<S: serde::Serializer>(
    value: &u128,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

/// Pure function of store state: reads qualifying wallets, classifies each
/// by retention, and aggregates. Never writes wallet rows; only
/// `calculate_and_save` appends a snapshot.
#[derive(Debug, Clone)]
pub struct KCalculator {
    token: TokenConfig,
}

impl KCalculator {
    pub fn new(token: TokenConfig) -> Self {
        Self { token }
    }

    /// Qualifying floor: the USD-derived threshold recorded at the last
    /// price refresh, or the static configured minimum when no price is
    /// known.
    pub fn qualifying_threshold(&self, store: &SqliteStore) -> Result<u128> {
        let dynamic = store.one_usd_threshold()?.filter(|value| *value > 0);
        Ok(dynamic.unwrap_or(self.token.min_balance as u128))
    }

    pub fn compute(&self, store: &SqliteStore, now: DateTime<Utc>) -> Result<KMetrics> {
        let threshold = self.qualifying_threshold(store)?;
        let wallets = store.get_wallets(threshold)?;

        let mut metrics = KMetrics {
            k: 0,
            holders: wallets.len() as u64,
            accumulators: 0,
            maintained: 0,
            reducers: 0,
            extractors: 0,
            never_sold: 0,
            og: 0,
            avg_hold_days: 0.0,
            threshold_used: threshold,
            calculated_at: now,
        };

        let mut hold_days_total = 0.0;
        let mut hold_days_samples = 0u64;
        for wallet in &wallets {
            match Classification::from_retention(retention(
                wallet.current_balance,
                wallet.first_buy_amount,
            )) {
                Classification::Accumulator => metrics.accumulators += 1,
                Classification::Maintained => metrics.maintained += 1,
                Classification::Reducer => metrics.reducers += 1,
                Classification::Extractor => metrics.extractors += 1,
            }
            if wallet.total_sent == 0 {
                metrics.never_sold += 1;
            }
            if let Some(days) = self.hold_days(wallet, now) {
                hold_days_total += days;
                hold_days_samples += 1;
            }
            if self.is_og(wallet, now) {
                metrics.og += 1;
            }
        }

        if hold_days_samples > 0 {
            metrics.avg_hold_days = hold_days_total / hold_days_samples as f64;
        }
        if metrics.holders > 0 {
            let convicted = metrics.accumulators + metrics.maintained;
            metrics.k = ((100.0 * convicted as f64 / metrics.holders as f64).round()) as u32;
        }
        Ok(metrics)
    }

    pub fn calculate_and_save(&self, store: &SqliteStore, now: DateTime<Utc>) -> Result<KMetrics> {
        let metrics = self.compute(store, now)?;
        store.insert_snapshot(&SnapshotRow {
            k: metrics.k,
            holders: metrics.holders,
            maintained_count: metrics.maintained,
            accumulators_count: metrics.accumulators,
            reducers_count: metrics.reducers,
            extractors_count: metrics.extractors,
            og_count: metrics.og,
            avg_hold_days: metrics.avg_hold_days,
            created_at: metrics.calculated_at,
        })?;
        info!(
            k = metrics.k,
            holders = metrics.holders,
            accumulators = metrics.accumulators,
            maintained = metrics.maintained,
            "k snapshot saved"
        );
        Ok(metrics)
    }

    pub fn hold_days(&self, wallet: &WalletRow, now: DateTime<Utc>) -> Option<f64> {
        let first_buy = wallet.first_buy_ts?;
        let seconds = (now - first_buy).num_seconds().max(0);
        Some(seconds as f64 / 86_400.0)
    }

    /// OG: bought within the early window after launch and has held at
    /// least the configured threshold since.
    pub fn is_og(&self, wallet: &WalletRow, now: DateTime<Utc>) -> bool {
        let Some(first_buy) = wallet.first_buy_ts else {
            return false;
        };
        let Some(launch) = DateTime::<Utc>::from_timestamp(self.token.launch_ts, 0) else {
            return false;
        };
        if self.token.launch_ts == 0 {
            return false;
        }
        let early_cutoff = launch + Duration::days(self.token.og_early_window_days as i64);
        if first_buy > early_cutoff || first_buy < launch {
            return false;
        }
        let held = now - first_buy;
        held >= Duration::days(self.token.og_hold_threshold_days as i64)
            && wallet.current_balance > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core_types::BalanceChange;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().expect("tempdir");
        let mut store = SqliteStore::open(&dir.path().join("oracle.db")).expect("open");
        let migrations = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("migrations");
        store.run_migrations(&migrations).expect("migrations");
        (dir, store)
    }

    fn apply(store: &SqliteStore, sig: &str, wallet: &str, slot: u64, amount: i128) {
        store
            .apply_balance_change(&BalanceChange {
                mint: "Mintbonk".to_string(),
                wallet: wallet.to_string(),
                slot,
                block_time: Some(Utc::now()),
                amount,
                signature: sig.to_string(),
            })
            .expect("apply");
    }

    fn calculator() -> KCalculator {
        KCalculator::new(TokenConfig {
            min_balance: 1,
            ..TokenConfig::default()
        })
    }

    #[test]
    fn classification_counts_sum_to_holders_and_k_follows_formula() {
        let (_dir, store) = open_store();
        // Retentions 1.8, 1.0, 0.2 across three wallets.
        apply(&store, "a1", "acc", 100, 1_000);
        apply(&store, "a2", "acc", 110, 800);
        apply(&store, "m1", "main", 100, 1_000);
        apply(&store, "e1", "extract", 100, 1_000);
        apply(&store, "e2", "extract", 120, -800);

        let metrics = calculator().compute(&store, Utc::now()).expect("compute");
        assert_eq!(metrics.holders, 3);
        assert_eq!(metrics.accumulators, 1);
        assert_eq!(metrics.maintained, 1);
        assert_eq!(metrics.extractors, 1);
        assert_eq!(
            metrics.accumulators + metrics.maintained + metrics.reducers + metrics.extractors,
            metrics.holders
        );
        assert_eq!(metrics.k, 67);
    }

    #[test]
    fn retention_three_after_topping_up_classifies_accumulator() {
        let (_dir, store) = open_store();
        apply(&store, "s1", "W", 100, 1_000);
        apply(&store, "s2", "W", 150, 2_000);

        let metrics = calculator().compute(&store, Utc::now()).expect("compute");
        assert_eq!(metrics.holders, 1);
        assert_eq!(metrics.accumulators, 1);
        assert_eq!(metrics.k, 100);
    }

    #[test]
    fn empty_store_yields_zero_k_without_division() {
        let (_dir, store) = open_store();
        let metrics = calculator().compute(&store, Utc::now()).expect("compute");
        assert_eq!(metrics.k, 0);
        assert_eq!(metrics.holders, 0);
    }

    #[test]
    fn dynamic_threshold_overrides_static_minimum() {
        let (_dir, store) = open_store();
        apply(&store, "s1", "small", 100, 500);
        apply(&store, "s2", "big", 100, 5_000);

        store
            .set_sync_value(oracle_storage::SYNC_ONE_USD_THRESHOLD, "1000")
            .expect("threshold");
        let metrics = calculator().compute(&store, Utc::now()).expect("compute");
        assert_eq!(metrics.holders, 1);
    }

    #[test]
    fn calculate_and_save_appends_a_snapshot() {
        let (_dir, store) = open_store();
        apply(&store, "s1", "W", 100, 1_000);
        let metrics = calculator()
            .calculate_and_save(&store, Utc::now())
            .expect("save");
        let snapshot = store.latest_snapshot().expect("latest").expect("row");
        assert_eq!(snapshot.k, metrics.k);
        assert_eq!(snapshot.holders, metrics.holders);
    }

    #[test]
    fn never_sold_counts_wallets_without_outflow() {
        let (_dir, store) = open_store();
        apply(&store, "s1", "diamond", 100, 1_000);
        apply(&store, "s2", "trader", 100, 1_000);
        apply(&store, "s3", "trader", 120, -100);

        let metrics = calculator().compute(&store, Utc::now()).expect("compute");
        assert_eq!(metrics.never_sold, 1);
    }
}
