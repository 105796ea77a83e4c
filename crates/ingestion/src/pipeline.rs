use anyhow::Result;
use chrono::Utc;
use oracle_config::TokenConfig;
use oracle_core_types::{BalanceChange, HolderTransition, WebhookEventKind};
use oracle_fanout::{
    dispatch, holder_exit_payload, holder_new_payload, k_change_payload, BroadcastHub,
};
use oracle_scoring::{KCalculator, WALLET_PRIORITY_TX};
use oracle_storage::{retryable_contention, ApplyOutcome, QueueKind, SqliteStore};
use serde_json::json;
use tracing::{debug, info, warn};

const APPLY_WRITE_MAX_RETRIES: usize = 3;
const APPLY_WRITE_RETRY_BACKOFF_MS: [u64; APPLY_WRITE_MAX_RETRIES] = [50, 125, 250];

/// Applies merged push/pull batches to the store in slot order and emits
/// the change events. Both sources funnel through here, so the
/// `(signature, wallet)` insert guard in the store resolves cross-path
/// races no matter which side wins.
#[derive(Clone)]
pub struct IngestPipeline {
    hub: BroadcastHub,
    calculator: KCalculator,
    token: TokenConfig,
    alert_thresholds: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSummary {
    pub received: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub new_holders: usize,
    pub exits: usize,
    pub k: Option<u32>,
    pub k_change_dispatched: bool,
}

impl IngestPipeline {
    pub fn new(
        hub: BroadcastHub,
        calculator: KCalculator,
        token: TokenConfig,
        alert_thresholds: Vec<u32>,
    ) -> Self {
        Self {
            hub,
            calculator,
            token,
            alert_thresholds,
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Synchronous batch application; callers run this on a blocking
    /// thread with their own store handle. Event emission never blocks on
    /// consumers: WS messages go through the broadcast hub and webhook
    /// events become pending delivery rows.
    pub fn apply_batch(
        &self,
        store: &SqliteStore,
        mut changes: Vec<BalanceChange>,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary {
            received: changes.len(),
            ..BatchSummary::default()
        };
        if changes.is_empty() {
            return Ok(summary);
        }

        changes.sort_by(|a, b| {
            a.slot
                .cmp(&b.slot)
                .then_with(|| a.signature.cmp(&b.signature))
                .then_with(|| a.wallet.cmp(&b.wallet))
        });

        for change in &changes {
            let outcome = apply_with_retry(store, change)?;
            if !outcome.inserted {
                summary.duplicates += 1;
                continue;
            }
            summary.applied += 1;

            store.enqueue(QueueKind::Wallet, &change.wallet, WALLET_PRIORITY_TX)?;

            self.hub.publish(
                "tx",
                json!({
                    "signature": change.signature,
                    "wallet": change.wallet,
                    "slot": change.slot,
                    "amount": change.amount.to_string(),
                    "balance": outcome.new_balance.to_string(),
                }),
            );

            match outcome.transition {
                HolderTransition::New => {
                    summary.new_holders += 1;
                    self.hub.publish(
                        "holder:new",
                        json!({
                            "address": change.wallet,
                            "balance": outcome.new_balance.to_string(),
                            "tx_signature": change.signature,
                        }),
                    );
                    if let Err(error) = dispatch(
                        store,
                        WebhookEventKind::HolderNew,
                        holder_new_payload(&change.wallet, outcome.new_balance, &change.signature),
                    ) {
                        warn!(error = %error, wallet = %change.wallet, "holder_new dispatch failed");
                    }
                }
                HolderTransition::Exit => {
                    summary.exits += 1;
                    self.hub.publish(
                        "holder:exit",
                        json!({
                            "address": change.wallet,
                            "previous_balance": outcome.previous_balance.to_string(),
                            "tx_signature": change.signature,
                        }),
                    );
                    if let Err(error) = dispatch(
                        store,
                        WebhookEventKind::HolderExit,
                        holder_exit_payload(
                            &change.wallet,
                            outcome.previous_balance,
                            &change.signature,
                        ),
                    ) {
                        warn!(error = %error, wallet = %change.wallet, "holder_exit dispatch failed");
                    }
                }
                HolderTransition::None => {}
            }
        }

        if summary.applied > 0 {
            self.refresh_k(store, &mut summary)?;
        }
        Ok(summary)
    }

    /// Recomputes K after a batch. A move of at least one percentage point
    /// against the last persisted snapshot rebaselines (saves a snapshot)
    /// and dispatches the `k_change` webhook event.
    fn refresh_k(&self, store: &SqliteStore, summary: &mut BatchSummary) -> Result<()> {
        let now = Utc::now();
        let previous = store.latest_snapshot()?;
        let metrics = self.calculator.compute(store, now)?;
        summary.k = Some(metrics.k);

        let Some(previous) = previous else {
            // First computation ever: persist the baseline quietly.
            self.calculator.calculate_and_save(store, now)?;
            return Ok(());
        };

        let delta = metrics.k as i64 - previous.k as i64;
        if delta.abs() < 1 {
            return Ok(());
        }

        self.calculator.calculate_and_save(store, now)?;
        dispatch(
            store,
            WebhookEventKind::KChange,
            k_change_payload(previous.k, metrics.k, metrics.holders),
        )?;
        self.hub.publish(
            "k",
            json!({
                "k": metrics.k,
                "previous_k": previous.k,
                "holders": metrics.holders,
            }),
        );
        summary.k_change_dispatched = true;
        info!(
            previous_k = previous.k,
            new_k = metrics.k,
            delta,
            "k change dispatched"
        );

        for crossing in threshold_crossings(previous.k, metrics.k, &self.alert_thresholds) {
            dispatch(
                store,
                WebhookEventKind::ThresholdAlert,
                json!({
                    "threshold": crossing.threshold,
                    "direction": crossing.direction,
                    "current_k": metrics.k,
                    "message": format!(
                        "K moved {} through {} (now {})",
                        crossing.direction, crossing.threshold, metrics.k
                    ),
                }),
            )?;
        }
        Ok(())
    }

    pub fn token(&self) -> &TokenConfig {
        &self.token
    }

    pub fn calculator(&self) -> &KCalculator {
        &self.calculator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThresholdCrossing {
    threshold: u32,
    direction: &'static str,
}

fn threshold_crossings(
    previous_k: u32,
    new_k: u32,
    thresholds: &[u32],
) -> Vec<ThresholdCrossing> {
    let mut crossings = Vec::new();
    for &threshold in thresholds {
        if previous_k < threshold && new_k >= threshold {
            crossings.push(ThresholdCrossing {
                threshold,
                direction: "up",
            });
        } else if previous_k >= threshold && new_k < threshold {
            crossings.push(ThresholdCrossing {
                threshold,
                direction: "down",
            });
        }
    }
    crossings
}

/// Busy/locked contention from concurrent writers retries on a short
/// ladder; anything else propagates.
fn apply_with_retry(store: &SqliteStore, change: &BalanceChange) -> Result<ApplyOutcome> {
    for attempt in 0..=APPLY_WRITE_MAX_RETRIES {
        match store.apply_balance_change(change) {
            Ok(outcome) => return Ok(outcome),
            Err(error) => {
                if attempt < APPLY_WRITE_MAX_RETRIES && retryable_contention(&error) {
                    let backoff_ms = APPLY_WRITE_RETRY_BACKOFF_MS[attempt];
                    debug!(
                        signature = %change.signature,
                        attempt = attempt + 1,
                        backoff_ms,
                        "retrying ingest write after sqlite contention"
                    );
                    std::thread::sleep(std::time::Duration::from_millis(backoff_ms));
                    continue;
                }
                return Err(error);
            }
        }
    }
    unreachable!("retry loop must return on success or terminal error");
}

#[cfg(test)]
mod tests {
    use super::*;
    use oracle_core_types::Tier;
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

    fn pipeline() -> IngestPipeline {
        let token = TokenConfig {
            mint: "Mintbonk".to_string(),
            min_balance: 1,
            ..TokenConfig::default()
        };
        IngestPipeline::new(
            BroadcastHub::new(5),
            KCalculator::new(token.clone()),
            token,
            vec![25, 50, 75],
        )
    }

    fn change(signature: &str, wallet: &str, slot: u64, amount: i128) -> BalanceChange {
        BalanceChange {
            mint: "Mintbonk".to_string(),
            wallet: wallet.to_string(),
            slot,
            block_time: Some(Utc::now()),
            amount,
            signature: signature.to_string(),
        }
    }

    #[test]
    fn push_then_pull_of_the_same_transfer_applies_once() {
        let (_dir, store) = open_store();
        let pipeline = pipeline();

        let push = pipeline
            .apply_batch(&store, vec![change("S1", "W", 100, 1_000)])
            .expect("push batch");
        assert_eq!(push.applied, 1);
        assert_eq!(push.new_holders, 1);

        let pull = pipeline
            .apply_batch(&store, vec![change("S1", "W", 100, 1_000)])
            .expect("pull batch");
        assert_eq!(pull.applied, 0);
        assert_eq!(pull.duplicates, 1);

        assert_eq!(store.transaction_count().expect("count"), 1);
        let wallet = store.get_wallet("W").expect("get").expect("row");
        assert_eq!(wallet.first_buy_amount, Some(1_000));
        assert_eq!(wallet.current_balance, 1_000);
        assert_eq!(wallet.peak_balance, 1_000);
    }

    #[test]
    fn batches_apply_in_slot_order_regardless_of_arrival_order() {
        let (_dir, store) = open_store();
        let pipeline = pipeline();

        pipeline
            .apply_batch(
                &store,
                vec![
                    change("S2", "W", 200, -500),
                    change("S1", "W", 100, 1_000),
                ],
            )
            .expect("batch");

        let wallet = store.get_wallet("W").expect("get").expect("row");
        assert_eq!(wallet.first_buy_amount, Some(1_000));
        assert_eq!(wallet.current_balance, 500);
        assert_eq!(wallet.last_slot, 200);
    }

    #[test]
    fn applied_changes_enqueue_the_wallet_at_tx_priority() {
        let (_dir, store) = open_store();
        let pipeline = pipeline();
        pipeline
            .apply_batch(&store, vec![change("S1", "W", 100, 1_000)])
            .expect("batch");

        let item = store
            .dequeue(QueueKind::Wallet, chrono::Duration::minutes(5), Utc::now())
            .expect("dequeue")
            .expect("queued wallet");
        assert_eq!(item.key, "W");
        assert_eq!(item.priority, WALLET_PRIORITY_TX);
    }

    #[test]
    fn ws_events_flow_through_the_hub() {
        let (_dir, store) = open_store();
        let pipeline = pipeline();
        let mut rx = pipeline.hub().subscribe();

        pipeline
            .apply_batch(&store, vec![change("S1", "W", 100, 1_000)])
            .expect("batch");

        let first = rx.try_recv().expect("tx event");
        assert_eq!(first.event, "tx");
        assert_eq!(first.min_tier, Tier::Public);
        let second = rx.try_recv().expect("holder event");
        assert_eq!(second.event, "holder:new");
        assert_eq!(second.data["balance"], "1000");
    }

    #[test]
    fn k_move_of_a_point_dispatches_the_webhook() {
        let (_dir, store) = open_store();
        let pipeline = pipeline();

        // Two holders: one maintained, one soon-to-be extractor. The first
        // batch persists the quiet baseline; the second rebaselines to 50.
        pipeline
            .apply_batch(
                &store,
                vec![change("S1", "A", 100, 1_000), change("S2", "B", 110, 1_000)],
            )
            .expect("batch");
        pipeline
            .apply_batch(&store, vec![change("S3", "B", 120, -600)])
            .expect("batch");
        let baseline = store.latest_snapshot().expect("latest").expect("row");
        assert_eq!(baseline.k, 50);

        store
            .create_subscription(
                "key-1",
                "https://consumer.example/hook",
                &[WebhookEventKind::KChange],
                "secret",
            )
            .expect("subscription");

        // B buys back above the first-buy amount: K returns to 100.
        let summary = pipeline
            .apply_batch(&store, vec![change("S4", "B", 130, 700)])
            .expect("batch");
        assert!(summary.k_change_dispatched);
        assert_eq!(summary.k, Some(100));

        let due = store.claim_due_deliveries(10, Utc::now()).expect("claim");
        assert_eq!(due.len(), 1);
        let payload: serde_json::Value =
            serde_json::from_str(&due[0].payload_json).expect("payload json");
        assert_eq!(payload["event"], "k_change");
        assert_eq!(payload["data"]["previous_k"], 50);
        assert_eq!(payload["data"]["new_k"], 100);
        assert_eq!(payload["data"]["direction"], "up");
    }

    #[test]
    fn threshold_crossings_cover_both_directions() {
        let thresholds = vec![25, 50, 75];
        let up = threshold_crossings(40, 80, &thresholds);
        assert_eq!(up.len(), 2);
        assert!(up.iter().all(|c| c.direction == "up"));
        assert_eq!(up[0].threshold, 50);

        let down = threshold_crossings(50, 49, &thresholds);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].threshold, 50);
        assert_eq!(down[0].direction, "down");

        assert!(threshold_crossings(30, 45, &thresholds).is_empty());
    }

    #[test]
    fn sub_point_moves_do_not_dispatch() {
        let (_dir, store) = open_store();
        let pipeline = pipeline();

        pipeline
            .apply_batch(&store, vec![change("S1", "A", 100, 1_000)])
            .expect("batch");
        // Same holder set, same classifications: K stays at the baseline.
        let summary = pipeline
            .apply_batch(&store, vec![change("S2", "A", 110, 100)])
            .expect("batch");
        assert!(!summary.k_change_dispatched);
    }
}
