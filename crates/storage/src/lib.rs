use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oracle_core_types::{apply_delta, pad_amount, parse_amount, BalanceChange, HolderTransition};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;

mod api_keys;
mod backup;
mod contention;
mod migrations;
mod queues;
mod snapshots;
mod sync_state;
mod system;
mod webhooks;

pub use api_keys::{ApiKeyRecord, CreatedApiKey, UsageStat};
pub use contention::{contention_stats, retryable_contention, StoreContentionStats};
pub use queues::{QueueItem, QueueKind, QueueStats};
pub use snapshots::{SnapshotRow, TokenScoreRow};
pub use sync_state::{SYNC_LAST_FULL_SYNC, SYNC_ONE_USD_THRESHOLD, SYNC_TOKEN_PRICE};
pub use webhooks::{
    DeliveryClaim, DeliveryRow, DeliveryStatus, SubscriptionRow, DELIVERY_BACKOFF_SECONDS,
    DELIVERY_MAX_ATTEMPTS, SUBSCRIPTION_DISABLE_THRESHOLD,
};

/// Process-local durable state. One writer connection per task; SQLite WAL
/// plus the busy/retry ladder serializes concurrent writers across tasks.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct WalletRow {
    pub address: String,
    pub first_buy_ts: Option<DateTime<Utc>>,
    pub first_buy_amount: Option<u128>,
    pub total_received: u128,
    pub total_sent: u128,
    pub current_balance: u128,
    pub peak_balance: u128,
    pub last_slot: u64,
    pub last_tx_signature: Option<String>,
    pub k_wallet: Option<u32>,
    pub k_wallet_tokens_analyzed: u32,
    pub k_wallet_updated_at: Option<DateTime<Utc>>,
    pub k_wallet_slot: Option<u64>,
}

/// Result of pushing one balance change through the store.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOutcome {
    /// Whether a new transaction leg row was inserted. False means the
    /// change was seen before and nothing else happened.
    pub inserted: bool,
    pub transition: HolderTransition,
    pub new_balance: u128,
    pub previous_balance: u128,
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid rfc3339 timestamp in store: {raw}"))
}

pub(crate) fn amount_from_sql(raw: &str) -> Result<u128> {
    parse_amount(raw).with_context(|| format!("invalid stored amount: {raw}"))
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create sqlite parent dir: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db: {}", path.display()))?;
        Self::apply_pragmas(&conn)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")?;

        Ok(Self { conn })
    }

    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite db read-only: {}", path.display()))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .context("failed to set sqlite busy_timeout")?;
        Ok(Self { conn })
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        conn.busy_timeout(StdDuration::from_secs(5))
            .context("failed to set sqlite busy_timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set sqlite journal mode WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("failed to set sqlite synchronous NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable sqlite foreign keys")?;
        Ok(())
    }

    /// Composed ingest write: idempotent transaction-leg insert, then the
    /// slot-guarded wallet upsert. The leg insert is the dedup guard; a
    /// duplicate `(signature, wallet)` leaves wallet state untouched.
    pub fn apply_balance_change(&self, change: &BalanceChange) -> Result<ApplyOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open ingest write transaction")?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO transactions(signature, wallet, slot, block_time, amount)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &change.signature,
                    &change.wallet,
                    change.slot as i64,
                    change.block_time.map(ts_to_sql),
                    change.amount.to_string(),
                ],
            )
            .context("failed to insert transaction leg")?
            > 0;

        let existing = Self::wallet_row_tx(&tx, &change.wallet)?;
        let previous_balance = existing.as_ref().map(|row| row.current_balance).unwrap_or(0);

        if !inserted {
            tx.commit().context("failed to commit no-op ingest write")?;
            return Ok(ApplyOutcome {
                inserted: false,
                transition: HolderTransition::None,
                new_balance: previous_balance,
                previous_balance,
            });
        }

        if let Some(row) = existing.as_ref() {
            if row.last_slot >= change.slot {
                // Later slots already applied; an older change must not
                // rewind balance, first-buy, or peak state.
                tx.commit().context("failed to commit stale ingest write")?;
                return Ok(ApplyOutcome {
                    inserted: true,
                    transition: HolderTransition::None,
                    new_balance: previous_balance,
                    previous_balance,
                });
            }
        }

        let new_balance = apply_delta(previous_balance, change.amount);
        let transition = match (previous_balance, new_balance) {
            (0, n) if n > 0 => HolderTransition::New,
            (p, 0) if p > 0 => HolderTransition::Exit,
            _ => HolderTransition::None,
        };

        let change_ts = change.block_time.unwrap_or_else(Utc::now);
        let received_delta = if change.amount > 0 {
            change.amount as u128
        } else {
            0
        };
        let sent_delta = if change.amount < 0 {
            change.amount.unsigned_abs()
        } else {
            0
        };

        match existing {
            None => {
                let (first_buy_ts, first_buy_amount) = if change.amount > 0 {
                    (Some(ts_to_sql(change_ts)), Some(pad_amount(received_delta)))
                } else {
                    (None, None)
                };
                tx.execute(
                    "INSERT INTO wallets(
                        address, first_buy_ts, first_buy_amount, total_received,
                        total_sent, current_balance, peak_balance, last_slot,
                        last_tx_signature
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        &change.wallet,
                        first_buy_ts,
                        first_buy_amount,
                        pad_amount(received_delta),
                        pad_amount(sent_delta),
                        pad_amount(new_balance),
                        pad_amount(new_balance),
                        change.slot as i64,
                        &change.signature,
                    ],
                )
                .context("failed to insert wallet")?;
            }
            Some(row) => {
                let first_buy_needed = row.first_buy_amount.is_none() && change.amount > 0;
                let peak = row.peak_balance.max(new_balance);
                tx.execute(
                    "UPDATE wallets SET
                        first_buy_ts = CASE WHEN ?2 THEN ?3 ELSE first_buy_ts END,
                        first_buy_amount = CASE WHEN ?2 THEN ?4 ELSE first_buy_amount END,
                        total_received = ?5,
                        total_sent = ?6,
                        current_balance = ?7,
                        peak_balance = ?8,
                        last_slot = ?9,
                        last_tx_signature = ?10
                     WHERE address = ?1",
                    params![
                        &change.wallet,
                        first_buy_needed,
                        ts_to_sql(change_ts),
                        pad_amount(received_delta),
                        pad_amount(row.total_received.saturating_add(received_delta)),
                        pad_amount(row.total_sent.saturating_add(sent_delta)),
                        pad_amount(new_balance),
                        pad_amount(peak),
                        change.slot as i64,
                        &change.signature,
                    ],
                )
                .context("failed to update wallet")?;
            }
        }

        tx.commit().context("failed to commit ingest write")?;
        Ok(ApplyOutcome {
            inserted: true,
            transition,
            new_balance,
            previous_balance,
        })
    }

    pub fn get_wallet(&self, address: &str) -> Result<Option<WalletRow>> {
        Self::wallet_row_tx(&self.conn, address)
    }

    fn wallet_row_tx(conn: &Connection, address: &str) -> Result<Option<WalletRow>> {
        conn.query_row(
            "SELECT address, first_buy_ts, first_buy_amount, total_received, total_sent,
                    current_balance, peak_balance, last_slot, last_tx_signature,
                    k_wallet, k_wallet_tokens_analyzed, k_wallet_updated_at, k_wallet_slot
             FROM wallets WHERE address = ?1",
            params![address],
            Self::map_wallet_row,
        )
        .optional()
        .context("failed to query wallet")?
        .map(Self::finish_wallet_row)
        .transpose()
    }

    pub fn get_wallets(&self, min_balance: u128) -> Result<Vec<WalletRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT address, first_buy_ts, first_buy_amount, total_received, total_sent,
                        current_balance, peak_balance, last_slot, last_tx_signature,
                        k_wallet, k_wallet_tokens_analyzed, k_wallet_updated_at, k_wallet_slot
                 FROM wallets
                 WHERE current_balance >= ?1
                 ORDER BY current_balance DESC, address ASC",
            )
            .context("failed to prepare wallets query")?;
        let rows = stmt
            .query_map(params![pad_amount(min_balance.max(1))], Self::map_wallet_row)
            .context("failed to query wallets")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(Self::finish_wallet_row(
                row.context("failed iterating wallet rows")?,
            )?);
        }
        Ok(out)
    }

    /// Holder read path for the dashboard: balance floor, optional
    /// K_wallet floor, optional row cap. Ordering matches `get_wallets`.
    pub fn get_holders_filtered(
        &self,
        min_balance: u128,
        k_min: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<WalletRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT address, first_buy_ts, first_buy_amount, total_received, total_sent,
                        current_balance, peak_balance, last_slot, last_tx_signature,
                        k_wallet, k_wallet_tokens_analyzed, k_wallet_updated_at, k_wallet_slot
                 FROM wallets
                 WHERE current_balance >= ?1
                   AND (?2 IS NULL OR k_wallet >= ?2)
                 ORDER BY current_balance DESC, address ASC
                 LIMIT ?3",
            )
            .context("failed to prepare filtered holders query")?;
        let rows = stmt
            .query_map(
                params![
                    pad_amount(min_balance.max(1)),
                    k_min.map(|value| value as i64),
                    limit.map(|value| value as i64).unwrap_or(-1),
                ],
                Self::map_wallet_row,
            )
            .context("failed to query filtered holders")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(Self::finish_wallet_row(
                row.context("failed iterating filtered holder rows")?,
            )?);
        }
        Ok(out)
    }

    pub fn holder_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM wallets WHERE current_balance > ?1",
                params![pad_amount(0)],
                |row| row.get(0),
            )
            .context("failed to count holders")?;
        Ok(count.max(0) as u64)
    }

    pub fn wallet_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM wallets", [], |row| row.get(0))
            .context("failed to count wallets")?;
        Ok(count.max(0) as u64)
    }

    pub fn transaction_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .context("failed to count transactions")?;
        Ok(count.max(0) as u64)
    }

    /// Ingest watermark: the highest slot any applied leg carried.
    pub fn last_processed_slot(&self) -> Result<u64> {
        let slot: Option<i64> = self
            .conn
            .query_row("SELECT MAX(slot) FROM transactions", [], |row| row.get(0))
            .context("failed to read last processed slot")?;
        Ok(slot.unwrap_or(0).max(0) as u64)
    }

    /// Guarantees a wallet row exists so score writes for addresses the
    /// ingest has never seen have somewhere to land. Zeroed balances;
    /// ingest later overwrites via the slot guard as real history arrives.
    pub fn ensure_wallet_row(&self, address: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO wallets(
                    address, total_received, total_sent, current_balance, peak_balance
                 ) VALUES (?1, ?2, ?2, ?2, ?2)",
                params![address, pad_amount(0)],
            )
            .context("failed to ensure wallet row")?;
        Ok(())
    }

    pub fn update_wallet_score(
        &self,
        address: &str,
        k_wallet: u32,
        tokens_analyzed: u32,
        slot: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE wallets SET
                    k_wallet = ?2,
                    k_wallet_tokens_analyzed = ?3,
                    k_wallet_slot = ?4,
                    k_wallet_updated_at = ?5
                 WHERE address = ?1",
                params![
                    address,
                    k_wallet as i64,
                    tokens_analyzed as i64,
                    slot as i64,
                    ts_to_sql(updated_at),
                ],
            )
            .context("failed to update wallet score")?;
        Ok(())
    }

    /// Holders whose K_wallet is older than the cutoff (or never computed),
    /// oldest first, for the staleness scanner.
    pub fn stale_score_wallets(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT address FROM wallets
                 WHERE current_balance > ?1
                   AND (k_wallet_updated_at IS NULL OR k_wallet_updated_at < ?2)
                 ORDER BY k_wallet_updated_at ASC NULLS FIRST
                 LIMIT ?3",
            )
            .context("failed to prepare stale score query")?;
        let rows = stmt
            .query_map(
                params![pad_amount(0), ts_to_sql(cutoff), limit as i64],
                |row| row.get::<_, String>(0),
            )
            .context("failed to query stale score wallets")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed iterating stale score rows")?);
        }
        Ok(out)
    }

    fn map_wallet_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawWalletRow> {
        Ok(RawWalletRow {
            address: row.get(0)?,
            first_buy_ts: row.get(1)?,
            first_buy_amount: row.get(2)?,
            total_received: row.get(3)?,
            total_sent: row.get(4)?,
            current_balance: row.get(5)?,
            peak_balance: row.get(6)?,
            last_slot: row.get(7)?,
            last_tx_signature: row.get(8)?,
            k_wallet: row.get(9)?,
            k_wallet_tokens_analyzed: row.get(10)?,
            k_wallet_updated_at: row.get(11)?,
            k_wallet_slot: row.get(12)?,
        })
    }

    fn finish_wallet_row(raw: RawWalletRow) -> Result<WalletRow> {
        Ok(WalletRow {
            address: raw.address,
            first_buy_ts: raw.first_buy_ts.as_deref().map(ts_from_sql).transpose()?,
            first_buy_amount: raw
                .first_buy_amount
                .as_deref()
                .map(amount_from_sql)
                .transpose()?,
            total_received: amount_from_sql(&raw.total_received)?,
            total_sent: amount_from_sql(&raw.total_sent)?,
            current_balance: amount_from_sql(&raw.current_balance)?,
            peak_balance: amount_from_sql(&raw.peak_balance)?,
            last_slot: raw.last_slot.max(0) as u64,
            last_tx_signature: raw.last_tx_signature,
            k_wallet: raw.k_wallet.map(|value| value.max(0) as u32),
            k_wallet_tokens_analyzed: raw.k_wallet_tokens_analyzed.max(0) as u32,
            k_wallet_updated_at: raw
                .k_wallet_updated_at
                .as_deref()
                .map(ts_from_sql)
                .transpose()?,
            k_wallet_slot: raw.k_wallet_slot.map(|value| value.max(0) as u64),
        })
    }
}

struct RawWalletRow {
    address: String,
    first_buy_ts: Option<String>,
    first_buy_amount: Option<String>,
    total_received: String,
    total_sent: String,
    current_balance: String,
    peak_balance: String,
    last_slot: i64,
    last_tx_signature: Option<String>,
    k_wallet: Option<i64>,
    k_wallet_tokens_analyzed: i64,
    k_wallet_updated_at: Option<String>,
    k_wallet_slot: Option<i64>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::SqliteStore;
    use anyhow::Result;
    use std::path::PathBuf;
    use tempfile::TempDir;

    pub(crate) fn open_migrated() -> Result<(TempDir, SqliteStore)> {
        let dir = TempDir::new()?;
        let db_path = dir.path().join("oracle.db");
        let mut store = SqliteStore::open(&db_path)?;
        let migrations = repo_migrations_dir();
        store.run_migrations(&migrations)?;
        Ok((dir, store))
    }

    pub(crate) fn repo_migrations_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("migrations")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::open_migrated;
    use super::*;

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
    fn duplicate_signature_applies_once() {
        let (_dir, store) = open_migrated().expect("store");
        let first = store
            .apply_balance_change(&change("S1", "W", 100, 1_000))
            .expect("first apply");
        assert!(first.inserted);
        assert_eq!(first.transition, HolderTransition::New);

        let second = store
            .apply_balance_change(&change("S1", "W", 100, 1_000))
            .expect("second apply");
        assert!(!second.inserted);
        assert_eq!(second.transition, HolderTransition::None);

        assert_eq!(store.transaction_count().expect("count"), 1);
        let wallet = store.get_wallet("W").expect("query").expect("row");
        assert_eq!(wallet.current_balance, 1_000);
        assert_eq!(wallet.peak_balance, 1_000);
        assert_eq!(wallet.first_buy_amount, Some(1_000));
        assert_eq!(store.last_processed_slot().expect("slot"), 100);
    }

    #[test]
    fn older_slot_never_rewinds_wallet_state() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .apply_balance_change(&change("S1", "W", 200, 5_000))
            .expect("apply");
        let stale = store
            .apply_balance_change(&change("S0", "W", 150, -4_000))
            .expect("stale apply");
        assert!(stale.inserted);
        assert_eq!(stale.transition, HolderTransition::None);

        let wallet = store.get_wallet("W").expect("query").expect("row");
        assert_eq!(wallet.current_balance, 5_000);
        assert_eq!(wallet.peak_balance, 5_000);
        assert_eq!(wallet.last_slot, 200);
        assert_eq!(wallet.last_tx_signature.as_deref(), Some("S1"));
    }

    #[test]
    fn first_buy_is_write_once_and_peak_is_monotone() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .apply_balance_change(&change("S1", "W", 100, 1_000))
            .expect("apply");
        store
            .apply_balance_change(&change("S2", "W", 150, 2_000))
            .expect("apply");
        store
            .apply_balance_change(&change("S3", "W", 160, -2_500))
            .expect("apply");

        let wallet = store.get_wallet("W").expect("query").expect("row");
        assert_eq!(wallet.first_buy_amount, Some(1_000));
        assert_eq!(wallet.current_balance, 500);
        assert_eq!(wallet.peak_balance, 3_000);
        assert!(wallet.peak_balance >= wallet.current_balance);
        assert_eq!(wallet.total_received, 3_000);
        assert_eq!(wallet.total_sent, 2_500);
    }

    #[test]
    fn exit_transition_and_balance_clamp() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .apply_balance_change(&change("S1", "W", 100, 1_000))
            .expect("apply");
        let exit = store
            .apply_balance_change(&change("S2", "W", 150, -1_500))
            .expect("apply");
        assert_eq!(exit.transition, HolderTransition::Exit);
        assert_eq!(exit.new_balance, 0);
    }

    #[test]
    fn get_wallets_orders_by_balance_then_address() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .apply_balance_change(&change("S1", "B", 100, 500))
            .expect("apply");
        store
            .apply_balance_change(&change("S2", "A", 110, 500))
            .expect("apply");
        store
            .apply_balance_change(&change("S3", "C", 120, 900))
            .expect("apply");

        let wallets = store.get_wallets(1).expect("query");
        let order: Vec<&str> = wallets.iter().map(|w| w.address.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn amounts_beyond_i64_survive_round_trip() {
        let (_dir, store) = open_migrated().expect("store");
        let big = (i64::MAX as i128) * 40;
        store
            .apply_balance_change(&change("S1", "W", 100, big))
            .expect("apply");
        let wallet = store.get_wallet("W").expect("query").expect("row");
        assert_eq!(wallet.current_balance, big as u128);
    }
}
