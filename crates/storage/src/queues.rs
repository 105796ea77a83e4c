use super::{ts_to_sql, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

/// The two background work queues share one shape: a unique key, a
/// priority, an attempt counter, and a lease column enforcing mutual
/// exclusion (`locked_until > now` means some worker holds the key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Wallet,
    Token,
}

impl QueueKind {
    fn table(self) -> &'static str {
        match self {
            Self::Wallet => "k_wallet_queue",
            Self::Token => "token_queue",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            Self::Wallet => "address",
            Self::Token => "mint",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub key: String,
    pub priority: i64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
}

impl SqliteStore {
    /// Idempotent: re-enqueueing an existing key coalesces, keeping the
    /// higher priority and the original position in line.
    pub fn enqueue(&self, kind: QueueKind, key: &str, priority: i64) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {table}({key_col}, priority, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT({key_col}) DO UPDATE SET
                priority = MAX(priority, excluded.priority)",
            table = kind.table(),
            key_col = kind.key_column(),
        );
        let before: Option<String> = self
            .conn
            .query_row(
                &format!(
                    "SELECT {key_col} FROM {table} WHERE {key_col} = ?1",
                    table = kind.table(),
                    key_col = kind.key_column()
                ),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("failed checking queue membership")?;
        self.conn
            .execute(&sql, params![key, priority, ts_to_sql(Utc::now())])
            .context("failed to enqueue")?;
        Ok(before.is_none())
    }

    /// Atomic lease acquisition: picks the highest-priority unleased key
    /// (ties broken oldest first), stamps `locked_until`, and returns it.
    /// No two callers can lease the same key while the lease lasts.
    pub fn dequeue(
        &self,
        kind: QueueKind,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open dequeue transaction")?;

        let candidate: Option<(String, i64, i64)> = tx
            .query_row(
                &format!(
                    "SELECT {key_col}, priority, attempts FROM {table}
                     WHERE locked_until IS NULL OR locked_until <= ?1
                     ORDER BY priority DESC, created_at ASC
                     LIMIT 1",
                    table = kind.table(),
                    key_col = kind.key_column()
                ),
                params![ts_to_sql(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("failed selecting dequeue candidate")?;

        let Some((key, priority, attempts)) = candidate else {
            return Ok(None);
        };

        tx.execute(
            &format!(
                "UPDATE {table} SET locked_until = ?2 WHERE {key_col} = ?1",
                table = kind.table(),
                key_col = kind.key_column()
            ),
            params![&key, ts_to_sql(now + lease)],
        )
        .context("failed stamping queue lease")?;
        tx.commit().context("failed to commit dequeue")?;

        Ok(Some(QueueItem {
            key,
            priority,
            attempts: attempts.max(0) as u32,
        }))
    }

    pub fn complete(&self, kind: QueueKind, key: &str) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "DELETE FROM {table} WHERE {key_col} = ?1",
                    table = kind.table(),
                    key_col = kind.key_column()
                ),
                params![key],
            )
            .context("failed to complete queue item")?;
        Ok(())
    }

    pub fn fail(&self, kind: QueueKind, key: &str, error: &str) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "UPDATE {table} SET
                        attempts = attempts + 1,
                        last_error = ?2,
                        locked_until = NULL
                     WHERE {key_col} = ?1",
                    table = kind.table(),
                    key_col = kind.key_column()
                ),
                params![key, error],
            )
            .context("failed to record queue failure")?;
        Ok(())
    }

    /// Drops keys that exhausted their attempts.
    pub fn cleanup_queue(&self, kind: QueueKind, max_attempts: u32) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM {table} WHERE attempts >= ?1",
                    table = kind.table()
                ),
                params![max_attempts as i64],
            )
            .context("failed to clean up queue")?;
        Ok(removed)
    }

    /// Whether the key is queued, and if so whether a worker currently
    /// holds its lease.
    pub fn queue_entry(
        &self,
        kind: QueueKind,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>> {
        let locked_until: Option<Option<String>> = self
            .conn
            .query_row(
                &format!(
                    "SELECT locked_until FROM {table} WHERE {key_col} = ?1",
                    table = kind.table(),
                    key_col = kind.key_column()
                ),
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("failed checking queue entry")?;
        Ok(locked_until.map(|lease| {
            lease
                .map(|until| until.as_str() > ts_to_sql(now).as_str())
                .unwrap_or(false)
        }))
    }

    pub fn queue_stats(&self, kind: QueueKind, now: DateTime<Utc>) -> Result<QueueStats> {
        let (pending, leased): (i64, i64) = self
            .conn
            .query_row(
                &format!(
                    "SELECT
                        COUNT(*) FILTER (WHERE locked_until IS NULL OR locked_until <= ?1),
                        COUNT(*) FILTER (WHERE locked_until > ?1)
                     FROM {table}",
                    table = kind.table()
                ),
                params![ts_to_sql(now)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed reading queue stats")?;
        Ok(QueueStats {
            pending: pending.max(0) as u64,
            leased: leased.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_migrated;
    use super::*;

    #[test]
    fn enqueue_coalesces_and_keeps_max_priority() {
        let (_dir, store) = open_migrated().expect("store");
        assert!(store.enqueue(QueueKind::Wallet, "W1", 1).expect("enqueue"));
        assert!(!store.enqueue(QueueKind::Wallet, "W1", 10).expect("enqueue"));

        let item = store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), Utc::now())
            .expect("dequeue")
            .expect("item");
        assert_eq!(item.key, "W1");
        assert_eq!(item.priority, 10);
    }

    #[test]
    fn leased_key_is_not_handed_out_twice() {
        let (_dir, store) = open_migrated().expect("store");
        store.enqueue(QueueKind::Wallet, "W1", 5).expect("enqueue");
        store.enqueue(QueueKind::Wallet, "W2", 5).expect("enqueue");

        let now = Utc::now();
        let first = store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), now)
            .expect("dequeue")
            .expect("first");
        let second = store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), now)
            .expect("dequeue")
            .expect("second");
        assert_ne!(first.key, second.key);

        assert!(store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), now)
            .expect("dequeue")
            .is_none());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let (_dir, store) = open_migrated().expect("store");
        store.enqueue(QueueKind::Token, "M1", 0).expect("enqueue");

        let now = Utc::now();
        store
            .dequeue(QueueKind::Token, Duration::minutes(10), now)
            .expect("dequeue")
            .expect("leased");

        let later = now + Duration::minutes(11);
        let reclaimed = store
            .dequeue(QueueKind::Token, Duration::minutes(10), later)
            .expect("dequeue")
            .expect("reclaimed");
        assert_eq!(reclaimed.key, "M1");
    }

    #[test]
    fn priority_preempts_older_entries() {
        let (_dir, store) = open_migrated().expect("store");
        store.enqueue(QueueKind::Wallet, "stale", 1).expect("enqueue");
        store.enqueue(QueueKind::Wallet, "fresh", 10).expect("enqueue");

        let item = store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), Utc::now())
            .expect("dequeue")
            .expect("item");
        assert_eq!(item.key, "fresh");
    }

    #[test]
    fn fail_clears_lease_and_cleanup_drops_exhausted() {
        let (_dir, store) = open_migrated().expect("store");
        store.enqueue(QueueKind::Wallet, "W1", 0).expect("enqueue");

        let now = Utc::now();
        for _ in 0..5 {
            let item = store
                .dequeue(QueueKind::Wallet, Duration::minutes(5), now)
                .expect("dequeue")
                .expect("item");
            store
                .fail(QueueKind::Wallet, &item.key, "upstream timeout")
                .expect("fail");
        }

        let removed = store.cleanup_queue(QueueKind::Wallet, 5).expect("cleanup");
        assert_eq!(removed, 1);
        assert!(store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), now)
            .expect("dequeue")
            .is_none());
    }

    #[test]
    fn complete_removes_the_key() {
        let (_dir, store) = open_migrated().expect("store");
        store.enqueue(QueueKind::Wallet, "W1", 0).expect("enqueue");
        let item = store
            .dequeue(QueueKind::Wallet, Duration::minutes(5), Utc::now())
            .expect("dequeue")
            .expect("item");
        store.complete(QueueKind::Wallet, &item.key).expect("complete");

        let stats = store
            .queue_stats(QueueKind::Wallet, Utc::now())
            .expect("stats");
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.leased, 0);
    }
}
