use super::{ts_from_sql, ts_to_sql, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub k: u32,
    pub holders: u64,
    pub maintained_count: u64,
    pub accumulators_count: u64,
    pub reducers_count: u64,
    pub extractors_count: u64,
    pub og_count: u64,
    pub avg_hold_days: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenScoreRow {
    pub mint: String,
    pub k: u32,
    pub holders_sampled: u64,
    pub accumulators_count: u64,
    pub maintained_count: u64,
    pub reducers_count: u64,
    pub extractors_count: u64,
    pub last_sync: DateTime<Utc>,
}

impl SqliteStore {
    /// Snapshots are append-only; history queries slice by creation time.
    pub fn insert_snapshot(&self, snapshot: &SnapshotRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO snapshots(
                    k, holders, maintained_count, accumulators_count,
                    reducers_count, extractors_count, og_count, avg_hold_days,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    snapshot.k as i64,
                    snapshot.holders as i64,
                    snapshot.maintained_count as i64,
                    snapshot.accumulators_count as i64,
                    snapshot.reducers_count as i64,
                    snapshot.extractors_count as i64,
                    snapshot.og_count as i64,
                    snapshot.avg_hold_days,
                    ts_to_sql(snapshot.created_at),
                ],
            )
            .context("failed to insert snapshot")?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<SnapshotRow>> {
        self.conn
            .query_row(
                "SELECT k, holders, maintained_count, accumulators_count,
                        reducers_count, extractors_count, og_count, avg_hold_days,
                        created_at
                 FROM snapshots ORDER BY id DESC LIMIT 1",
                [],
                map_snapshot_row,
            )
            .optional()
            .context("failed to query latest snapshot")?
            .map(finish_snapshot_row)
            .transpose()
    }

    pub fn snapshot_history(&self, days: u32, now: DateTime<Utc>) -> Result<Vec<SnapshotRow>> {
        let since = now - Duration::days(days.max(1) as i64);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT k, holders, maintained_count, accumulators_count,
                        reducers_count, extractors_count, og_count, avg_hold_days,
                        created_at
                 FROM snapshots
                 WHERE created_at >= ?1
                 ORDER BY created_at ASC",
            )
            .context("failed to prepare snapshot history query")?;
        let rows = stmt
            .query_map(params![ts_to_sql(since)], map_snapshot_row)
            .context("failed to query snapshot history")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_snapshot_row(
                row.context("failed iterating snapshot rows")?,
            )?);
        }
        Ok(out)
    }

    pub fn upsert_token_score(&self, score: &TokenScoreRow) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO token_scores(
                    mint, k, holders_sampled, accumulators_count, maintained_count,
                    reducers_count, extractors_count, last_sync
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(mint) DO UPDATE SET
                    k = excluded.k,
                    holders_sampled = excluded.holders_sampled,
                    accumulators_count = excluded.accumulators_count,
                    maintained_count = excluded.maintained_count,
                    reducers_count = excluded.reducers_count,
                    extractors_count = excluded.extractors_count,
                    last_sync = excluded.last_sync",
                params![
                    &score.mint,
                    score.k as i64,
                    score.holders_sampled as i64,
                    score.accumulators_count as i64,
                    score.maintained_count as i64,
                    score.reducers_count as i64,
                    score.extractors_count as i64,
                    ts_to_sql(score.last_sync),
                ],
            )
            .context("failed to upsert token score")?;
        Ok(())
    }

    pub fn get_token_score(&self, mint: &str) -> Result<Option<TokenScoreRow>> {
        self.conn
            .query_row(
                "SELECT mint, k, holders_sampled, accumulators_count, maintained_count,
                        reducers_count, extractors_count, last_sync
                 FROM token_scores WHERE mint = ?1",
                params![mint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .context("failed to query token score")?
            .map(|raw| {
                Ok(TokenScoreRow {
                    mint: raw.0,
                    k: raw.1.max(0) as u32,
                    holders_sampled: raw.2.max(0) as u64,
                    accumulators_count: raw.3.max(0) as u64,
                    maintained_count: raw.4.max(0) as u64,
                    reducers_count: raw.5.max(0) as u64,
                    extractors_count: raw.6.max(0) as u64,
                    last_sync: ts_from_sql(&raw.7)?,
                })
            })
            .transpose()
    }
}

struct RawSnapshotRow {
    k: i64,
    holders: i64,
    maintained_count: i64,
    accumulators_count: i64,
    reducers_count: i64,
    extractors_count: i64,
    og_count: i64,
    avg_hold_days: f64,
    created_at: String,
}

fn map_snapshot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSnapshotRow> {
    Ok(RawSnapshotRow {
        k: row.get(0)?,
        holders: row.get(1)?,
        maintained_count: row.get(2)?,
        accumulators_count: row.get(3)?,
        reducers_count: row.get(4)?,
        extractors_count: row.get(5)?,
        og_count: row.get(6)?,
        avg_hold_days: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn finish_snapshot_row(raw: RawSnapshotRow) -> Result<SnapshotRow> {
    Ok(SnapshotRow {
        k: raw.k.max(0) as u32,
        holders: raw.holders.max(0) as u64,
        maintained_count: raw.maintained_count.max(0) as u64,
        accumulators_count: raw.accumulators_count.max(0) as u64,
        reducers_count: raw.reducers_count.max(0) as u64,
        extractors_count: raw.extractors_count.max(0) as u64,
        og_count: raw.og_count.max(0) as u64,
        avg_hold_days: raw.avg_hold_days,
        created_at: ts_from_sql(&raw.created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_migrated;
    use super::*;

    fn snapshot(k: u32, created_at: DateTime<Utc>) -> SnapshotRow {
        SnapshotRow {
            k,
            holders: 10,
            maintained_count: 4,
            accumulators_count: 3,
            reducers_count: 2,
            extractors_count: 1,
            og_count: 2,
            avg_hold_days: 12.5,
            created_at,
        }
    }

    #[test]
    fn latest_snapshot_returns_most_recent_insert() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .insert_snapshot(&snapshot(50, Utc::now() - Duration::hours(2)))
            .expect("insert");
        store
            .insert_snapshot(&snapshot(52, Utc::now()))
            .expect("insert");

        let latest = store.latest_snapshot().expect("query").expect("row");
        assert_eq!(latest.k, 52);
    }

    #[test]
    fn history_slices_by_window() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .insert_snapshot(&snapshot(40, Utc::now() - Duration::days(10)))
            .expect("insert");
        store
            .insert_snapshot(&snapshot(45, Utc::now() - Duration::days(2)))
            .expect("insert");
        store
            .insert_snapshot(&snapshot(50, Utc::now()))
            .expect("insert");

        let history = store.snapshot_history(7, Utc::now()).expect("history");
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at < history[1].created_at);
    }

    #[test]
    fn token_score_upsert_replaces_previous_result() {
        let (_dir, store) = open_migrated().expect("store");
        let mut score = TokenScoreRow {
            mint: "Mintbonk".to_string(),
            k: 61,
            holders_sampled: 50,
            accumulators_count: 20,
            maintained_count: 11,
            reducers_count: 10,
            extractors_count: 9,
            last_sync: Utc::now(),
        };
        store.upsert_token_score(&score).expect("upsert");
        score.k = 64;
        store.upsert_token_score(&score).expect("upsert");

        let row = store
            .get_token_score("Mintbonk")
            .expect("query")
            .expect("row");
        assert_eq!(row.k, 64);
        assert_eq!(row.holders_sampled, 50);
    }
}
