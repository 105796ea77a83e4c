use super::{ts_from_sql, ts_to_sql, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

impl SqliteStore {
    pub fn record_heartbeat(&self, component: &str, status: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO system_heartbeat(component, ts, status) VALUES (?1, ?2, ?3)",
                params![component, ts_to_sql(Utc::now()), status],
            )
            .context("failed to record heartbeat")?;
        Ok(())
    }

    pub fn last_heartbeat(&self, component: &str) -> Result<Option<DateTime<Utc>>> {
        self.conn
            .query_row(
                "SELECT ts FROM system_heartbeat
                 WHERE component = ?1 ORDER BY id DESC LIMIT 1",
                params![component],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read last heartbeat")?
            .as_deref()
            .map(ts_from_sql)
            .transpose()
    }
}
