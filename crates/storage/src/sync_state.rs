use super::{ts_to_sql, SqliteStore};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// Well-known sync_state keys.
pub const SYNC_LAST_FULL_SYNC: &str = "last_full_sync";
pub const SYNC_ONE_USD_THRESHOLD: &str = "one_usd_threshold";
pub const SYNC_TOKEN_PRICE: &str = "token_price";

impl SqliteStore {
    pub fn set_sync_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_state(key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, value, ts_to_sql(Utc::now())],
            )
            .context("failed to set sync state value")?;
        Ok(())
    }

    pub fn get_sync_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("failed to get sync state value")
    }

    /// Minimum raw balance equivalent to the configured USD amount at the
    /// last successful price refresh.
    pub fn one_usd_threshold(&self) -> Result<Option<u128>> {
        Ok(self
            .get_sync_value(SYNC_ONE_USD_THRESHOLD)?
            .and_then(|raw| raw.trim().parse::<u128>().ok()))
    }

    pub fn token_price(&self) -> Result<Option<f64>> {
        Ok(self
            .get_sync_value(SYNC_TOKEN_PRICE)?
            .and_then(|raw| raw.trim().parse::<f64>().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_migrated;
    use super::*;

    #[test]
    fn sync_values_overwrite_in_place() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .set_sync_value(SYNC_TOKEN_PRICE, "0.0125")
            .expect("set");
        store
            .set_sync_value(SYNC_TOKEN_PRICE, "0.0150")
            .expect("set");
        assert_eq!(store.token_price().expect("get"), Some(0.015));
    }

    #[test]
    fn one_usd_threshold_parses_large_values() {
        let (_dir, store) = open_migrated().expect("store");
        store
            .set_sync_value(SYNC_ONE_USD_THRESHOLD, "340282366920938463463374607431768211455")
            .expect("set");
        assert_eq!(store.one_usd_threshold().expect("get"), Some(u128::MAX));
    }
}
