use super::{ts_from_sql, ts_to_sql, SqliteStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use oracle_core_types::Tier;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    pub per_minute_limit: u32,
    pub per_day_limit: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The plaintext secret exists only in this value, returned once at
/// creation. Only the SHA-256 hash is stored.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub record: ApiKeyRecord,
    pub plaintext: String,
}

#[derive(Debug, Clone)]
pub struct UsageStat {
    pub date: String,
    pub requests: u64,
}

pub(crate) fn hash_api_key(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", byte);
    }
    out
}

impl SqliteStore {
    pub fn create_api_key(
        &self,
        name: &str,
        tier: Tier,
        per_minute_limit: u32,
        per_day_limit: u32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CreatedApiKey> {
        let id = Uuid::new_v4().to_string();
        let plaintext = format!("orc_{}", Uuid::new_v4().simple());
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO api_keys(
                    id, key_hash, name, tier, per_minute_limit, per_day_limit,
                    is_active, created_at, expires_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
                params![
                    &id,
                    hash_api_key(&plaintext),
                    name,
                    tier.as_str(),
                    per_minute_limit as i64,
                    per_day_limit as i64,
                    ts_to_sql(created_at),
                    expires_at.map(ts_to_sql),
                ],
            )
            .context("failed to create api key")?;

        Ok(CreatedApiKey {
            record: ApiKeyRecord {
                id,
                name: name.to_string(),
                tier,
                per_minute_limit,
                per_day_limit,
                is_active: true,
                created_at,
                expires_at,
                last_used_at: None,
            },
            plaintext,
        })
    }

    /// Resolves a presented plaintext key. Inactive and expired keys
    /// resolve to `None` exactly like unknown ones.
    pub fn validate_api_key(
        &self,
        plaintext: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ApiKeyRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, tier, per_minute_limit, per_day_limit, is_active,
                        created_at, expires_at, last_used_at
                 FROM api_keys WHERE key_hash = ?1",
                params![hash_api_key(plaintext)],
                map_api_key_row,
            )
            .optional()
            .context("failed to look up api key")?;

        let Some(record) = record else {
            return Ok(None);
        };
        let record = finish_api_key_row(record)?;
        if !record.is_active {
            return Ok(None);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= now {
                return Ok(None);
            }
        }
        Ok(Some(record))
    }

    pub fn touch_api_key(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
                params![id, ts_to_sql(now)],
            )
            .context("failed to touch api key")?;
        Ok(())
    }

    pub fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, name, tier, per_minute_limit, per_day_limit, is_active,
                        created_at, expires_at, last_used_at
                 FROM api_keys ORDER BY created_at DESC",
            )
            .context("failed to prepare api key listing")?;
        let rows = stmt
            .query_map([], map_api_key_row)
            .context("failed to list api keys")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_api_key_row(
                row.context("failed iterating api key rows")?,
            )?);
        }
        Ok(out)
    }

    pub fn deactivate_api_key(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE api_keys SET is_active = 0 WHERE id = ?1",
                params![id],
            )
            .context("failed to deactivate api key")?;
        Ok(changed > 0)
    }

    /// Aggregated daily request counter; dates are `YYYYMMDD` UTC. This is
    /// the hottest concurrent write in the process, so it rides the
    /// contention retry ladder.
    pub fn record_usage(&self, key_id: &str, date: &str, requests: u64) -> Result<()> {
        self.retrying_execute(|conn| {
            conn.execute(
                "INSERT INTO usage_daily(key_id, date, requests)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key_id, date) DO UPDATE SET
                    requests = requests + excluded.requests",
                params![key_id, date, requests as i64],
            )
        })
        .context("failed to record usage")?;
        Ok(())
    }

    pub fn usage_stats(&self, key_id: &str, limit: usize) -> Result<Vec<UsageStat>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT date, requests FROM usage_daily
                 WHERE key_id = ?1 ORDER BY date DESC LIMIT ?2",
            )
            .context("failed to prepare usage query")?;
        let rows = stmt
            .query_map(params![key_id, limit as i64], |row| {
                Ok(UsageStat {
                    date: row.get(0)?,
                    requests: row.get::<_, i64>(1)?.max(0) as u64,
                })
            })
            .context("failed to query usage stats")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed iterating usage rows")?);
        }
        Ok(out)
    }
}

struct RawApiKeyRow {
    id: String,
    name: String,
    tier: String,
    per_minute_limit: i64,
    per_day_limit: i64,
    is_active: i64,
    created_at: String,
    expires_at: Option<String>,
    last_used_at: Option<String>,
}

fn map_api_key_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawApiKeyRow> {
    Ok(RawApiKeyRow {
        id: row.get(0)?,
        name: row.get(1)?,
        tier: row.get(2)?,
        per_minute_limit: row.get(3)?,
        per_day_limit: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
        last_used_at: row.get(8)?,
    })
}

fn finish_api_key_row(raw: RawApiKeyRow) -> Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: raw.id,
        name: raw.name,
        tier: Tier::parse(&raw.tier).unwrap_or(Tier::Public),
        per_minute_limit: raw.per_minute_limit.max(0) as u32,
        per_day_limit: raw.per_day_limit.max(0) as u32,
        is_active: raw.is_active != 0,
        created_at: ts_from_sql(&raw.created_at)?,
        expires_at: raw.expires_at.as_deref().map(ts_from_sql).transpose()?,
        last_used_at: raw.last_used_at.as_deref().map(ts_from_sql).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_migrated;
    use super::*;
    use chrono::Duration;

    #[test]
    fn created_key_validates_and_hash_never_equals_plaintext() {
        let (_dir, store) = open_migrated().expect("store");
        let created = store
            .create_api_key("dashboard", Tier::Free, 500, 50_000, None)
            .expect("create");
        assert!(created.plaintext.starts_with("orc_"));
        assert_ne!(hash_api_key(&created.plaintext), created.plaintext);

        let resolved = store
            .validate_api_key(&created.plaintext, Utc::now())
            .expect("validate")
            .expect("record");
        assert_eq!(resolved.id, created.record.id);
        assert_eq!(resolved.tier, Tier::Free);
        assert_eq!(resolved.per_minute_limit, 500);
    }

    #[test]
    fn unknown_inactive_and_expired_keys_resolve_to_none() {
        let (_dir, store) = open_migrated().expect("store");
        assert!(store
            .validate_api_key("orc_nope", Utc::now())
            .expect("validate")
            .is_none());

        let created = store
            .create_api_key("temp", Tier::Standard, 1_000, 100_000, None)
            .expect("create");
        store
            .deactivate_api_key(&created.record.id)
            .expect("deactivate");
        assert!(store
            .validate_api_key(&created.plaintext, Utc::now())
            .expect("validate")
            .is_none());

        let expired = store
            .create_api_key(
                "expired",
                Tier::Premium,
                5_000,
                500_000,
                Some(Utc::now() - Duration::hours(1)),
            )
            .expect("create");
        assert!(store
            .validate_api_key(&expired.plaintext, Utc::now())
            .expect("validate")
            .is_none());
    }

    #[test]
    fn usage_counter_aggregates_per_day() {
        let (_dir, store) = open_migrated().expect("store");
        store.record_usage("key-1", "20260802", 3).expect("usage");
        store.record_usage("key-1", "20260802", 2).expect("usage");
        store.record_usage("key-1", "20260801", 1).expect("usage");

        let stats = store.usage_stats("key-1", 10).expect("stats");
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].date, "20260802");
        assert_eq!(stats[0].requests, 5);
    }
}
