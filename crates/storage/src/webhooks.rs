use super::{ts_from_sql, ts_to_sql, SqliteStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use oracle_core_types::WebhookEventKind;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

pub const DELIVERY_MAX_ATTEMPTS: u32 = 3;
pub const DELIVERY_BACKOFF_SECONDS: [i64; 3] = [60, 300, 900];
pub const SUBSCRIPTION_DISABLE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub id: String,
    pub api_key_id: String,
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    pub secret: String,
    pub is_active: bool,
    pub failure_count: u32,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown delivery status in store: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryRow {
    pub id: String,
    pub subscription_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything the delivery worker needs to sign and POST one payload.
#[derive(Debug, Clone)]
pub struct DeliveryClaim {
    pub delivery_id: String,
    pub subscription_id: String,
    pub url: String,
    pub secret: String,
    pub event_type: String,
    pub payload_json: String,
    pub attempts: u32,
}

fn events_to_sql(events: &[WebhookEventKind]) -> String {
    let names: Vec<&str> = events.iter().map(|event| event.as_str()).collect();
    serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string())
}

fn events_from_sql(raw: &str) -> Vec<WebhookEventKind> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .iter()
        .filter_map(|name| WebhookEventKind::parse(name))
        .collect()
}

impl SqliteStore {
    pub fn create_subscription(
        &self,
        api_key_id: &str,
        url: &str,
        events: &[WebhookEventKind],
        secret: &str,
    ) -> Result<SubscriptionRow> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO webhook_subscriptions(
                    id, api_key_id, url, event_set, secret, is_active,
                    failure_count, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6)",
                params![
                    &id,
                    api_key_id,
                    url,
                    events_to_sql(events),
                    secret,
                    ts_to_sql(created_at),
                ],
            )
            .context("failed to create webhook subscription")?;
        Ok(SubscriptionRow {
            id,
            api_key_id: api_key_id.to_string(),
            url: url.to_string(),
            events: events.to_vec(),
            secret: secret.to_string(),
            is_active: true,
            failure_count: 0,
            last_triggered_at: None,
            created_at,
        })
    }

    pub fn get_subscription(&self, id: &str) -> Result<Option<SubscriptionRow>> {
        self.conn
            .query_row(
                "SELECT id, api_key_id, url, event_set, secret, is_active,
                        failure_count, last_triggered_at, created_at
                 FROM webhook_subscriptions WHERE id = ?1",
                params![id],
                map_subscription_row,
            )
            .optional()
            .context("failed to query webhook subscription")?
            .map(finish_subscription_row)
            .transpose()
    }

    pub fn list_subscriptions(&self, api_key_id: &str) -> Result<Vec<SubscriptionRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, api_key_id, url, event_set, secret, is_active,
                        failure_count, last_triggered_at, created_at
                 FROM webhook_subscriptions
                 WHERE api_key_id = ?1
                 ORDER BY created_at DESC",
            )
            .context("failed to prepare subscription listing")?;
        let rows = stmt
            .query_map(params![api_key_id], map_subscription_row)
            .context("failed to list webhook subscriptions")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_subscription_row(
                row.context("failed iterating subscription rows")?,
            )?);
        }
        Ok(out)
    }

    pub fn delete_subscription(&self, id: &str, api_key_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM webhook_subscriptions WHERE id = ?1 AND api_key_id = ?2",
                params![id, api_key_id],
            )
            .context("failed to delete webhook subscription")?;
        Ok(removed > 0)
    }

    /// Creates one pending delivery per active subscription selecting the
    /// event type. Dispatch returns after these inserts; POSTing happens in
    /// the delivery worker.
    pub fn create_deliveries(
        &self,
        event: WebhookEventKind,
        payload_json: &str,
    ) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, event_set FROM webhook_subscriptions WHERE is_active = 1",
            )
            .context("failed to prepare active subscription scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to scan active subscriptions")?;

        let mut matching = Vec::new();
        for row in rows {
            let (id, event_set) = row.context("failed iterating subscriptions")?;
            if events_from_sql(&event_set).contains(&event) {
                matching.push(id);
            }
        }

        let created_at = ts_to_sql(Utc::now());
        for subscription_id in &matching {
            self.conn
                .execute(
                    "INSERT INTO webhook_deliveries(
                        id, subscription_id, event_type, payload_json,
                        status, attempts, created_at
                     ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        subscription_id,
                        event.as_str(),
                        payload_json,
                        &created_at,
                    ],
                )
                .context("failed to insert webhook delivery")?;
        }
        Ok(matching.len())
    }

    /// Pending deliveries whose retry time has come, oldest first.
    pub fn claim_due_deliveries(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryClaim>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT d.id, d.subscription_id, s.url, s.secret, d.event_type,
                        d.payload_json, d.attempts
                 FROM webhook_deliveries d
                 JOIN webhook_subscriptions s ON s.id = d.subscription_id
                 WHERE d.status = 'pending'
                   AND d.attempts < ?1
                   AND (d.next_retry_at IS NULL OR d.next_retry_at <= ?2)
                   AND s.is_active = 1
                 ORDER BY d.created_at ASC
                 LIMIT ?3",
            )
            .context("failed to prepare delivery claim query")?;
        let rows = stmt
            .query_map(
                params![DELIVERY_MAX_ATTEMPTS as i64, ts_to_sql(now), limit as i64],
                |row| {
                    Ok(DeliveryClaim {
                        delivery_id: row.get(0)?,
                        subscription_id: row.get(1)?,
                        url: row.get(2)?,
                        secret: row.get(3)?,
                        event_type: row.get(4)?,
                        payload_json: row.get(5)?,
                        attempts: row.get::<_, i64>(6)?.max(0) as u32,
                    })
                },
            )
            .context("failed to claim deliveries")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed iterating delivery claims")?);
        }
        Ok(out)
    }

    pub fn mark_delivery_success(
        &self,
        delivery_id: &str,
        subscription_id: &str,
        response_code: u16,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open delivery success transaction")?;
        tx.execute(
            "UPDATE webhook_deliveries SET
                status = 'success',
                attempts = attempts + 1,
                response_code = ?2,
                next_retry_at = NULL,
                completed_at = ?3
             WHERE id = ?1",
            params![delivery_id, response_code as i64, ts_to_sql(now)],
        )
        .context("failed to mark delivery success")?;
        tx.execute(
            "UPDATE webhook_subscriptions SET
                failure_count = 0,
                last_triggered_at = ?2
             WHERE id = ?1",
            params![subscription_id, ts_to_sql(now)],
        )
        .context("failed to reset subscription failure count")?;
        tx.commit().context("failed to commit delivery success")?;
        Ok(())
    }

    /// Failure path: schedules the next retry from the backoff ladder or,
    /// once attempts are exhausted, marks the delivery terminal and counts
    /// the cascade against the subscription (auto-disable at the
    /// threshold). Terminal deliveries never reschedule.
    pub fn mark_delivery_failure(
        &self,
        delivery_id: &str,
        subscription_id: &str,
        response_code: Option<u16>,
        response_body: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to open delivery failure transaction")?;

        let attempts_before: i64 = tx
            .query_row(
                "SELECT attempts FROM webhook_deliveries WHERE id = ?1",
                params![delivery_id],
                |row| row.get(0),
            )
            .context("failed to read delivery attempts")?;
        let attempts = (attempts_before.max(0) as u32) + 1;

        let status = if attempts >= DELIVERY_MAX_ATTEMPTS {
            tx.execute(
                "UPDATE webhook_deliveries SET
                    status = 'failed',
                    attempts = ?2,
                    response_code = ?3,
                    response_body = ?4,
                    next_retry_at = NULL,
                    completed_at = ?5
                 WHERE id = ?1",
                params![
                    delivery_id,
                    attempts as i64,
                    response_code.map(|code| code as i64),
                    response_body,
                    ts_to_sql(now),
                ],
            )
            .context("failed to mark delivery failed")?;

            tx.execute(
                "UPDATE webhook_subscriptions SET
                    failure_count = failure_count + 1
                 WHERE id = ?1",
                params![subscription_id],
            )
            .context("failed to bump subscription failure count")?;
            tx.execute(
                "UPDATE webhook_subscriptions SET is_active = 0
                 WHERE id = ?1 AND failure_count >= ?2",
                params![subscription_id, SUBSCRIPTION_DISABLE_THRESHOLD as i64],
            )
            .context("failed to auto-disable subscription")?;
            DeliveryStatus::Failed
        } else {
            let backoff = DELIVERY_BACKOFF_SECONDS[(attempts - 1) as usize];
            tx.execute(
                "UPDATE webhook_deliveries SET
                    attempts = ?2,
                    response_code = ?3,
                    response_body = ?4,
                    next_retry_at = ?5
                 WHERE id = ?1",
                params![
                    delivery_id,
                    attempts as i64,
                    response_code.map(|code| code as i64),
                    response_body,
                    ts_to_sql(now + Duration::seconds(backoff)),
                ],
            )
            .context("failed to schedule delivery retry")?;
            DeliveryStatus::Pending
        };

        tx.commit().context("failed to commit delivery failure")?;
        Ok(status)
    }

    pub fn list_deliveries(
        &self,
        subscription_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT id, subscription_id, event_type, payload_json, status,
                        attempts, response_code, response_body, next_retry_at,
                        created_at, completed_at
                 FROM webhook_deliveries
                 WHERE subscription_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )
            .context("failed to prepare delivery listing")?;
        let rows = stmt
            .query_map(params![subscription_id, limit as i64], map_delivery_row)
            .context("failed to list deliveries")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_delivery_row(
                row.context("failed iterating delivery rows")?,
            )?);
        }
        Ok(out)
    }

    pub fn pending_delivery_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM webhook_deliveries WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .context("failed to count pending deliveries")?;
        Ok(count.max(0) as u64)
    }
}

struct RawSubscriptionRow {
    id: String,
    api_key_id: String,
    url: String,
    event_set: String,
    secret: String,
    is_active: i64,
    failure_count: i64,
    last_triggered_at: Option<String>,
    created_at: String,
}

fn map_subscription_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSubscriptionRow> {
    Ok(RawSubscriptionRow {
        id: row.get(0)?,
        api_key_id: row.get(1)?,
        url: row.get(2)?,
        event_set: row.get(3)?,
        secret: row.get(4)?,
        is_active: row.get(5)?,
        failure_count: row.get(6)?,
        last_triggered_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn finish_subscription_row(raw: RawSubscriptionRow) -> Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        id: raw.id,
        api_key_id: raw.api_key_id,
        url: raw.url,
        events: events_from_sql(&raw.event_set),
        secret: raw.secret,
        is_active: raw.is_active != 0,
        failure_count: raw.failure_count.max(0) as u32,
        last_triggered_at: raw
            .last_triggered_at
            .as_deref()
            .map(ts_from_sql)
            .transpose()?,
        created_at: ts_from_sql(&raw.created_at)?,
    })
}

struct RawDeliveryRow {
    id: String,
    subscription_id: String,
    event_type: String,
    payload_json: String,
    status: String,
    attempts: i64,
    response_code: Option<i64>,
    response_body: Option<String>,
    next_retry_at: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

fn map_delivery_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDeliveryRow> {
    Ok(RawDeliveryRow {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        event_type: row.get(2)?,
        payload_json: row.get(3)?,
        status: row.get(4)?,
        attempts: row.get(5)?,
        response_code: row.get(6)?,
        response_body: row.get(7)?,
        next_retry_at: row.get(8)?,
        created_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn finish_delivery_row(raw: RawDeliveryRow) -> Result<DeliveryRow> {
    Ok(DeliveryRow {
        id: raw.id,
        subscription_id: raw.subscription_id,
        event_type: raw.event_type,
        payload_json: raw.payload_json,
        status: DeliveryStatus::parse(&raw.status)?,
        attempts: raw.attempts.max(0) as u32,
        response_code: raw.response_code.map(|code| code.max(0) as u16),
        response_body: raw.response_body,
        next_retry_at: raw.next_retry_at.as_deref().map(ts_from_sql).transpose()?,
        created_at: ts_from_sql(&raw.created_at)?,
        completed_at: raw.completed_at.as_deref().map(ts_from_sql).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_migrated;
    use super::*;

    fn subscribe(store: &SqliteStore) -> SubscriptionRow {
        store
            .create_subscription(
                "key-1",
                "https://consumer.example/hook",
                &[WebhookEventKind::KChange],
                "shh",
            )
            .expect("create subscription")
    }

    #[test]
    fn dispatch_creates_deliveries_only_for_selected_events() {
        let (_dir, store) = open_migrated().expect("store");
        subscribe(&store);

        let matched = store
            .create_deliveries(WebhookEventKind::KChange, "{\"event\":\"k_change\"}")
            .expect("dispatch");
        assert_eq!(matched, 1);
        let unmatched = store
            .create_deliveries(WebhookEventKind::HolderNew, "{}")
            .expect("dispatch");
        assert_eq!(unmatched, 0);

        let due = store.claim_due_deliveries(10, Utc::now()).expect("claim");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].event_type, "k_change");
        assert_eq!(due[0].secret, "shh");
    }

    #[test]
    fn three_failures_terminate_the_delivery() {
        let (_dir, store) = open_migrated().expect("store");
        let sub = subscribe(&store);
        store
            .create_deliveries(WebhookEventKind::KChange, "{}")
            .expect("dispatch");

        let mut now = Utc::now();
        for round in 0..3 {
            let due = store.claim_due_deliveries(10, now).expect("claim");
            assert_eq!(due.len(), 1, "round {round} should have one due delivery");
            let claim = &due[0];
            let status = store
                .mark_delivery_failure(
                    &claim.delivery_id,
                    &claim.subscription_id,
                    Some(500),
                    Some("boom"),
                    now,
                )
                .expect("failure");
            if round < 2 {
                assert_eq!(status, DeliveryStatus::Pending);
                now = now + Duration::seconds(DELIVERY_BACKOFF_SECONDS[round] + 1);
            } else {
                assert_eq!(status, DeliveryStatus::Failed);
            }
        }

        let rows = store.list_deliveries(&sub.id, 10).expect("list");
        assert_eq!(rows[0].attempts, 3);
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
        assert!(rows[0].next_retry_at.is_none());

        let refreshed = store
            .get_subscription(&sub.id)
            .expect("get")
            .expect("row");
        assert_eq!(refreshed.failure_count, 1);
        assert!(refreshed.is_active);
    }

    #[test]
    fn retry_is_not_due_before_backoff_elapses() {
        let (_dir, store) = open_migrated().expect("store");
        subscribe(&store);
        store
            .create_deliveries(WebhookEventKind::KChange, "{}")
            .expect("dispatch");

        let now = Utc::now();
        let claim = store.claim_due_deliveries(10, now).expect("claim")[0].clone();
        store
            .mark_delivery_failure(&claim.delivery_id, &claim.subscription_id, Some(502), None, now)
            .expect("failure");

        assert!(store
            .claim_due_deliveries(10, now + Duration::seconds(30))
            .expect("claim")
            .is_empty());
        assert_eq!(
            store
                .claim_due_deliveries(10, now + Duration::seconds(61))
                .expect("claim")
                .len(),
            1
        );
    }

    #[test]
    fn five_failure_cascades_auto_disable_the_subscription() {
        let (_dir, store) = open_migrated().expect("store");
        let sub = subscribe(&store);

        for _ in 0..5 {
            store
                .create_deliveries(WebhookEventKind::KChange, "{}")
                .expect("dispatch");
            let mut now = Utc::now();
            loop {
                let due = store.claim_due_deliveries(10, now).expect("claim");
                let Some(claim) = due.first() else { break };
                let status = store
                    .mark_delivery_failure(
                        &claim.delivery_id,
                        &claim.subscription_id,
                        Some(500),
                        None,
                        now,
                    )
                    .expect("failure");
                if status == DeliveryStatus::Failed {
                    break;
                }
                now = now + Duration::seconds(1_000);
            }
        }

        let refreshed = store
            .get_subscription(&sub.id)
            .expect("get")
            .expect("row");
        assert_eq!(refreshed.failure_count, 5);
        assert!(!refreshed.is_active);
    }

    #[test]
    fn success_resets_failure_count_and_stamps_trigger_time() {
        let (_dir, store) = open_migrated().expect("store");
        let sub = subscribe(&store);
        store
            .create_deliveries(WebhookEventKind::KChange, "{}")
            .expect("dispatch");

        let now = Utc::now();
        let claim = store.claim_due_deliveries(10, now).expect("claim")[0].clone();
        store
            .mark_delivery_success(&claim.delivery_id, &claim.subscription_id, 200, now)
            .expect("success");

        let refreshed = store
            .get_subscription(&sub.id)
            .expect("get")
            .expect("row");
        assert_eq!(refreshed.failure_count, 0);
        assert!(refreshed.last_triggered_at.is_some());

        let rows = store.list_deliveries(&sub.id, 10).expect("list");
        assert_eq!(rows[0].status, DeliveryStatus::Success);
        assert_eq!(rows[0].response_code, Some(200));
    }
}
