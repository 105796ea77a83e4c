use crate::error::ApiError;
use crate::middleware::RequestAuth;
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use oracle_core_types::WebhookEventKind;
use oracle_storage::SubscriptionRow;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// All subscription management requires a resolved API key; subscriptions
/// are scoped to the key that created them.
fn require_key(auth: &RequestAuth) -> Result<String, ApiError> {
    auth.record
        .as_ref()
        .map(|record| record.id.clone())
        .ok_or_else(|| ApiError::unauthorized("api key required"))
}

fn parse_subscription_id(raw: &str) -> Result<String, ApiError> {
    Uuid::parse_str(raw.trim())
        .map(|id| id.to_string())
        .map_err(|_| ApiError::validation("subscription id must be a uuid"))
}

fn subscription_json(row: &SubscriptionRow, include_secret: bool) -> Value {
    json!({
        "id": row.id,
        "url": row.url,
        "events": row.events.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
        "secret": if include_secret { json!(row.secret) } else { Value::Null },
        "is_active": row.is_active,
        "failure_count": row.failure_count,
        "last_triggered_at": row.last_triggered_at,
        "created_at": row.created_at,
    })
}

pub async fn events() -> Json<Value> {
    let events: Vec<Value> = WebhookEventKind::ALL
        .iter()
        .map(|event| {
            json!({
                "name": event.as_str(),
                "description": match event {
                    WebhookEventKind::KChange =>
                        "token-wide K moved by at least one percentage point",
                    WebhookEventKind::HolderNew => "a wallet went from zero to a positive balance",
                    WebhookEventKind::HolderExit => "a holder's balance reached zero",
                    WebhookEventKind::ThresholdAlert => "K crossed a configured alert threshold",
                },
            })
        })
        .collect();
    Json(json!({ "events": events }))
}

pub async fn list(
    State(state): State<SharedState>,
    Extension(auth): Extension<RequestAuth>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_key(&auth)?;
    let rows = state
        .read_db(move |store| store.list_subscriptions(&owner))
        .await?;
    let subscriptions: Vec<Value> = rows
        .iter()
        .map(|row| subscription_json(row, false))
        .collect();
    Ok(Json(json!({
        "subscriptions": subscriptions,
        "count": subscriptions.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    url: String,
    events: Vec<String>,
    secret: Option<String>,
}

pub async fn create(
    State(state): State<SharedState>,
    Extension(auth): Extension<RequestAuth>,
    Json(body): Json<CreateBody>,
) -> Result<Response, ApiError> {
    let owner = require_key(&auth)?;

    let url = body.url.trim().to_string();
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(ApiError::validation("url must be http(s)"));
    }
    if body.events.is_empty() {
        return Err(ApiError::validation("at least one event is required"));
    }
    let mut events = Vec::new();
    for name in &body.events {
        let event = WebhookEventKind::parse(name)
            .ok_or_else(|| ApiError::validation(format!("unknown event type: {name}")))?;
        if !events.contains(&event) {
            events.push(event);
        }
    }
    let secret = body
        .secret
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("whsec_{}", Uuid::new_v4().simple()));

    let row = state
        .write_db(move |store| store.create_subscription(&owner, &url, &events, &secret))
        .await?;

    // The secret is needed by the consumer to verify deliveries; it is
    // returned here and on the single-subscription read, never in lists.
    Ok((StatusCode::CREATED, Json(subscription_json(&row, true))).into_response())
}

pub async fn show(
    State(state): State<SharedState>,
    Extension(auth): Extension<RequestAuth>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_key(&auth)?;
    let id = parse_subscription_id(&id)?;
    let row = state
        .read_db(move |store| store.get_subscription(&id))
        .await?
        .filter(|row| row.api_key_id == owner)
        .ok_or_else(|| ApiError::not_found("subscription not found"))?;
    Ok(Json(subscription_json(&row, true)))
}

pub async fn remove(
    State(state): State<SharedState>,
    Extension(auth): Extension<RequestAuth>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_key(&auth)?;
    let id = parse_subscription_id(&id)?;
    let removed = state
        .write_db(move |store| store.delete_subscription(&id, &owner))
        .await?;
    if !removed {
        return Err(ApiError::not_found("subscription not found"));
    }
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeliveriesQuery {
    limit: Option<usize>,
}

pub async fn deliveries(
    State(state): State<SharedState>,
    Extension(auth): Extension<RequestAuth>,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> Result<Json<Value>, ApiError> {
    let owner = require_key(&auth)?;
    let id = parse_subscription_id(&id)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let check_id = id.clone();
    let owned = state
        .read_db(move |store| store.get_subscription(&check_id))
        .await?
        .filter(|row| row.api_key_id == owner)
        .is_some();
    if !owned {
        return Err(ApiError::not_found("subscription not found"));
    }

    let rows = state
        .read_db(move |store| store.list_deliveries(&id, limit))
        .await?;
    let deliveries: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.id,
                "event_type": row.event_type,
                "status": row.status.as_str(),
                "attempts": row.attempts,
                "response_code": row.response_code,
                "next_retry_at": row.next_retry_at,
                "created_at": row.created_at,
                "completed_at": row.completed_at,
            })
        })
        .collect();
    Ok(Json(json!({
        "deliveries": deliveries,
        "count": deliveries.len(),
    })))
}
