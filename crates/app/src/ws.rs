use crate::error::ApiError;
use crate::state::SharedState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use oracle_core_types::{Tier, WsMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WsQuery {
    key: Option<String>,
}

/// WebSocket entry: authenticate by the API key in the query string,
/// enforce the per-key connection cap, then upgrade.
pub async fn ws_endpoint(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<WsQuery>,
) -> Result<Response, ApiError> {
    let Some(plaintext) = query.key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    else {
        return Err(ApiError::unauthorized("api key required for websocket"));
    };

    let lookup = plaintext.to_string();
    let record = state
        .read_db(move |store| store.validate_api_key(&lookup, Utc::now()))
        .await?
        .ok_or_else(|| ApiError::unauthorized("invalid or expired api key"))?;

    let identity = format!("key:{}", record.id);
    let Some(guard) = state.hub.register(&identity) else {
        return Err(ApiError::rate_limited("connection_limit_exceeded", 30));
    };

    let tier = record.tier;
    let heartbeat = Duration::from_secs(state.config.fanout.ws_heartbeat_seconds.max(1));
    let pong_deadline = Duration::from_secs(state.config.fanout.ws_pong_deadline_seconds.max(1));
    Ok(ws
        .on_upgrade(move |socket| async move {
            // The guard rides with the socket task; dropping it on exit
            // frees the connection slot.
            let _guard = guard;
            socket_loop(socket, state, tier, heartbeat, pong_deadline).await;
        })
        .into_response())
}

async fn socket_loop(
    mut socket: WebSocket,
    state: SharedState,
    tier: Tier,
    heartbeat: Duration,
    pong_deadline: Duration,
) {
    let mut rx = state.hub.subscribe();
    let mut ticker = time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_pong = Instant::now();

    let connected = WsMessage::broadcast("connected", json!({ "tier": tier.as_str() }));
    if send_event(&mut socket, &connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(message) => {
                        if tier < message.min_tier {
                            continue;
                        }
                        if send_event(&mut socket, &message).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let lagged = WsMessage::broadcast(
                            "status",
                            json!({ "dropped_messages": skipped, "action": "resync_required" }),
                        );
                        if send_event(&mut socket, &lagged).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_pong = Instant::now();
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_pong = Instant::now();
                        if let Some(reply) = client_message_reply(&text) {
                            if send_event(&mut socket, &reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(error = %error, "websocket read error");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if last_pong.elapsed() > pong_deadline {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Client messages are JSON actions; only `ping` has a defined reply.
fn client_message_reply(text: &str) -> Option<WsMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("action").and_then(Value::as_str) {
        Some("ping") => Some(WsMessage::broadcast(
            "pong",
            json!({ "ts": Utc::now().timestamp_millis() }),
        )),
        _ => None,
    }
}

async fn send_event(socket: &mut WebSocket, message: &WsMessage) -> Result<(), ()> {
    let payload = serde_json::to_string(message).map_err(|_| ())?;
    socket
        .send(Message::Text(payload))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_action_elicits_a_pong_envelope() {
        let reply = client_message_reply(r#"{"action":"ping"}"#).expect("pong");
        assert_eq!(reply.event, "pong");
        assert!(reply.data.get("ts").is_some());
    }

    #[test]
    fn other_actions_and_garbage_are_ignored() {
        assert!(client_message_reply(r#"{"action":"subscribe"}"#).is_none());
        assert!(client_message_reply("not json").is_none());
    }

    #[test]
    fn envelope_serializes_event_data_ts_only() {
        let message = WsMessage::for_tier("k", json!({"k": 52}), Tier::Premium);
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["event"], "k");
        assert_eq!(value["data"]["k"], 52);
        assert!(value.get("ts").is_some());
        assert!(value.get("min_tier").is_none());
    }
}
