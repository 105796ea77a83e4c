use crate::error::ApiError;
use crate::rate_limit::LimitDecision;
use crate::state::SharedState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use oracle_core_types::Tier;
use oracle_storage::ApiKeyRecord;
use std::net::SocketAddr;
use tracing::{debug, warn};
use uuid::Uuid;

pub const API_KEY_HEADER: &str = "X-Oracle-Key";
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Resolved caller identity, attached to request extensions for handlers.
#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub record: Option<ApiKeyRecord>,
    pub tier: Tier,
    pub identity: String,
}

#[derive(Debug, Clone, Copy)]
struct RateHeaders {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_unix: Option<i64>,
    tier: Tier,
}

/// The gateway path every request walks, in order: HTTPS redirect, CORS,
/// maintenance gate, request correlation, API-key resolution, tier rate
/// limiting. Responses leave with the security, correlation, and
/// rate-limit headers attached; usage accounting happens off the response
/// path.
pub async fn gateway(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Response {
    let production = state.is_production();

    if production {
        if let Some(proto) = header_str(&request, "X-Forwarded-Proto") {
            if proto.eq_ignore_ascii_case("http") {
                return https_redirect(&request);
            }
        }
    }

    let origin = header_str(&request, "Origin").map(ToString::to_string);
    let origin_ok = origin
        .as_deref()
        .map(|value| origin_allowed(value, &state.config.gateway.cors_origins))
        .unwrap_or(true);

    if request.method() == Method::OPTIONS {
        return if origin_ok {
            let mut response = StatusCode::NO_CONTENT.into_response();
            apply_cors_headers(&mut response, origin.as_deref());
            apply_security_headers(&mut response, production);
            response
        } else {
            let mut response = ApiError::forbidden("origin_not_allowed", "origin is not allowed")
                .into_response();
            apply_security_headers(&mut response, production);
            response
        };
    }

    let path = request.uri().path().to_string();
    if state.config.system.maintenance && !maintenance_exempt(&path) {
        let mut response = ApiError::maintenance().into_response();
        apply_security_headers(&mut response, production);
        return response;
    }

    let request_id = header_str(&request, REQUEST_ID_HEADER)
        .filter(|value| !value.trim().is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let auth = match resolve_auth(&state, &request, peer).await {
        Ok(auth) => auth,
        Err(error) => {
            let mut response = error.into_response();
            apply_security_headers(&mut response, production);
            set_header(&mut response, REQUEST_ID_HEADER, &request_id);
            return response;
        }
    };

    let key_limits = auth
        .record
        .as_ref()
        .map(|record| (record.per_minute_limit, record.per_day_limit));
    // The push ingest path authenticates by HMAC, not by tier; the indexer
    // is not a rate-limited client.
    let decision = if path == "/k-metric/webhook" {
        LimitDecision::Unlimited
    } else {
        state
            .limiter
            .check(&auth.identity, auth.tier, key_limits, Utc::now())
    };

    let rate_headers = match decision {
        LimitDecision::Unlimited => RateHeaders {
            limit: None,
            remaining: None,
            reset_unix: None,
            tier: auth.tier,
        },
        LimitDecision::Allowed {
            limit,
            remaining,
            reset_unix,
        } => RateHeaders {
            limit: Some(limit),
            remaining: Some(remaining),
            reset_unix: Some(reset_unix),
            tier: auth.tier,
        },
        LimitDecision::MinuteExceeded {
            limit,
            retry_after,
            reset_unix,
        } => {
            let mut response = ApiError::rate_limited("minute_limit_exceeded", retry_after)
                .into_response();
            apply_rate_headers(
                &mut response,
                RateHeaders {
                    limit: Some(limit),
                    remaining: Some(0),
                    reset_unix: Some(reset_unix),
                    tier: auth.tier,
                },
            );
            apply_security_headers(&mut response, production);
            set_header(&mut response, REQUEST_ID_HEADER, &request_id);
            return response;
        }
        LimitDecision::DayExceeded {
            limit,
            retry_after,
            reset_unix,
        } => {
            let mut response =
                ApiError::rate_limited("daily_limit_exceeded", retry_after).into_response();
            apply_rate_headers(
                &mut response,
                RateHeaders {
                    limit: Some(limit),
                    remaining: Some(0),
                    reset_unix: Some(reset_unix),
                    tier: auth.tier,
                },
            );
            apply_security_headers(&mut response, production);
            set_header(&mut response, REQUEST_ID_HEADER, &request_id);
            return response;
        }
    };

    account_usage(&state, &auth);

    let method = request.method().clone();
    request.extensions_mut().insert(auth);
    let mut response = next.run(request).await;

    apply_rate_headers(&mut response, rate_headers);
    apply_cors_headers(&mut response, origin.as_deref().filter(|_| origin_ok));
    apply_security_headers(&mut response, production);
    set_header(&mut response, REQUEST_ID_HEADER, &request_id);
    debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "request completed"
    );
    response
}

async fn resolve_auth(
    state: &SharedState,
    request: &Request,
    peer: SocketAddr,
) -> Result<RequestAuth, ApiError> {
    let presented = header_str(request, API_KEY_HEADER)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string);

    let Some(plaintext) = presented else {
        return Ok(RequestAuth {
            record: None,
            tier: Tier::Public,
            identity: format!("ip:{}", client_ip(request, peer)),
        });
    };

    // The cache is keyed by the key's hash so plaintext secrets never sit
    // in memory; unknown keys negative-cache to absorb lookup storms.
    let cache_key = oracle_fanout::sign_payload_hex(b"api-key-cache", plaintext.as_bytes())
        .unwrap_or_else(|_| plaintext.clone());
    let resolved = if let Some(cached) = state.caches.api_keys.get(&cache_key).await {
        cached
    } else {
        let lookup = plaintext.clone();
        let record = state
            .read_db(move |store| store.validate_api_key(&lookup, Utc::now()))
            .await?;
        state.caches.api_keys.insert(cache_key, record.clone()).await;
        record
    };

    match resolved {
        Some(record) => Ok(RequestAuth {
            identity: format!("key:{}", record.id),
            tier: record.tier,
            record: Some(record),
        }),
        None => {
            debug!("request presented an unknown or inactive api key");
            Err(ApiError::unauthorized("invalid or expired api key"))
        }
    }
}

/// Usage accounting must never block the response; the write runs on its
/// own task.
fn account_usage(state: &SharedState, auth: &RequestAuth) {
    let Some(record) = auth.record.as_ref() else {
        return;
    };
    let key_id = record.id.clone();
    let state = SharedState::clone(state);
    tokio::spawn(async move {
        let date = Utc::now().format("%Y%m%d").to_string();
        let write_key = key_id.clone();
        let result = state
            .write_db(move |store| {
                store.record_usage(&write_key, &date, 1)?;
                store.touch_api_key(&write_key, Utc::now())
            })
            .await;
        if let Err(error) = result {
            warn!(key_id = %key_id, error = %error.message, "usage accounting failed");
        }
    });
}

fn maintenance_exempt(path: &str) -> bool {
    path == "/k-metric/status" || path == "/healthz"
}

fn https_redirect(request: &Request) -> Response {
    let host = header_str(request, "Host").unwrap_or("localhost");
    let target = format!(
        "https://{}{}",
        host,
        request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    let mut response = StatusCode::MOVED_PERMANENTLY.into_response();
    if let Ok(value) = HeaderValue::from_str(&target) {
        response.headers_mut().insert("Location", value);
    }
    response
}

fn client_ip(request: &Request, peer: SocketAddr) -> String {
    header_str(request, "X-Forwarded-For")
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

/// Allow-list entries may carry a single `*` wildcard
/// (`https://*.example.com`, `http://localhost:*`). Absent origins are
/// same-origin or non-browser callers and always pass.
pub fn origin_allowed(origin: &str, allow_list: &[String]) -> bool {
    let origin = origin.trim().trim_end_matches('/');
    for entry in allow_list {
        let entry = entry.trim().trim_end_matches('/');
        if entry == "*" {
            return true;
        }
        if let Some(star) = entry.find('*') {
            let (prefix, suffix) = (&entry[..star], &entry[star + 1..]);
            if origin.len() >= prefix.len() + suffix.len()
                && origin.starts_with(prefix)
                && origin.ends_with(suffix)
            {
                return true;
            }
        } else if origin.eq_ignore_ascii_case(entry) {
            return true;
        }
    }
    false
}

fn apply_cors_headers(response: &mut Response, origin: Option<&str>) {
    let Some(origin) = origin else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(origin) {
        let headers = response.headers_mut();
        headers.insert("Access-Control-Allow-Origin", value);
        headers.insert(
            "Access-Control-Allow-Methods",
            HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static("Content-Type, X-Oracle-Key, X-Request-ID"),
        );
        headers.insert("Vary", HeaderValue::from_static("Origin"));
    }
}

fn apply_security_headers(response: &mut Response, production: bool) {
    let headers = response.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    if production {
        headers.insert(
            "Strict-Transport-Security",
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
    }
}

fn apply_rate_headers(response: &mut Response, rate: RateHeaders) {
    let headers = response.headers_mut();
    if let Some(limit) = rate.limit {
        set_numeric(headers, "x-ratelimit-limit", limit as i64);
    }
    if let Some(remaining) = rate.remaining {
        set_numeric(headers, "x-ratelimit-remaining", remaining as i64);
    }
    if let Some(reset) = rate.reset_unix {
        set_numeric(headers, "x-ratelimit-reset", reset);
    }
    if let Ok(value) = HeaderValue::from_str(rate.tier.as_str()) {
        headers.insert(HeaderName::from_static("x-ratelimit-tier"), value);
    }
}

fn set_numeric(headers: &mut axum::http::HeaderMap, name: &'static str, value: i64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_origins_match_case_insensitively() {
        let allow = vec!["https://oracle.example".to_string()];
        assert!(origin_allowed("https://oracle.example", &allow));
        assert!(origin_allowed("HTTPS://ORACLE.EXAMPLE", &allow));
        assert!(!origin_allowed("https://evil.example", &allow));
    }

    #[test]
    fn wildcard_patterns_match_prefix_and_suffix() {
        let allow = vec![
            "https://*.example.com".to_string(),
            "http://localhost:*".to_string(),
        ];
        assert!(origin_allowed("https://app.example.com", &allow));
        assert!(origin_allowed("http://localhost:3000", &allow));
        assert!(!origin_allowed("https://example.com.evil", &allow));
        assert!(!origin_allowed("https://example.org", &allow));
    }

    #[test]
    fn bare_star_allows_everything() {
        let allow = vec!["*".to_string()];
        assert!(origin_allowed("https://anything.example", &allow));
    }
}


