use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Map, Value};

/// Request-path error with a stable kind string. Every error body is
/// `{"error": <kind>, ...}` plus any extra fields the endpoint attaches.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub extra: Map<String, Value>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(reason: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
            .with_field("reason", Value::String(reason.to_string()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn rate_limited(reason: &'static str, retry_after: u64) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "rate limit exceeded",
        )
        .with_field("reason", Value::String(reason.to_string()))
        .with_field("retry_after", json!(retry_after))
    }

    pub fn maintenance() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "maintenance",
            "service is in maintenance mode",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.kind.to_string()));
        body.insert("message".to_string(), Value::String(self.message));
        for (key, value) in self.extra.iter() {
            body.insert(key.clone(), value.clone());
        }

        let mut response = (self.status, Json(Value::Object(body))).into_response();
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(retry_after) = self.extra.get("retry_after").and_then(Value::as_u64) {
                if let Ok(value) = retry_after.to_string().parse() {
                    response.headers_mut().insert("Retry-After", value);
                }
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_carries_a_reason_field() {
        let error = ApiError::forbidden("not_holder", "holder check failed");
        assert_eq!(error.status, StatusCode::FORBIDDEN);
        assert_eq!(error.extra["reason"], "not_holder");
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let error = ApiError::rate_limited("minute_limit_exceeded", 12);
        assert_eq!(error.extra["retry_after"], 12);
        assert_eq!(error.extra["reason"], "minute_limit_exceeded");
    }
}
