use super::signing::sign_payload_hex;
use anyhow::{Context, Result};
use chrono::Utc;
use oracle_storage::DeliveryClaim;
use std::time::Duration;
use tracing::debug;

/// POSTs claimed deliveries to their subscription URLs. Store bookkeeping
/// (success/failure, retry ladder, auto-disable) stays with the caller;
/// this type owns only the HTTP leg and the signature headers.
pub struct DeliveryWorker {
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub delivered: bool,
    pub response_code: Option<u16>,
    pub response_body: Option<String>,
}

const RESPONSE_BODY_CAP: usize = 1_024;

impl DeliveryWorker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook delivery client")?;
        Ok(Self { http })
    }

    pub async fn attempt(&self, claim: &DeliveryClaim) -> DeliveryAttempt {
        let signature =
            match sign_payload_hex(claim.secret.as_bytes(), claim.payload_json.as_bytes()) {
                Ok(signature) => signature,
                Err(error) => {
                    // Unsignable payloads count as failed attempts so the
                    // subscription cascade eventually disables them.
                    return DeliveryAttempt {
                        delivered: false,
                        response_code: None,
                        response_body: Some(format!("signing failed: {error}")),
                    };
                }
            };

        let response = self
            .http
            .post(&claim.url)
            .header("Content-Type", "application/json")
            .header("X-Oracle-Signature", signature)
            .header("X-Oracle-Event", &claim.event_type)
            .header("X-Oracle-Timestamp", Utc::now().timestamp().to_string())
            .body(claim.payload_json.clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let code = response.status().as_u16();
                let delivered = response.status().is_success();
                let body = response.text().await.ok().map(|mut text| {
                    text.truncate(RESPONSE_BODY_CAP);
                    text
                });
                debug!(
                    delivery_id = %claim.delivery_id,
                    code,
                    delivered,
                    "webhook delivery attempted"
                );
                DeliveryAttempt {
                    delivered,
                    response_code: Some(code),
                    response_body: body,
                }
            }
            Err(error) => DeliveryAttempt {
                delivered: false,
                response_code: None,
                response_body: Some(error.to_string()),
            },
        }
    }
}
