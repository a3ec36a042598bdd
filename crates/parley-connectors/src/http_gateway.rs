//! HTTP messaging gateway transport.
//!
//! Posts one JSON message per send to `{api_base}/slots/{identity}/messages`
//! with the tenant's bearer token. Provider status codes are classified into
//! transport error kinds so the orchestrator can retry, throttle, or suspend.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use parley_types::{ConnectionSlot, TransportError, TransportErrorKind};
use reqwest::{redirect::Policy, StatusCode};
use serde_json::{json, Value};

use crate::transport::{DeliveryReceipt, MessagingTransport, OutboundAudio};

const MAX_ERROR_DETAIL_CHARS: usize = 256;

#[derive(Debug, Clone)]
/// Public struct `HttpMessagingGatewayConfig` used to build the HTTP gateway.
pub struct HttpMessagingGatewayConfig {
    pub api_base: String,
    pub http_timeout_ms: u64,
    /// Bearer token per tenant id.
    pub tenant_tokens: BTreeMap<String, String>,
}

impl Default for HttpMessagingGatewayConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8787".to_string(),
            http_timeout_ms: 5_000,
            tenant_tokens: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
/// Public struct `HttpMessagingGateway` implementing [`MessagingTransport`] over HTTP.
pub struct HttpMessagingGateway {
    api_base: String,
    tenant_tokens: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl HttpMessagingGateway {
    pub fn new(config: HttpMessagingGatewayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms.max(1)))
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            tenant_tokens: config.tenant_tokens,
            client,
        })
    }

    fn token_for(&self, slot: &ConnectionSlot) -> Result<&str, TransportError> {
        self.tenant_tokens
            .get(&slot.tenant_id)
            .map(String::as_str)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                TransportError::new(
                    TransportErrorKind::MissingCredentials,
                    slot.tenant_id.as_str(),
                    Some(slot.slot_number),
                    "no gateway token configured for tenant",
                )
            })
    }

    async fn post(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        body: Value,
    ) -> Result<DeliveryReceipt, TransportError> {
        let token = self.token_for(slot)?;
        let endpoint = format!("{}/slots/{}/messages", self.api_base, slot.identity);
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                TransportError::new(
                    TransportErrorKind::Unavailable,
                    slot.tenant_id.as_str(),
                    Some(slot.slot_number),
                    format!("request to {endpoint} failed: {error}"),
                )
            })?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if status.is_success() {
            let payload = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);
            return Ok(DeliveryReceipt {
                tenant_id: slot.tenant_id.clone(),
                slot_number: slot.slot_number,
                contact_id: contact_id.to_string(),
                provider_message_id: payload
                    .get("message_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        Err(TransportError::new(
            classify_gateway_status(status),
            slot.tenant_id.as_str(),
            Some(slot.slot_number),
            format!("status={} body={}", status.as_u16(), truncate_detail(&raw)),
        ))
    }
}

#[async_trait]
impl MessagingTransport for HttpMessagingGateway {
    fn transport_name(&self) -> &'static str {
        "http-gateway"
    }

    async fn send_text(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.post(slot, contact_id, json!({ "contact_id": contact_id, "text": text }))
            .await
    }

    async fn send_audio(
        &self,
        slot: &ConnectionSlot,
        contact_id: &str,
        audio: &OutboundAudio,
    ) -> Result<DeliveryReceipt, TransportError> {
        self.post(
            slot,
            contact_id,
            json!({
                "contact_id": contact_id,
                "audio_base64": BASE64_STANDARD.encode(&audio.bytes),
                "mime_type": audio.mime_type,
            }),
        )
        .await
    }
}

fn classify_gateway_status(status: StatusCode) -> TransportErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TransportErrorKind::RateLimited;
    }
    if status == StatusCode::FORBIDDEN {
        return TransportErrorKind::Blocked;
    }
    if status == StatusCode::UNAUTHORIZED {
        return TransportErrorKind::MissingCredentials;
    }
    if status.is_server_error() {
        return TransportErrorKind::Unavailable;
    }
    if status.is_client_error() {
        return TransportErrorKind::Rejected;
    }
    TransportErrorKind::Unavailable
}

fn truncate_detail(raw: &str) -> String {
    raw.chars().take(MAX_ERROR_DETAIL_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use parley_types::RateLimitStatus;
    use serde_json::json;

    use super::*;

    fn slot() -> ConnectionSlot {
        ConnectionSlot {
            tenant_id: "acme".to_string(),
            slot_number: 0,
            connected: true,
            identity: "5511999".to_string(),
            load: 0,
            rate_limit: RateLimitStatus::Normal,
        }
    }

    fn gateway(base_url: String, with_token: bool) -> HttpMessagingGateway {
        let mut tenant_tokens = BTreeMap::new();
        if with_token {
            tenant_tokens.insert("acme".to_string(), "secret-token".to_string());
        }
        HttpMessagingGateway::new(HttpMessagingGatewayConfig {
            api_base: base_url,
            http_timeout_ms: 2_000,
            tenant_tokens,
        })
        .expect("gateway")
    }

    #[tokio::test]
    async fn functional_send_text_posts_bearer_authenticated_json() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/slots/5511999/messages")
                .header("authorization", "Bearer secret-token")
                .body_includes("\"contact_id\":\"+5511\"")
                .body_includes("\"text\":\"Question 1\"");
            then.status(200).json_body(json!({"message_id": "wamid-1"}));
        });

        let receipt = gateway(server.base_url(), true)
            .send_text(&slot(), "+5511", "Question 1")
            .await
            .expect("send should succeed");
        send.assert_calls(1);
        assert_eq!(receipt.provider_message_id.as_deref(), Some("wamid-1"));
    }

    #[tokio::test]
    async fn functional_send_audio_encodes_base64_payload() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/slots/5511999/messages")
                .body_includes("\"audio_base64\":\"AQID\"")
                .body_includes("\"mime_type\":\"audio/ogg\"");
            then.status(202);
        });

        gateway(server.base_url(), true)
            .send_audio(
                &slot(),
                "+5511",
                &OutboundAudio {
                    bytes: vec![1, 2, 3],
                    mime_type: "audio/ogg".to_string(),
                },
            )
            .await
            .expect("audio send should succeed");
        send.assert_calls(1);
    }

    #[tokio::test]
    async fn regression_rate_limit_and_block_statuses_are_classified() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/slots/5511999/messages");
            then.status(429).body("slow down");
        });
        let error = gateway(server.base_url(), true)
            .send_text(&slot(), "+5511", "hi")
            .await
            .expect_err("rate limited");
        assert_eq!(error.kind, TransportErrorKind::RateLimited);
        assert!(error.detail.contains("status=429"));

        assert_eq!(
            classify_gateway_status(StatusCode::FORBIDDEN),
            TransportErrorKind::Blocked
        );
        assert_eq!(
            classify_gateway_status(StatusCode::BAD_GATEWAY),
            TransportErrorKind::Unavailable
        );
        assert_eq!(
            classify_gateway_status(StatusCode::UNPROCESSABLE_ENTITY),
            TransportErrorKind::Rejected
        );
    }

    #[tokio::test]
    async fn regression_missing_token_fails_without_network_call() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST).path("/slots/5511999/messages");
            then.status(200);
        });
        let error = gateway(server.base_url(), false)
            .send_text(&slot(), "+5511", "hi")
            .await
            .expect_err("missing credentials");
        assert_eq!(error.kind, TransportErrorKind::MissingCredentials);
        assert!(error.is_configuration());
        send.assert_calls(0);
    }
}
