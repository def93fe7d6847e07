//! WhatsApp gateway adapter.
//!
//! Implements the core transport port over the gateway's HTTP surface and
//! hosts the inbound webhook router.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wtm_core::{transport::WhatsAppTransport, Error, Result};

pub mod routes;

/// Outbound client for the gateway's `POST /send`.
pub struct HttpWhatsAppTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWhatsAppTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Gateway(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quoted_message_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message_id: Option<String>,
}

#[async_trait]
impl WhatsAppTransport for HttpWhatsAppTransport {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        quoted_message_id: Option<&str>,
        message_id: Option<Uuid>,
    ) -> Result<Option<String>> {
        let payload = SendRequest {
            to: chat_id,
            text,
            quoted_message_id,
            message_id: message_id.map(|id| id.to_string()),
        };

        let resp = self
            .client
            .post(format!("{}/send", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Gateway(format!("failed to reach WhatsApp gateway: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Gateway(format!("gateway error {status}: {body}")));
        }

        let body: SendResponse = resp
            .json()
            .await
            .map_err(|e| Error::Gateway(format!("invalid gateway response: {e}")))?;
        if body.status != "ok" {
            return Err(Error::Gateway(format!(
                "gateway failed: status={}",
                body.status
            )));
        }

        Ok(body.message_id.filter(|id| !id.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_omits_optional_fields() {
        let payload = SendRequest {
            to: "15551234567@s.whatsapp.net",
            text: "hello",
            quoted_message_id: None,
            message_id: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"to": "15551234567@s.whatsapp.net", "text": "hello"})
        );
    }

    #[test]
    fn send_response_tolerates_missing_fields() {
        let resp: SendResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(resp.status, "");
        assert!(resp.message_id.is_none());

        let resp: SendResponse =
            serde_json::from_str(r#"{"status": "ok", "message_id": "abc"}"#).unwrap();
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.message_id.as_deref(), Some("abc"));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let transport =
            HttpWhatsAppTransport::new("http://gateway:3000/", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.base_url, "http://gateway:3000");
    }
}
