//! Shared fakes for the crate's test modules.

use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{auth::AuthCodeGenerator, transport::WhatsAppTransport, Error, Result};

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub chat_id: String,
    pub text: String,
    pub quoted_message_id: Option<String>,
    pub message_id: Option<Uuid>,
}

/// Records every outbound message; replies with a fixed gateway id.
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    reply_message_id: Option<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_reply_id(Some("confirmation-id".to_string()))
    }

    pub fn with_reply_id(reply_message_id: Option<String>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            reply_message_id,
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<SentMessage> {
        self.sent().last().cloned()
    }
}

#[async_trait]
impl WhatsAppTransport for RecordingTransport {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        quoted_message_id: Option<&str>,
        message_id: Option<Uuid>,
    ) -> Result<Option<String>> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                chat_id: chat_id.to_string(),
                text: text.to_string(),
                quoted_message_id: quoted_message_id.map(str::to_string),
                message_id,
            });
        Ok(self.reply_message_id.clone())
    }
}

/// Every send fails, as if the gateway were unreachable.
pub struct FailingTransport;

#[async_trait]
impl WhatsAppTransport for FailingTransport {
    async fn send_message(
        &self,
        _chat_id: &str,
        _text: &str,
        _quoted_message_id: Option<&str>,
        _message_id: Option<Uuid>,
    ) -> Result<Option<String>> {
        Err(Error::Gateway("gateway unreachable".to_string()))
    }
}

/// Always yields the same auth code.
pub struct FixedCodeGenerator(pub &'static str);

impl AuthCodeGenerator for FixedCodeGenerator {
    fn generate(&self) -> String {
        self.0.to_string()
    }
}
