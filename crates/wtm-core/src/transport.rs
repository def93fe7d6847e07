use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;

/// Outbound port to the WhatsApp gateway.
///
/// The HTTP implementation lives in the gateway adapter crate; tests use a
/// recording fake.
#[async_trait]
pub trait WhatsAppTransport: Send + Sync {
    /// Deliver `text` to `chat_id`. Returns the gateway-assigned message id
    /// when the gateway reports one (used to link confirmation replies to
    /// scheduled records).
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        quoted_message_id: Option<&str>,
        message_id: Option<Uuid>,
    ) -> Result<Option<String>>;
}
