use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{model::ScheduledMessage, Result};

/// Contract over the durable scheduled-message store.
///
/// The scheduling service depends only on this trait; the in-memory
/// implementation backs tests, the Postgres one backs production. The only
/// operation that must be atomic is [`lock_for_sending`], the sole
/// synchronization point between concurrent workers.
///
/// [`lock_for_sending`]: ScheduledMessageRepository::lock_for_sending
#[async_trait]
pub trait ScheduledMessageRepository: Send + Sync {
    /// Insert. Fails if the idempotency key collides.
    async fn create(&self, msg: &ScheduledMessage) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledMessage>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<ScheduledMessage>>;

    /// Hex-prefix search over the id, newest first.
    async fn find_by_id_prefix(&self, prefix: &str, limit: i64)
        -> Result<Vec<ScheduledMessage>>;

    async fn find_by_id_prefix_for_sender(
        &self,
        prefix: &str,
        normalized_sender: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>>;

    /// SCHEDULED rows for this sender, soonest first.
    async fn list_scheduled_for_sender(
        &self,
        normalized_sender: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>>;

    /// Due rows: SCHEDULED past `now`, plus LOCKED past `now` whose lease
    /// expired. Soonest first.
    async fn list_upcoming(&self, now: DateTime<Utc>, limit: i64)
        -> Result<Vec<ScheduledMessage>>;

    /// Single atomic claim. True iff exactly one row moved to LOCKED,
    /// i.e. it was SCHEDULED, or LOCKED with an expired lease.
    async fn lock_for_sending(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()>;

    /// Records the error and increments the attempt count.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// No-op when the row is already SENT.
    async fn cancel(&self, id: Uuid) -> Result<()>;

    async fn set_confirmation_message_id(
        &self,
        id: Uuid,
        confirmation_message_id: &str,
    ) -> Result<()>;

    /// Restricted to non-terminal (SCHEDULED/LOCKED) rows.
    async fn find_scheduled_by_confirmation_message_id_for_sender(
        &self,
        confirmation_message_id: &str,
        normalized_sender: &str,
    ) -> Result<Option<ScheduledMessage>>;
}
