//! Postgres-backed scheduled-message repository (sqlx).
//!
//! Row-level atomic updates carry the whole concurrency story: the lock
//! query flips SCHEDULED (or lease-expired LOCKED) rows to LOCKED in a
//! single UPDATE, and the affected-row count tells the caller whether it
//! won the claim.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    FromRow,
};
use uuid::Uuid;

use wtm_core::{
    model::{MessageStatus, ScheduledMessage, LEASE_TIMEOUT_SECONDS},
    repository::ScheduledMessageRepository,
    Error, Result,
};

mod queries;

pub struct PgScheduledMessageRepository {
    pool: PgPool,
}

impl PgScheduledMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> Error {
    Error::Storage(err.to_string())
}

fn stale_lease_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(LEASE_TIMEOUT_SECONDS)
}

/// Flat row image; `status` is decoded separately so an unknown value
/// surfaces as a storage error instead of a panic.
#[derive(FromRow)]
struct ScheduledMessageRow {
    id: Uuid,
    chat_id: String,
    from_chat_id: Option<String>,
    confirmation_message_id: Option<String>,
    text: String,
    send_at: DateTime<Utc>,
    status: String,
    locked_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
    idempotency_key: String,
    source: String,
    reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduledMessageRow> for ScheduledMessage {
    type Error = Error;

    fn try_from(row: ScheduledMessageRow) -> Result<Self> {
        Ok(ScheduledMessage {
            id: row.id,
            chat_id: row.chat_id,
            from_chat_id: row.from_chat_id,
            text: row.text,
            send_at: row.send_at,
            status: row.status.parse::<MessageStatus>()?,
            locked_at: row.locked_at,
            sent_at: row.sent_at,
            attempt_count: row.attempt_count,
            last_error: row.last_error,
            idempotency_key: row.idempotency_key,
            confirmation_message_id: row.confirmation_message_id,
            source: row.source,
            reason: row.reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn rows_to_messages(rows: Vec<ScheduledMessageRow>) -> Result<Vec<ScheduledMessage>> {
    rows.into_iter().map(ScheduledMessage::try_from).collect()
}

#[async_trait]
impl ScheduledMessageRepository for PgScheduledMessageRepository {
    async fn create(&self, msg: &ScheduledMessage) -> Result<()> {
        sqlx::query(queries::INSERT_MESSAGE)
            .bind(msg.id)
            .bind(&msg.chat_id)
            .bind(&msg.from_chat_id)
            .bind(&msg.confirmation_message_id)
            .bind(&msg.text)
            .bind(msg.send_at)
            .bind(msg.status.as_str())
            .bind(msg.locked_at)
            .bind(msg.sent_at)
            .bind(msg.attempt_count)
            .bind(&msg.last_error)
            .bind(&msg.idempotency_key)
            .bind(&msg.source)
            .bind(&msg.reason)
            .bind(msg.created_at)
            .bind(msg.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        let row = sqlx::query_as::<_, ScheduledMessageRow>(queries::GET_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(ScheduledMessage::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<ScheduledMessage>> {
        let row = sqlx::query_as::<_, ScheduledMessageRow>(queries::GET_BY_IDEMPOTENCY_KEY)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(ScheduledMessage::try_from).transpose()
    }

    async fn find_by_id_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, ScheduledMessageRow>(queries::FIND_BY_ID_PREFIX)
            .bind(prefix.to_lowercase())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_messages(rows)
    }

    async fn find_by_id_prefix_for_sender(
        &self,
        prefix: &str,
        normalized_sender: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let rows =
            sqlx::query_as::<_, ScheduledMessageRow>(queries::FIND_BY_ID_PREFIX_FOR_SENDER)
                .bind(prefix.to_lowercase())
                .bind(normalized_sender)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows_to_messages(rows)
    }

    async fn list_scheduled_for_sender(
        &self,
        normalized_sender: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, ScheduledMessageRow>(queries::LIST_SCHEDULED_FOR_SENDER)
            .bind(normalized_sender)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_messages(rows)
    }

    async fn list_upcoming(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, ScheduledMessageRow>(queries::LIST_UPCOMING)
            .bind(now)
            .bind(stale_lease_cutoff(now))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows_to_messages(rows)
    }

    async fn lock_for_sending(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(queries::LOCK_FOR_SENDING)
            .bind(now)
            .bind(id)
            .bind(stale_lease_cutoff(now))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(queries::MARK_SENT)
            .bind(sent_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(queries::MARK_FAILED)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        sqlx::query(queries::CANCEL)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_confirmation_message_id(
        &self,
        id: Uuid,
        confirmation_message_id: &str,
    ) -> Result<()> {
        sqlx::query(queries::SET_CONFIRMATION_MESSAGE_ID)
            .bind(confirmation_message_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_scheduled_by_confirmation_message_id_for_sender(
        &self,
        confirmation_message_id: &str,
        normalized_sender: &str,
    ) -> Result<Option<ScheduledMessage>> {
        let row =
            sqlx::query_as::<_, ScheduledMessageRow>(queries::FIND_BY_CONFIRMATION_FOR_SENDER)
                .bind(confirmation_message_id)
                .bind(normalized_sender)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(ScheduledMessage::try_from).transpose()
    }
}
