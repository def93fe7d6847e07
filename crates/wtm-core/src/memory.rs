//! In-memory scheduled-message repository.
//!
//! Backs the test suite and single-process deployments without a database.
//! Sorting and filtering mirror the SQL queries of the durable store.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    model::{MessageStatus, ScheduledMessage, LEASE_TIMEOUT_SECONDS},
    normalize::normalize_sender_id,
    repository::ScheduledMessageRepository,
    Error, Result,
};

#[derive(Default)]
pub struct InMemoryScheduledMessageRepository {
    messages: Mutex<HashMap<Uuid, ScheduledMessage>>,
}

impl InMemoryScheduledMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_messages<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, ScheduledMessage>) -> T) -> T {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut messages)
    }

    fn sender_of(msg: &ScheduledMessage) -> String {
        normalize_sender_id(msg.from_chat_id.as_deref().unwrap_or(""))
    }

    fn update(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut ScheduledMessage),
    ) -> Result<()> {
        self.with_messages(|messages| match messages.get_mut(&id) {
            Some(msg) => {
                apply(msg);
                Ok(())
            }
            None => Err(Error::Storage(format!("unknown scheduled message {id}"))),
        })
    }
}

fn by_send_at(messages: &HashMap<Uuid, ScheduledMessage>) -> Vec<ScheduledMessage> {
    let mut all: Vec<ScheduledMessage> = messages.values().cloned().collect();
    all.sort_by_key(|m| m.send_at);
    all
}

fn by_created_at_desc(messages: &HashMap<Uuid, ScheduledMessage>) -> Vec<ScheduledMessage> {
    let mut all: Vec<ScheduledMessage> = messages.values().cloned().collect();
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    all
}

fn lease_expired(msg: &ScheduledMessage, now: DateTime<Utc>) -> bool {
    match msg.locked_at {
        None => true,
        Some(locked_at) => locked_at < now - Duration::seconds(LEASE_TIMEOUT_SECONDS),
    }
}

#[async_trait]
impl ScheduledMessageRepository for InMemoryScheduledMessageRepository {
    async fn create(&self, msg: &ScheduledMessage) -> Result<()> {
        self.with_messages(|messages| {
            if messages
                .values()
                .any(|m| m.idempotency_key == msg.idempotency_key)
            {
                return Err(Error::Storage(format!(
                    "duplicate idempotency key: {}",
                    msg.idempotency_key
                )));
            }
            messages.insert(msg.id, msg.clone());
            Ok(())
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        Ok(self.with_messages(|messages| messages.get(&id).cloned()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<ScheduledMessage>> {
        Ok(self.with_messages(|messages| {
            messages
                .values()
                .find(|m| m.idempotency_key == key)
                .cloned()
        }))
    }

    async fn find_by_id_prefix(
        &self,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let prefix = prefix.to_lowercase();
        Ok(self.with_messages(|messages| {
            by_created_at_desc(messages)
                .into_iter()
                .filter(|m| m.id.simple().to_string().starts_with(&prefix))
                .take(limit as usize)
                .collect()
        }))
    }

    async fn find_by_id_prefix_for_sender(
        &self,
        prefix: &str,
        normalized_sender: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let prefix = prefix.to_lowercase();
        Ok(self.with_messages(|messages| {
            by_created_at_desc(messages)
                .into_iter()
                .filter(|m| {
                    m.id.simple().to_string().starts_with(&prefix)
                        && Self::sender_of(m) == normalized_sender
                })
                .take(limit as usize)
                .collect()
        }))
    }

    async fn list_scheduled_for_sender(
        &self,
        normalized_sender: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        Ok(self.with_messages(|messages| {
            by_send_at(messages)
                .into_iter()
                .filter(|m| {
                    m.status == MessageStatus::Scheduled
                        && Self::sender_of(m) == normalized_sender
                })
                .take(limit as usize)
                .collect()
        }))
    }

    async fn list_upcoming(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        Ok(self.with_messages(|messages| {
            by_send_at(messages)
                .into_iter()
                .filter(|m| {
                    m.send_at <= now
                        && match m.status {
                            MessageStatus::Scheduled => true,
                            MessageStatus::Locked => lease_expired(m, now),
                            _ => false,
                        }
                })
                .take(limit as usize)
                .collect()
        }))
    }

    async fn lock_for_sending(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.with_messages(|messages| {
            let Some(msg) = messages.get_mut(&id) else {
                return false;
            };
            let claimable = match msg.status {
                MessageStatus::Scheduled => true,
                MessageStatus::Locked => lease_expired(msg, now),
                _ => false,
            };
            if !claimable {
                return false;
            }
            msg.status = MessageStatus::Locked;
            msg.locked_at = Some(now);
            msg.updated_at = now;
            true
        }))
    }

    async fn mark_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> Result<()> {
        self.update(id, |msg| {
            msg.status = MessageStatus::Sent;
            msg.sent_at = Some(sent_at);
            msg.updated_at = sent_at;
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.update(id, |msg| {
            msg.status = MessageStatus::Failed;
            msg.last_error = Some(error.to_string());
            msg.attempt_count += 1;
            msg.updated_at = Utc::now();
        })
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        self.update(id, |msg| {
            if msg.status != MessageStatus::Sent {
                msg.status = MessageStatus::Cancelled;
                msg.updated_at = Utc::now();
            }
        })
    }

    async fn set_confirmation_message_id(
        &self,
        id: Uuid,
        confirmation_message_id: &str,
    ) -> Result<()> {
        self.update(id, |msg| {
            msg.confirmation_message_id = Some(confirmation_message_id.to_string());
            msg.updated_at = Utc::now();
        })
    }

    async fn find_scheduled_by_confirmation_message_id_for_sender(
        &self,
        confirmation_message_id: &str,
        normalized_sender: &str,
    ) -> Result<Option<ScheduledMessage>> {
        Ok(self.with_messages(|messages| {
            by_created_at_desc(messages)
                .into_iter()
                .find(|m| {
                    matches!(m.status, MessageStatus::Scheduled | MessageStatus::Locked)
                        && m.confirmation_message_id.as_deref()
                            == Some(confirmation_message_id)
                        && Self::sender_of(m) == normalized_sender
                })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn msg(send_at: DateTime<Utc>, key: &str, from: &str) -> ScheduledMessage {
        let now = fixed_now();
        ScheduledMessage {
            id: Uuid::new_v4(),
            chat_id: "19998887777@s.whatsapp.net".to_string(),
            from_chat_id: Some(from.to_string()),
            text: "hello".to_string(),
            send_at,
            status: MessageStatus::Scheduled,
            locked_at: None,
            sent_at: None,
            attempt_count: 0,
            last_error: None,
            idempotency_key: key.to_string(),
            confirmation_message_id: None,
            source: "test".to_string(),
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_idempotency_key() {
        let repo = InMemoryScheduledMessageRepository::new();
        let a = msg(fixed_now(), "dup", "15551234567");
        let mut b = msg(fixed_now(), "dup", "15551234567");
        b.id = Uuid::new_v4();

        repo.create(&a).await.unwrap();
        assert!(repo.create(&b).await.is_err());
        assert!(repo
            .find_by_idempotency_key("dup")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn lock_succeeds_exactly_once() {
        let repo = InMemoryScheduledMessageRepository::new();
        let m = msg(fixed_now(), "lock", "15551234567");
        repo.create(&m).await.unwrap();

        assert!(repo.lock_for_sending(m.id, fixed_now()).await.unwrap());
        assert!(!repo.lock_for_sending(m.id, fixed_now()).await.unwrap());

        let locked = repo.get(m.id).await.unwrap().unwrap();
        assert_eq!(locked.status, MessageStatus::Locked);
        assert_eq!(locked.locked_at, Some(fixed_now()));
    }

    #[tokio::test]
    async fn concurrent_lock_claims_exactly_once() {
        let repo = std::sync::Arc::new(InMemoryScheduledMessageRepository::new());
        let m = msg(fixed_now(), "race", "15551234567");
        repo.create(&m).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.lock_for_sending(m.id, fixed_now()).await.unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_and_listed() {
        let repo = InMemoryScheduledMessageRepository::new();
        let m = msg(fixed_now(), "lease", "15551234567");
        repo.create(&m).await.unwrap();
        assert!(repo.lock_for_sending(m.id, fixed_now()).await.unwrap());

        // Inside the lease window the row is invisible and unclaimable.
        let within = fixed_now() + Duration::seconds(299);
        assert!(repo.list_upcoming(within, 10).await.unwrap().is_empty());
        assert!(!repo.lock_for_sending(m.id, within).await.unwrap());

        // 301 seconds after locking, it is due again.
        let after = fixed_now() + Duration::seconds(301);
        let due = repo.list_upcoming(after, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(repo.lock_for_sending(m.id, after).await.unwrap());
    }

    #[tokio::test]
    async fn list_upcoming_orders_by_send_at_and_skips_terminal() {
        let repo = InMemoryScheduledMessageRepository::new();
        let early = msg(fixed_now() - Duration::hours(2), "a", "15551234567");
        let late = msg(fixed_now() - Duration::hours(1), "b", "15551234567");
        let future = msg(fixed_now() + Duration::hours(1), "c", "15551234567");
        let done = msg(fixed_now() - Duration::hours(3), "d", "15551234567");
        for m in [&early, &late, &future, &done] {
            repo.create(m).await.unwrap();
        }
        repo.mark_sent(done.id, fixed_now()).await.unwrap();

        let due = repo.list_upcoming(fixed_now(), 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn cancel_is_noop_on_sent() {
        let repo = InMemoryScheduledMessageRepository::new();
        let m = msg(fixed_now(), "sent", "15551234567");
        repo.create(&m).await.unwrap();
        repo.mark_sent(m.id, fixed_now()).await.unwrap();

        repo.cancel(m.id).await.unwrap();
        assert_eq!(
            repo.get(m.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn mark_failed_increments_attempts() {
        let repo = InMemoryScheduledMessageRepository::new();
        let m = msg(fixed_now(), "fail", "15551234567");
        repo.create(&m).await.unwrap();

        repo.mark_failed(m.id, "boom").await.unwrap();
        repo.mark_failed(m.id, "boom again").await.unwrap();
        let failed = repo.get(m.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.attempt_count, 2);
        assert_eq!(failed.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn sender_filters_use_digit_normalization() {
        let repo = InMemoryScheduledMessageRepository::new();
        let mine = msg(fixed_now() + Duration::hours(1), "m1", "15551234567@s.whatsapp.net");
        let other = msg(fixed_now() + Duration::hours(2), "m2", "15550000000@s.whatsapp.net");
        repo.create(&mine).await.unwrap();
        repo.create(&other).await.unwrap();

        let listed = repo
            .list_scheduled_for_sender("15551234567", 5)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, mine.id);

        let prefix = mine.short_id();
        let found = repo
            .find_by_id_prefix_for_sender(&prefix, "15551234567", 2)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let missed = repo
            .find_by_id_prefix_for_sender(&prefix, "15550000000", 2)
            .await
            .unwrap();
        assert!(missed.is_empty());
    }

    #[tokio::test]
    async fn confirmation_lookup_skips_terminal_rows() {
        let repo = InMemoryScheduledMessageRepository::new();
        let m = msg(fixed_now() + Duration::hours(1), "confirm", "15551234567");
        repo.create(&m).await.unwrap();
        repo.set_confirmation_message_id(m.id, "confirm-1")
            .await
            .unwrap();

        let found = repo
            .find_scheduled_by_confirmation_message_id_for_sender("confirm-1", "15551234567")
            .await
            .unwrap();
        assert_eq!(found.map(|m| m.id), Some(m.id));

        repo.cancel(m.id).await.unwrap();
        let gone = repo
            .find_scheduled_by_confirmation_message_id_for_sender("confirm-1", "15551234567")
            .await
            .unwrap();
        assert!(gone.is_none());
    }
}
