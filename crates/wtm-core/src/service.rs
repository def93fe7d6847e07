//! Scheduling service: validation, idempotency and lifecycle operations
//! over the repository, plus the worker-facing dispatch step.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    clock::Clock,
    delivery::format_assistant_delivery,
    model::{MessageStatus, ScheduledMessage},
    normalize::normalize_sender_id,
    repository::ScheduledMessageRepository,
    transport::WhatsAppTransport,
    Error, Result,
};

/// How many rows an id-prefix lookup fetches; two is enough to detect
/// ambiguity.
const PREFIX_PROBE_LIMIT: i64 = 2;

/// Assistant-mode policy: per-sender authorization plus a bounded
/// scheduling horizon.
#[derive(Clone, Copy, Debug)]
pub struct AssistantPolicy {
    pub enabled: bool,
    pub max_schedule_hours: i64,
}

impl AssistantPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_schedule_hours: 24,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScheduleRequest {
    pub chat_id: String,
    pub from_chat_id: Option<String>,
    pub text: String,
    pub send_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub source: String,
    pub reason: Option<String>,
}

pub struct TimedMessageService {
    repo: Arc<dyn ScheduledMessageRepository>,
    clock: Arc<dyn Clock>,
    policy: AssistantPolicy,
}

impl TimedMessageService {
    pub fn new(
        repo: Arc<dyn ScheduledMessageRepository>,
        clock: Arc<dyn Clock>,
        policy: AssistantPolicy,
    ) -> Self {
        Self {
            repo,
            clock,
            policy,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn assistant_mode(&self) -> bool {
        self.policy.enabled
    }

    /// Create a scheduled message, or return the existing one when the
    /// idempotency key was already used.
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<ScheduledMessage> {
        let now = self.now();

        if request.send_at <= now {
            return Err(Error::InvalidArgument(
                "send_at must be in the future".to_string(),
            ));
        }
        if self.policy.enabled && request.from_chat_id.is_none() {
            return Err(Error::InvalidArgument(
                "from_chat_id is required in assistant mode".to_string(),
            ));
        }

        if let Some(existing) = self
            .repo
            .find_by_idempotency_key(&request.idempotency_key)
            .await?
        {
            return Ok(existing);
        }

        let msg = ScheduledMessage {
            id: Uuid::new_v4(),
            chat_id: request.chat_id,
            from_chat_id: request.from_chat_id,
            text: request.text,
            send_at: request.send_at,
            status: MessageStatus::Scheduled,
            locked_at: None,
            sent_at: None,
            attempt_count: 0,
            last_error: None,
            idempotency_key: request.idempotency_key,
            confirmation_message_id: None,
            source: request.source,
            reason: request.reason,
            created_at: now,
            updated_at: now,
        };
        self.repo.create(&msg).await?;
        Ok(msg)
    }

    /// In assistant mode the horizon is bounded; outside it, anything goes.
    pub fn validate_assistant_schedule_window(&self, send_at: DateTime<Utc>) -> Result<()> {
        if !self.policy.enabled {
            return Ok(());
        }
        let hours = self.policy.max_schedule_hours;
        if send_at - self.now() > Duration::hours(hours) {
            return Err(Error::InvalidArgument(format!(
                "Free version limit: schedule up to {hours} hours ahead"
            )));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        self.repo.get(id).await
    }

    /// Idempotent except for the SENT guard.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let Some(msg) = self.repo.get(id).await? else {
            return Ok(());
        };
        match msg.status {
            MessageStatus::Sent => Err(Error::InvalidArgument(
                "Cannot cancel a sent message".to_string(),
            )),
            MessageStatus::Cancelled => Ok(()),
            _ => self.repo.cancel(id).await,
        }
    }

    pub async fn find_by_id_prefix(&self, prefix: &str) -> Result<Option<ScheduledMessage>> {
        let matches = self.repo.find_by_id_prefix(prefix, PREFIX_PROBE_LIMIT).await?;
        Self::single_match(matches)
    }

    pub async fn find_by_id_prefix_for_sender(
        &self,
        prefix: &str,
        sender_id: &str,
    ) -> Result<Option<ScheduledMessage>> {
        let normalized = normalize_sender_id(sender_id);
        let matches = self
            .repo
            .find_by_id_prefix_for_sender(prefix, &normalized, PREFIX_PROBE_LIMIT)
            .await?;
        Self::single_match(matches)
    }

    fn single_match(mut matches: Vec<ScheduledMessage>) -> Result<Option<ScheduledMessage>> {
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.remove(0))),
            _ => Err(Error::InvalidArgument(
                "cancel id is ambiguous; please paste the full ID".to_string(),
            )),
        }
    }

    pub async fn list_scheduled_for_sender(
        &self,
        sender_id: &str,
        limit: i64,
    ) -> Result<Vec<ScheduledMessage>> {
        let normalized = normalize_sender_id(sender_id);
        self.repo.list_scheduled_for_sender(&normalized, limit).await
    }

    pub async fn list_due(&self, limit: i64) -> Result<Vec<ScheduledMessage>> {
        self.repo.list_upcoming(self.now(), limit).await
    }

    pub async fn set_confirmation_message_id(
        &self,
        id: Uuid,
        confirmation_message_id: &str,
    ) -> Result<()> {
        self.repo
            .set_confirmation_message_id(id, confirmation_message_id)
            .await
    }

    pub async fn find_scheduled_by_confirmation_message_id_for_sender(
        &self,
        confirmation_message_id: &str,
        sender_id: &str,
    ) -> Result<Option<ScheduledMessage>> {
        let normalized = normalize_sender_id(sender_id);
        self.repo
            .find_scheduled_by_confirmation_message_id_for_sender(
                confirmation_message_id,
                &normalized,
            )
            .await
    }

    /// Claim a due message and drive it to SENT or FAILED.
    ///
    /// Silent when the record is gone, terminal, not yet due, or claimed by
    /// another worker. A transport failure is recorded on the record and
    /// re-raised so the caller can log it.
    pub async fn dispatch(
        &self,
        id: Uuid,
        transport: &dyn WhatsAppTransport,
        quoted_message_id: Option<&str>,
    ) -> Result<()> {
        let now = self.now();
        let Some(msg) = self.repo.get(id).await? else {
            return Ok(());
        };
        if matches!(
            msg.status,
            MessageStatus::Cancelled | MessageStatus::Sent | MessageStatus::Failed
        ) {
            return Ok(());
        }
        if msg.send_at > now {
            return Ok(());
        }

        if !self.repo.lock_for_sending(id, now).await? {
            return Ok(());
        }

        let (to_chat_id, text) = match (self.policy.enabled, &msg.from_chat_id) {
            (true, Some(from_chat_id)) => {
                (from_chat_id.clone(), format_assistant_delivery(&msg))
            }
            _ => (msg.chat_id.clone(), msg.text.clone()),
        };

        match transport
            .send_message(&to_chat_id, &text, quoted_message_id, Some(msg.id))
            .await
        {
            Ok(_) => self.repo.mark_sent(id, now).await,
            Err(err) => {
                self.repo.mark_failed(id, &err.to_string()).await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::{
        clock::FixedClock,
        memory::InMemoryScheduledMessageRepository,
        testing::{FailingTransport, RecordingTransport},
    };

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn service(policy: AssistantPolicy) -> (Arc<TimedMessageService>, Arc<FixedClock>) {
        let repo = Arc::new(InMemoryScheduledMessageRepository::new());
        let clock = Arc::new(FixedClock::new(fixed_now()));
        let service = Arc::new(TimedMessageService::new(repo, clock.clone(), policy));
        (service, clock)
    }

    fn request(key: &str, send_at: DateTime<Utc>) -> ScheduleRequest {
        ScheduleRequest {
            chat_id: "15551234567@s.whatsapp.net".to_string(),
            from_chat_id: Some("19998887777@s.whatsapp.net".to_string()),
            text: "ping".to_string(),
            send_at,
            idempotency_key: key.to_string(),
            source: "test".to_string(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn schedule_rejects_past_and_present_instants() {
        let (service, _) = service(AssistantPolicy::disabled());

        let err = service.schedule(request("k1", fixed_now())).await.unwrap_err();
        assert!(err.to_string().contains("future"));

        let err = service
            .schedule(request("k2", fixed_now() - Duration::minutes(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("future"));
    }

    #[tokio::test]
    async fn schedule_requires_originator_in_assistant_mode() {
        let (service, _) = service(AssistantPolicy {
            enabled: true,
            max_schedule_hours: 24,
        });

        let mut req = request("k1", fixed_now() + Duration::hours(1));
        req.from_chat_id = None;
        let err = service.schedule(req).await.unwrap_err();
        assert!(err.to_string().contains("from_chat_id"));
    }

    #[tokio::test]
    async fn schedule_is_idempotent_per_key() {
        let (service, _) = service(AssistantPolicy::disabled());
        let send_at = fixed_now() + Duration::hours(1);

        let first = service.schedule(request("dup", send_at)).await.unwrap();
        let second = service.schedule(request("dup", send_at)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, MessageStatus::Scheduled);
        assert!(first.send_at > fixed_now());
    }

    #[tokio::test]
    async fn assistant_window_bounds_horizon() {
        let (bounded_service, _) = service(AssistantPolicy {
            enabled: true,
            max_schedule_hours: 2,
        });

        bounded_service
            .validate_assistant_schedule_window(fixed_now() + Duration::hours(1))
            .unwrap();
        let err = bounded_service
            .validate_assistant_schedule_window(fixed_now() + Duration::hours(3))
            .unwrap_err();
        assert!(err.to_string().contains("Free version limit"));
        assert!(err.to_string().contains('2'));

        let (service, _) = service(AssistantPolicy::disabled());
        service
            .validate_assistant_schedule_window(fixed_now() + Duration::days(365))
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_follows_status() {
        let (service, _) = service(AssistantPolicy::disabled());
        let msg = service
            .schedule(request("c1", fixed_now() + Duration::hours(1)))
            .await
            .unwrap();

        service.cancel(msg.id).await.unwrap();
        assert_eq!(
            service.get(msg.id).await.unwrap().unwrap().status,
            MessageStatus::Cancelled
        );
        // Repeat is a no-op.
        service.cancel(msg.id).await.unwrap();
        // Unknown id is a no-op.
        service.cancel(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_refuses_sent_messages() {
        let (service, clock) = service(AssistantPolicy::disabled());
        let transport = RecordingTransport::new();
        let msg = service
            .schedule(request("c2", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();

        clock.advance(Duration::minutes(2));
        service.dispatch(msg.id, &transport, None).await.unwrap();

        let err = service.cancel(msg.id).await.unwrap_err();
        assert!(err.to_string().contains("Cannot cancel"));
    }

    #[tokio::test]
    async fn dispatch_waits_until_due_then_sends() {
        let (service, clock) = service(AssistantPolicy::disabled());
        let transport = RecordingTransport::new();
        let msg = service
            .schedule(request("d1", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();

        service.dispatch(msg.id, &transport, None).await.unwrap();
        assert!(transport.sent().is_empty());

        clock.advance(Duration::minutes(2));
        service.dispatch(msg.id, &transport, None).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "15551234567@s.whatsapp.net");
        assert_eq!(sent[0].text, "ping");
        let stored = service.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.sent_at.is_some());

        // Terminal: a second dispatch is silent.
        service.dispatch(msg.id, &transport, None).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_in_assistant_mode_notifies_originator() {
        let (service, clock) = service(AssistantPolicy {
            enabled: true,
            max_schedule_hours: 24,
        });
        let transport = RecordingTransport::new();
        let msg = service
            .schedule(request("d2", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();

        clock.advance(Duration::minutes(2));
        service.dispatch(msg.id, &transport, None).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].chat_id, "19998887777@s.whatsapp.net");
        assert!(sent[0].text.contains("Scheduled message ready"));
        assert!(sent[0].text.contains("https://wa.me/15551234567"));
    }

    #[tokio::test]
    async fn dispatch_records_transport_failure() {
        let (service, clock) = service(AssistantPolicy::disabled());
        let transport = FailingTransport;
        let msg = service
            .schedule(request("d3", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();

        clock.advance(Duration::minutes(2));
        let err = service.dispatch(msg.id, &transport, None).await.unwrap_err();
        assert!(err.to_string().contains("gateway"));

        let stored = service.get(msg.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_error.is_some());
    }

    #[tokio::test]
    async fn stale_lease_is_taken_over() {
        let repo = Arc::new(InMemoryScheduledMessageRepository::new());
        let clock = Arc::new(FixedClock::new(fixed_now()));
        let service = Arc::new(TimedMessageService::new(
            repo.clone(),
            clock.clone(),
            AssistantPolicy::disabled(),
        ));
        let transport = RecordingTransport::new();

        let msg = service
            .schedule(request("takeover", fixed_now() + Duration::minutes(1)))
            .await
            .unwrap();

        // A worker claims the row and dies before sending.
        clock.advance(Duration::minutes(2));
        assert!(repo.lock_for_sending(msg.id, clock.now()).await.unwrap());

        // Within the lease nothing happens.
        service.dispatch(msg.id, &transport, None).await.unwrap();
        assert!(transport.sent().is_empty());

        // 301 seconds later another worker finds and completes it.
        clock.advance(Duration::seconds(301));
        let due = service.list_due(10).await.unwrap();
        assert_eq!(due.len(), 1);
        service.dispatch(msg.id, &transport, None).await.unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(
            service.get(msg.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );
    }

    #[tokio::test]
    async fn prefix_lookup_disambiguates() {
        let (service, _) = service(AssistantPolicy::disabled());
        let msg = service
            .schedule(request("p1", fixed_now() + Duration::hours(1)))
            .await
            .unwrap();

        let found = service
            .find_by_id_prefix_for_sender(&msg.short_id(), "19998887777")
            .await
            .unwrap();
        assert_eq!(found.map(|m| m.id), Some(msg.id));

        // Wrong sender sees nothing.
        let missed = service
            .find_by_id_prefix_for_sender(&msg.short_id(), "15550000000")
            .await
            .unwrap();
        assert!(missed.is_none());

        // The unscoped lookup ignores ownership.
        let found = service.find_by_id_prefix(&msg.short_id()).await.unwrap();
        assert_eq!(found.map(|m| m.id), Some(msg.id));
        assert!(service.find_by_id_prefix("ffffffffffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_due_uses_injected_clock() {
        let (service, clock) = service(AssistantPolicy::disabled());
        service
            .schedule(request("l1", fixed_now() + Duration::minutes(5)))
            .await
            .unwrap();

        assert!(service.list_due(10).await.unwrap().is_empty());
        clock.advance(Duration::minutes(6));
        assert_eq!(service.list_due(10).await.unwrap().len(), 1);
    }
}
