//! Delivery worker: polls for due messages and drives each through
//! dispatch.
//!
//! Safe to run in multiple processes at once: the repository's atomic
//! `lock_for_sending` arbitrates, no external lock manager involved.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{service::TimedMessageService, transport::WhatsAppTransport, Result};

pub struct TimedMessageWorker {
    service: Arc<TimedMessageService>,
    transport: Arc<dyn WhatsAppTransport>,
    poll_interval: Duration,
    batch_size: i64,
}

impl TimedMessageWorker {
    pub fn new(
        service: Arc<TimedMessageService>,
        transport: Arc<dyn WhatsAppTransport>,
        poll_interval: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            service,
            transport,
            poll_interval,
            batch_size,
        }
    }

    /// Poll until `cancel` fires. Loop-level failures are logged and
    /// followed by one poll interval of backoff; they never kill the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("timed message worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = self.run_once(&cancel).await {
                error!("worker loop error: {err}");
                self.sleep(&cancel).await;
            }
        }
        info!("timed message worker stopped");
    }

    /// One poll iteration: fetch a batch of due messages and dispatch each.
    /// Sleeps one interval when the batch is empty.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let due = self.service.list_due(self.batch_size).await?;
        if due.is_empty() {
            debug!("no due messages");
            self.sleep(cancel).await;
            return Ok(());
        }

        info!("found {} due message(s)", due.len());
        for msg in due {
            if cancel.is_cancelled() {
                break;
            }
            info!("sending message {} to {}", msg.id, msg.chat_id);
            match self
                .service
                .dispatch(msg.id, self.transport.as_ref(), None)
                .await
            {
                Ok(()) => debug!("dispatched message {}", msg.id),
                // Already recorded as FAILED by the service.
                Err(err) => error!("failed sending message {}: {err}", msg.id),
            }
        }
        Ok(())
    }

    async fn sleep(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use uuid::Uuid;

    use crate::{
        clock::FixedClock,
        memory::InMemoryScheduledMessageRepository,
        model::{MessageStatus, ScheduledMessage},
        repository::ScheduledMessageRepository,
        service::AssistantPolicy,
        testing::{FailingTransport, RecordingTransport},
    };

    fn due_message(key: &str) -> ScheduledMessage {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        ScheduledMessage {
            id: Uuid::new_v4(),
            chat_id: "15551234567@s.whatsapp.net".to_string(),
            from_chat_id: Some("19998887777".to_string()),
            text: "ping".to_string(),
            send_at: now - ChronoDuration::minutes(1),
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

    fn worker_with(
        transport: Arc<dyn WhatsAppTransport>,
    ) -> (TimedMessageWorker, Arc<InMemoryScheduledMessageRepository>) {
        let repo = Arc::new(InMemoryScheduledMessageRepository::new());
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let service = Arc::new(TimedMessageService::new(
            repo.clone(),
            clock,
            AssistantPolicy::disabled(),
        ));
        (
            TimedMessageWorker::new(service, transport, Duration::from_millis(1), 10),
            repo,
        )
    }

    #[tokio::test]
    async fn run_once_dispatches_due_batch() {
        let transport = Arc::new(RecordingTransport::new());
        let (worker, repo) = worker_with(transport.clone());

        let a = due_message("w1");
        let b = due_message("w2");
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        worker.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(transport.sent().len(), 2);
        for id in [a.id, b.id] {
            assert_eq!(
                repo.get(id).await.unwrap().unwrap().status,
                MessageStatus::Sent
            );
        }
    }

    #[tokio::test]
    async fn transport_failure_does_not_abort_the_batch() {
        let (worker, repo) = worker_with(Arc::new(FailingTransport));

        let a = due_message("w3");
        let b = due_message("w4");
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        worker.run_once(&CancellationToken::new()).await.unwrap();

        for id in [a.id, b.id] {
            let stored = repo.get(id).await.unwrap().unwrap();
            assert_eq!(stored.status, MessageStatus::Failed);
            assert_eq!(stored.attempt_count, 1);
        }
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let transport = Arc::new(RecordingTransport::new());
        let (worker, _repo) = worker_with(transport);

        let cancel = CancellationToken::new();
        cancel.cancel();
        // Returns immediately instead of polling forever.
        worker.run(cancel).await;
    }
}
