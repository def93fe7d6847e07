//! Conversational event service for the WhatsApp surface.
//!
//! Owns the per-(chat, sender) "add" flow, routes the command surface
//! (`!whoami`, `!auth`, `!setup` / `!stop timed messages`, `add`, `list`,
//! `cancel`, `instructions`), and gates senders: per-sender approval in
//! assistant mode, a single scheduling group otherwise. Replies are sent
//! best-effort; a gateway hiccup never fails the inbound event.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::{
    auth::{
        build_welcome_message, format_admin_auth_request, requester_identity, AuthCodeGenerator,
        InMemoryPendingAuthStore, PendingAuthStore, SixDigitAuthCodeGenerator,
    },
    flow::{FlowKey, FlowState, FlowStep, FlowStore, InMemoryFlowStore},
    format::{format_list_reply, format_schedule_reply, format_when_prompt},
    normalize::{
        extract_id_prefix, normalize_contact_phone, normalize_recipient, normalize_sender_id,
        ContactPhone, NormalizedContactPhone,
    },
    runtime_config::TimedRuntimeConfig,
    service::{ScheduleRequest, TimedMessageService},
    transport::WhatsAppTransport,
    Error, Result,
};

/// Flow state and pending auth codes both expire 30 minutes after their
/// last update.
pub const FLOW_TTL_MINUTES: i64 = 30;
pub const AUTH_TTL_MINUTES: i64 = 30;

/// How many scheduled messages `list` shows.
const LIST_LIMIT: i64 = 5;

/// Normalized inbound event, as delivered by the gateway webhook.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub quoted_text: Option<String>,
    pub quoted_message_id: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<ContactPhone>,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub raw: Option<Value>,
}

/// `(accepted, reason)` surfaced back through the webhook response.
/// Rejections carry a machine-readable reason; some accepted outcomes do
/// too (e.g. a flow step that re-prompted).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventOutcome {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl EventOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn accepted_with(reason: impl Into<String>) -> Self {
        Self {
            accepted: true,
            reason: Some(reason.into()),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct WhatsAppEventService {
    service: Arc<TimedMessageService>,
    transport: Arc<dyn WhatsAppTransport>,
    runtime: Arc<TimedRuntimeConfig>,
    flows: Arc<dyn FlowStore>,
    pending_auth: Arc<dyn PendingAuthStore>,
    codes: Arc<dyn AuthCodeGenerator>,
    default_timezone: Option<String>,
}

impl WhatsAppEventService {
    pub fn new(
        service: Arc<TimedMessageService>,
        transport: Arc<dyn WhatsAppTransport>,
        runtime: Arc<TimedRuntimeConfig>,
        default_timezone: Option<String>,
    ) -> Self {
        Self::with_stores(
            service,
            transport,
            runtime,
            default_timezone,
            Arc::new(InMemoryFlowStore::new(Duration::minutes(FLOW_TTL_MINUTES))),
            Arc::new(InMemoryPendingAuthStore::new(Duration::minutes(
                AUTH_TTL_MINUTES,
            ))),
            Arc::new(SixDigitAuthCodeGenerator),
        )
    }

    /// Construction with explicit stores; tests inject fakes here.
    pub fn with_stores(
        service: Arc<TimedMessageService>,
        transport: Arc<dyn WhatsAppTransport>,
        runtime: Arc<TimedRuntimeConfig>,
        default_timezone: Option<String>,
        flows: Arc<dyn FlowStore>,
        pending_auth: Arc<dyn PendingAuthStore>,
        codes: Arc<dyn AuthCodeGenerator>,
    ) -> Self {
        Self {
            service,
            transport,
            runtime,
            flows,
            pending_auth,
            codes,
            default_timezone,
        }
    }

    pub async fn handle_inbound_event(&self, event: InboundEvent) -> Result<EventOutcome> {
        let text = event.text.as_deref().unwrap_or("").trim().to_string();
        let lowered = text.to_lowercase();
        let assistant_mode = self.service.assistant_mode();

        if lowered.starts_with("!whoami") {
            return self.handle_whoami(&event, &text).await;
        }
        if lowered.starts_with("!auth") {
            return self.handle_auth(&event, &text).await;
        }
        if lowered == "!setup timed messages" || lowered == "!stop timed messages" {
            if assistant_mode {
                self.send_reply(
                    &event.chat_id,
                    "ℹ️ Setup commands are not needed in assistant mode.",
                    Some(&event.message_id),
                )
                .await;
                return Ok(EventOutcome::accepted());
            }
            return self.handle_setup_command(&event, &lowered).await;
        }

        if assistant_mode && !self.runtime.is_sender_approved(&event.sender_id) {
            if !event.is_group {
                self.send_reply(
                    &event.chat_id,
                    "❌ Unauthorized. Ask the admin for the auth code.",
                    Some(&event.message_id),
                )
                .await;
            }
            return Ok(EventOutcome::rejected("unauthorized_sender"));
        }

        if !assistant_mode {
            let allowed_group = self.runtime.scheduling_group();
            if allowed_group.is_empty() || event.chat_id != allowed_group {
                return Ok(EventOutcome::rejected("unauthorized_group"));
            }
        }

        let key: FlowKey = (event.chat_id.clone(), event.sender_id.clone());
        if let Some(flow) = self.flows.get(&key, event.timestamp) {
            return self.handle_flow_step(flow, &event, &text).await;
        }

        if text.is_empty() {
            return Ok(EventOutcome::rejected("no_text"));
        }

        let command = text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        match command.as_str() {
            "add" => {
                self.flows.set(
                    key,
                    FlowState {
                        step: FlowStep::To,
                        request_id: event.message_id.clone(),
                        sender_id: event.sender_id.clone(),
                        to_chat_id: None,
                        send_at: None,
                        updated_at: event.timestamp,
                    },
                );
                self.send_reply(
                    &event.chat_id,
                    "*To Who?*\n(Phone number or contact)",
                    Some(&event.message_id),
                )
                .await;
                Ok(EventOutcome::accepted())
            }
            "instructions" => {
                self.send_reply(
                    &event.chat_id,
                    "Options:\n*add* (interactive scheduling),\n*list* (show scheduled),\n\
                     *cancel* (reply 'cancel' to a scheduled message).",
                    Some(&event.message_id),
                )
                .await;
                Ok(EventOutcome::accepted())
            }
            "cancel" => self.handle_cancel_command(&event, &text).await,
            "list" => {
                let scheduled = self
                    .service
                    .list_scheduled_for_sender(&event.sender_id, LIST_LIMIT)
                    .await?;
                let reply = format_list_reply(&scheduled, self.default_timezone.as_deref());
                self.send_reply(&event.chat_id, &reply, Some(&event.message_id))
                    .await;
                Ok(EventOutcome::accepted())
            }
            _ => Ok(EventOutcome::rejected("not_actionable")),
        }
    }

    // === Admin onboarding and per-sender auth ===

    async fn handle_whoami(&self, event: &InboundEvent, text: &str) -> Result<EventOutcome> {
        if !self.runtime.admin_sender_id().is_empty() {
            self.send_reply(&event.chat_id, "✅ Admin already set.", Some(&event.message_id))
                .await;
            return Ok(EventOutcome::accepted());
        }

        let code = text
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("");
        if code != self.runtime.admin_setup_code()? {
            self.send_reply(&event.chat_id, "❌ Invalid setup code.", Some(&event.message_id))
                .await;
            return Ok(EventOutcome::rejected("invalid_setup_code"));
        }

        self.runtime.set_admin_sender_id(&event.sender_id)?;
        self.send_reply(
            &event.chat_id,
            &format!("✅ Admin set to {}.", event.sender_id),
            Some(&event.message_id),
        )
        .await;
        Ok(EventOutcome::accepted())
    }

    async fn handle_auth(&self, event: &InboundEvent, text: &str) -> Result<EventOutcome> {
        if event.is_group {
            self.send_reply(
                &event.chat_id,
                "❌ Please DM me to authenticate.",
                Some(&event.message_id),
            )
            .await;
            return Ok(EventOutcome::rejected("auth_in_group"));
        }

        let normalized = normalize_sender_id(&event.sender_id);
        if self.runtime.is_sender_approved(&event.sender_id) {
            self.send_reply(&event.chat_id, "✅ Already approved.", Some(&event.message_id))
                .await;
            return Ok(EventOutcome::accepted());
        }

        let code_arg = text
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .filter(|rest| !rest.is_empty());

        let Some(code) = code_arg else {
            let code = self.codes.generate();
            self.pending_auth.set(&normalized, &code, self.service.now());
            warn!("assistant auth code for {normalized}: {code}");
            self.notify_admin_auth_request(event, &normalized, &code).await;
            self.send_reply(
                &event.chat_id,
                "✅ Auth code generated. Ask the admin for it, then reply with the 6-digit code.",
                Some(&event.message_id),
            )
            .await;
            return Ok(EventOutcome::accepted());
        };

        let Some(pending) = self.pending_auth.get(&normalized, self.service.now()) else {
            self.send_reply(
                &event.chat_id,
                "❌ No pending auth request. Send !auth to generate a new code.",
                Some(&event.message_id),
            )
            .await;
            return Ok(EventOutcome::rejected("auth_not_requested"));
        };

        if code != pending.code {
            self.send_reply(
                &event.chat_id,
                "❌ Invalid auth code. Send !auth to generate a new code.",
                Some(&event.message_id),
            )
            .await;
            return Ok(EventOutcome::rejected("invalid_auth_code"));
        }

        self.runtime.add_approved_number(&normalized)?;
        self.pending_auth.clear(&normalized);
        self.send_reply(
            &event.chat_id,
            &format!("✅ Approved: {normalized}."),
            Some(&event.message_id),
        )
        .await;
        let welcome = build_welcome_message(&self.runtime.instructions());
        self.send_reply(&event.chat_id, &welcome, Some(&event.message_id))
            .await;
        Ok(EventOutcome::accepted())
    }

    async fn notify_admin_auth_request(
        &self,
        event: &InboundEvent,
        normalized: &str,
        code: &str,
    ) {
        let admin_id = self.runtime.admin_sender_id();
        if admin_id.is_empty() {
            return;
        }
        // The admin approving themselves needs no heads-up.
        if !normalized.is_empty() && normalized == normalize_sender_id(&admin_id) {
            return;
        }

        let (name, phone) = requester_identity(
            &event.sender_id,
            event.contact_name.as_deref(),
            event.contact_phone.as_ref(),
            event.raw.as_ref(),
        );
        let message = format_admin_auth_request(
            code,
            &event.sender_id,
            &event.chat_id,
            normalized,
            &name,
            &phone,
        );
        self.send_reply(&admin_id, &message, None).await;
    }

    async fn handle_setup_command(
        &self,
        event: &InboundEvent,
        command: &str,
    ) -> Result<EventOutcome> {
        let admin_id = self.runtime.admin_sender_id();
        if admin_id.is_empty() {
            self.send_reply(
                &event.chat_id,
                "❌ Admin sender ID not configured.",
                Some(&event.message_id),
            )
            .await;
            return Ok(EventOutcome::rejected("admin_not_configured"));
        }
        if event.sender_id != admin_id {
            self.send_reply(&event.chat_id, "❌ Unauthorized.", Some(&event.message_id))
                .await;
            return Ok(EventOutcome::rejected("unauthorized_admin"));
        }

        if command == "!setup timed messages" {
            self.runtime.set_scheduling_group(&event.chat_id)?;
            self.send_reply(
                &event.chat_id,
                "✅ Timed messages enabled for this group.",
                Some(&event.message_id),
            )
            .await;
        } else {
            self.runtime.clear_scheduling_group()?;
            self.send_reply(
                &event.chat_id,
                "✅ Timed messages disabled for this group.",
                Some(&event.message_id),
            )
            .await;
        }
        Ok(EventOutcome::accepted())
    }

    // === The multi-step "add" flow ===

    async fn handle_flow_step(
        &self,
        mut flow: FlowState,
        event: &InboundEvent,
        text: &str,
    ) -> Result<EventOutcome> {
        flow.updated_at = event.timestamp;
        let key: FlowKey = (event.chat_id.clone(), flow.sender_id.clone());

        if text.eq_ignore_ascii_case("cancel") {
            self.flows.clear(&key);
            self.send_reply(&event.chat_id, "✅ Canceled scheduling.", Some(&event.message_id))
                .await;
            return Ok(EventOutcome::accepted());
        }

        match flow.step {
            FlowStep::To => self.flow_step_to(flow, key, event, text).await,
            FlowStep::When => self.flow_step_when(flow, key, event, text).await,
            FlowStep::Text => self.flow_step_text(flow, key, event, text).await,
        }
    }

    async fn flow_step_to(
        &self,
        mut flow: FlowState,
        key: FlowKey,
        event: &InboundEvent,
        text: &str,
    ) -> Result<EventOutcome> {
        let contact_phone = match normalize_contact_phone(event.contact_phone.as_ref()) {
            NormalizedContactPhone::Multiple => {
                self.send_reply(
                    &event.chat_id,
                    "❌ Can't send to multiple numbers. Please share one contact with one phone number.",
                    Some(&event.message_id),
                )
                .await;
                self.flows.set(key, flow);
                return Ok(EventOutcome::accepted_with("multiple_recipient_numbers"));
            }
            NormalizedContactPhone::One(phone) => Some(phone),
            NormalizedContactPhone::None => None,
        };

        match normalize_recipient(text, contact_phone.as_deref()) {
            None => {
                self.send_reply(
                    &event.chat_id,
                    "❌ Please reply with a phone number (digits, country code) or share a WhatsApp contact.",
                    Some(&event.message_id),
                )
                .await;
                self.flows.set(key, flow);
                Ok(EventOutcome::accepted())
            }
            Some(to_chat_id) => {
                flow.to_chat_id = Some(to_chat_id);
                flow.step = FlowStep::When;
                self.flows.set(key, flow);
                self.send_reply(&event.chat_id, &self.when_prompt(), Some(&event.message_id))
                    .await;
                Ok(EventOutcome::accepted())
            }
        }
    }

    async fn flow_step_when(
        &self,
        mut flow: FlowState,
        key: FlowKey,
        event: &InboundEvent,
        text: &str,
    ) -> Result<EventOutcome> {
        let send_at = match crate::timeparse::parse_send_at(
            text,
            self.default_timezone.as_deref(),
            self.service.now(),
        ) {
            Ok(send_at) => send_at,
            Err(_) => {
                self.send_reply(
                    &event.chat_id,
                    &format!("❌ Invalid time. {}", self.when_prompt()),
                    Some(&event.message_id),
                )
                .await;
                self.flows.set(key, flow);
                return Ok(EventOutcome::accepted());
            }
        };

        if send_at <= self.service.now() {
            self.send_reply(
                &event.chat_id,
                &format!("❌ Time must be in the future. {}", self.when_prompt()),
                Some(&event.message_id),
            )
            .await;
            self.flows.set(key, flow);
            return Ok(EventOutcome::accepted());
        }

        if let Err(Error::InvalidArgument(msg)) =
            self.service.validate_assistant_schedule_window(send_at)
        {
            self.send_reply(
                &event.chat_id,
                &format!("❌ {msg}"),
                Some(&event.message_id),
            )
            .await;
            self.flows.set(key, flow);
            return Ok(EventOutcome::accepted_with(msg));
        }

        flow.send_at = Some(send_at);
        flow.step = FlowStep::Text;
        self.flows.set(key, flow);
        self.send_reply(&event.chat_id, "*What should I say?*", Some(&event.message_id))
            .await;
        Ok(EventOutcome::accepted())
    }

    async fn flow_step_text(
        &self,
        flow: FlowState,
        key: FlowKey,
        event: &InboundEvent,
        text: &str,
    ) -> Result<EventOutcome> {
        let text = text.trim();
        if text.is_empty() {
            self.send_reply(
                &event.chat_id,
                "❌ Message text can't be empty. *What should I say?*",
                Some(&event.message_id),
            )
            .await;
            self.flows.set(key, flow);
            return Ok(EventOutcome::accepted());
        }

        let (Some(to_chat_id), Some(send_at)) = (flow.to_chat_id.clone(), flow.send_at) else {
            self.flows.clear(&key);
            return Ok(EventOutcome::rejected("not_actionable"));
        };

        let request = ScheduleRequest {
            chat_id: to_chat_id.clone(),
            from_chat_id: Some(flow.sender_id.clone()),
            text: text.to_string(),
            send_at,
            idempotency_key: flow.request_id.clone(),
            source: "whatsapp".to_string(),
            reason: Some(format!("whatsapp:{}", flow.request_id)),
        };

        let scheduled = match self.service.schedule(request).await {
            Ok(scheduled) => scheduled,
            Err(Error::InvalidArgument(msg)) => {
                let mut flow = flow;
                if msg == "send_at must be in the future" {
                    // The flow sat around long enough for the instant to
                    // pass; ask for a new time.
                    flow.step = FlowStep::When;
                    flow.send_at = None;
                    self.flows.set(key, flow);
                    self.send_reply(
                        &event.chat_id,
                        &format!("❌ Time must be in the future. {}", self.when_prompt()),
                        Some(&event.message_id),
                    )
                    .await;
                    return Ok(EventOutcome::accepted_with(msg));
                }
                self.flows.set(key, flow);
                self.send_reply(
                    &event.chat_id,
                    &format!("❌ {msg}"),
                    Some(&event.message_id),
                )
                .await;
                return Ok(EventOutcome::accepted_with(msg));
            }
            Err(err) => return Err(err),
        };

        let reply = format_schedule_reply(
            &scheduled.id,
            &to_chat_id,
            send_at,
            self.default_timezone.as_deref(),
        );
        let confirmation_id = self
            .send_reply(&event.chat_id, &reply, Some(&event.message_id))
            .await;
        if let Some(confirmation_id) = confirmation_id {
            self.service
                .set_confirmation_message_id(scheduled.id, &confirmation_id)
                .await?;
        }
        self.flows.clear(&key);
        Ok(EventOutcome::accepted())
    }

    // === Cancel resolution ===

    async fn handle_cancel_command(
        &self,
        event: &InboundEvent,
        text: &str,
    ) -> Result<EventOutcome> {
        let resolved = match self.resolve_cancel_id(event, text).await {
            Ok(resolved) => resolved,
            Err(Error::InvalidArgument(msg)) => {
                self.send_reply(&event.chat_id, &format!("❌ {msg}"), Some(&event.message_id))
                    .await;
                return Ok(EventOutcome::rejected(msg));
            }
            Err(err) => return Err(err),
        };

        let Some(msg_id) = resolved else {
            self.send_reply(&event.chat_id, "❌ invalid cancel id", Some(&event.message_id))
                .await;
            return Ok(EventOutcome::rejected("invalid_cancel_id"));
        };

        match self.service.cancel(msg_id).await {
            Ok(()) => {
                self.send_reply(
                    &event.chat_id,
                    &format!("✅ Cancelled\nID: {msg_id}"),
                    Some(&event.message_id),
                )
                .await;
                Ok(EventOutcome::accepted())
            }
            Err(Error::InvalidArgument(msg)) => {
                self.send_reply(&event.chat_id, &format!("❌ {msg}"), Some(&event.message_id))
                    .await;
                Ok(EventOutcome::rejected(msg))
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve the cancel target: a 12-hex prefix in the text or quoted
    /// text, else the quoted confirmation message. Ownership is enforced by
    /// the sender-scoped lookups.
    async fn resolve_cancel_id(
        &self,
        event: &InboundEvent,
        text: &str,
    ) -> Result<Option<Uuid>> {
        let prefix = extract_id_prefix(Some(text))
            .or_else(|| extract_id_prefix(event.quoted_text.as_deref()));
        if let Some(prefix) = prefix {
            return match self
                .service
                .find_by_id_prefix_for_sender(&prefix, &event.sender_id)
                .await?
            {
                Some(found) => Ok(Some(found.id)),
                None => Err(Error::InvalidArgument(
                    "could not find one of your scheduled messages with that ID".to_string(),
                )),
            };
        }

        if let Some(quoted_message_id) = &event.quoted_message_id {
            if let Some(found) = self
                .service
                .find_scheduled_by_confirmation_message_id_for_sender(
                    quoted_message_id,
                    &event.sender_id,
                )
                .await?
            {
                return Ok(Some(found.id));
            }
        }

        Ok(None)
    }

    // === Helpers ===

    fn when_prompt(&self) -> String {
        format_when_prompt(self.default_timezone.as_deref())
    }

    /// Best-effort reply; returns the gateway message id when available.
    async fn send_reply(
        &self,
        chat_id: &str,
        text: &str,
        quoted_message_id: Option<&str>,
    ) -> Option<String> {
        match self
            .transport
            .send_message(chat_id, text, quoted_message_id, None)
            .await
        {
            Ok(message_id) => message_id,
            Err(err) => {
                warn!("failed sending reply to {chat_id}: {err}");
                None
            }
        }
    }
}
