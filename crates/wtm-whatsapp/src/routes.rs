//! Inbound HTTP surface.
//!
//! `POST /whatsapp/events` adapts gateway webhooks into the event service;
//! the optional debug API under `/messages` is a non-WhatsApp path into the
//! same scheduling service, for testing and operations.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, warn};
use uuid::Uuid;

use wtm_core::{
    events::{InboundEvent, WhatsAppEventService},
    normalize::ContactPhone,
    service::{ScheduleRequest, TimedMessageService},
    Error,
};

#[derive(Clone)]
pub struct AppState {
    pub events: Arc<WhatsAppEventService>,
    pub service: Arc<TimedMessageService>,
}

pub fn router(state: AppState, enable_debug_api: bool) -> Router {
    let mut router = Router::new()
        .route("/whatsapp/events", post(receive_event))
        .route("/health", get(health));

    if enable_debug_api {
        router = router
            .route("/messages/schedule", post(schedule_message))
            .route("/messages/:id/cancel", post(cancel_message))
            .route("/messages/due", get(list_due_messages));
    }

    router.with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Wire shape of a gateway webhook. `timestamp` is unix seconds.
#[derive(Debug, Deserialize)]
pub struct InboundEventPayload {
    pub message_id: String,
    pub timestamp: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub is_group: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub quoted_text: Option<String>,
    #[serde(default)]
    pub quoted_message_id: Option<String>,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<ContactPhone>,
    #[serde(default)]
    pub raw: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub status: &'static str,
    pub accepted: bool,
    pub reason: Option<String>,
}

async fn receive_event(
    State(state): State<AppState>,
    Json(payload): Json<InboundEventPayload>,
) -> Response {
    let Some(timestamp) = DateTime::<Utc>::from_timestamp(payload.timestamp, 0) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "invalid timestamp"})),
        )
            .into_response();
    };

    let chat_id = payload.chat_id.clone();
    let sender_id = payload.sender_id.clone();
    let event = InboundEvent {
        message_id: payload.message_id,
        chat_id: payload.chat_id,
        sender_id: payload.sender_id,
        text: payload.text,
        quoted_text: payload.quoted_text,
        quoted_message_id: payload.quoted_message_id,
        contact_name: payload.contact_name,
        contact_phone: payload.contact_phone,
        timestamp,
        is_group: payload.is_group,
        raw: payload.raw,
    };

    match state.events.handle_inbound_event(event).await {
        Ok(outcome) => {
            if !outcome.accepted {
                warn!(
                    "whatsapp event rejected reason={:?} chat_id={chat_id} sender_id={sender_id}",
                    outcome.reason
                );
            }
            Json(EventResponse {
                status: "ok",
                accepted: outcome.accepted,
                reason: outcome.reason,
            })
            .into_response()
        }
        Err(err) => {
            error!("failed handling whatsapp event: {err}");
            error_response(err)
        }
    }
}

// === Debug API ===

#[derive(Debug, Deserialize)]
struct ScheduleMessagePayload {
    chat_id: String,
    #[serde(default)]
    from_chat_id: Option<String>,
    text: String,
    /// RFC 3339 with an explicit offset.
    send_at: DateTime<Utc>,
    idempotency_key: String,
    source: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn schedule_message(
    State(state): State<AppState>,
    Json(payload): Json<ScheduleMessagePayload>,
) -> Response {
    let request = ScheduleRequest {
        chat_id: payload.chat_id,
        from_chat_id: payload.from_chat_id,
        text: payload.text,
        send_at: payload.send_at,
        idempotency_key: payload.idempotency_key,
        source: payload.source,
        reason: payload.reason,
    };
    match state.service.schedule(request).await {
        Ok(scheduled) => Json(scheduled).into_response(),
        Err(err) => error_response(err),
    }
}

async fn cancel_message(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.service.cancel(id).await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct DueQuery {
    #[serde(default = "default_due_limit")]
    limit: i64,
}

fn default_due_limit() -> i64 {
    10
}

async fn list_due_messages(
    State(state): State<AppState>,
    Query(query): Query<DueQuery>,
) -> Response {
    match state.service.list_due(query.limit).await {
        Ok(due) => Json(due).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: Error) -> Response {
    match err {
        Error::InvalidArgument(msg) => {
            (StatusCode::BAD_REQUEST, Json(json!({"detail": msg}))).into_response()
        }
        err => {
            error!("request failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": "internal error"})),
            )
                .into_response()
        }
    }
}
