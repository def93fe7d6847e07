//! Multi-step "add" flow state, keyed by (chat, sender).
//!
//! Entries expire 30 minutes after their last update; losing them across a
//! restart is fine, the user just sends `add` again.

use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Duration, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStep {
    To,
    When,
    Text,
}

#[derive(Clone, Debug)]
pub struct FlowState {
    pub step: FlowStep,
    /// Message id of the `add` command; doubles as the idempotency key for
    /// the eventual schedule call.
    pub request_id: String,
    pub sender_id: String,
    pub to_chat_id: Option<String>,
    pub send_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub type FlowKey = (String, String);

pub trait FlowStore: Send + Sync {
    fn get(&self, key: &FlowKey, now: DateTime<Utc>) -> Option<FlowState>;
    fn set(&self, key: FlowKey, value: FlowState);
    fn clear(&self, key: &FlowKey);
}

pub struct InMemoryFlowStore {
    ttl: Duration,
    flows: Mutex<HashMap<FlowKey, FlowState>>,
}

impl InMemoryFlowStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            flows: Mutex::new(HashMap::new()),
        }
    }
}

impl FlowStore for InMemoryFlowStore {
    fn get(&self, key: &FlowKey, now: DateTime<Utc>) -> Option<FlowState> {
        let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match flows.get(key) {
            Some(flow) => now - flow.updated_at > self.ttl,
            None => return None,
        };
        if expired {
            flows.remove(key);
            return None;
        }
        flows.get(key).cloned()
    }

    fn set(&self, key: FlowKey, value: FlowState) {
        self.flows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value);
    }

    fn clear(&self, key: &FlowKey) {
        self.flows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> FlowKey {
        ("chat-1".to_string(), "sender-1".to_string())
    }

    fn flow(updated_at: DateTime<Utc>) -> FlowState {
        FlowState {
            step: FlowStep::To,
            request_id: "m1".to_string(),
            sender_id: "sender-1".to_string(),
            to_chat_id: None,
            send_at: None,
            updated_at,
        }
    }

    #[test]
    fn entries_expire_after_ttl() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let store = InMemoryFlowStore::new(Duration::minutes(30));
        store.set(key(), flow(now));

        assert!(store.get(&key(), now + Duration::minutes(29)).is_some());
        assert!(store.get(&key(), now + Duration::minutes(31)).is_none());
        // Expired entry is dropped, not resurrected.
        assert!(store.get(&key(), now).is_none());
    }

    #[test]
    fn clear_removes_entry() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let store = InMemoryFlowStore::new(Duration::minutes(30));
        store.set(key(), flow(now));
        store.clear(&key());
        assert!(store.get(&key(), now).is_none());
    }
}
