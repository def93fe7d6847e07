//! Sender authorization: pending auth codes, admin notification and the
//! post-approval welcome message.

use std::{collections::BTreeMap, collections::HashMap, sync::Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::normalize::{normalize_sender_id, ContactPhone};

pub trait AuthCodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Uniform random 6-digit code, zero-padded.
#[derive(Clone, Copy, Debug, Default)]
pub struct SixDigitAuthCodeGenerator;

impl AuthCodeGenerator for SixDigitAuthCodeGenerator {
    fn generate(&self) -> String {
        six_digit_code()
    }
}

pub fn six_digit_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

#[derive(Clone, Debug)]
pub struct PendingAuthEntry {
    pub code: String,
    pub updated_at: DateTime<Utc>,
}

/// Transient store of auth codes awaiting confirmation, keyed by the
/// normalized sender id.
pub trait PendingAuthStore: Send + Sync {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<PendingAuthEntry>;
    fn set(&self, key: &str, code: &str, now: DateTime<Utc>);
    fn clear(&self, key: &str);
}

pub struct InMemoryPendingAuthStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingAuthEntry>>,
}

impl InMemoryPendingAuthStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingAuthStore for InMemoryPendingAuthStore {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<PendingAuthEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get(key) {
            Some(entry) => now - entry.updated_at > self.ttl,
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).cloned()
    }

    fn set(&self, key: &str, code: &str, now: DateTime<Utc>) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(
            key.to_string(),
            PendingAuthEntry {
                code: code.to_string(),
                updated_at: now,
            },
        );
    }

    fn clear(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

pub fn format_admin_auth_request(
    code: &str,
    sender: &str,
    chat: &str,
    normalized: &str,
    name: &str,
    phone: &str,
) -> String {
    format!(
        "🔐 New assistant auth request\n\
         Code: {code}\n\
         Sender: {sender}\n\
         Chat: {chat}\n\
         Normalized: {normalized}\n\
         Name: {name}\n\
         Phone: {phone}"
    )
}

/// Best-effort display name + phone for the admin notification.
///
/// Name: `contact_name`, else `raw.contacts[0].profile.name`, else
/// `raw.contacts[0].name.formatted_name`, else `-`. Phone: the shared
/// contact phone(s), else `raw.contacts[0].wa_id`, else the normalized
/// sender id, else `-`.
pub fn requester_identity(
    sender_id: &str,
    contact_name: Option<&str>,
    contact_phone: Option<&ContactPhone>,
    raw: Option<&serde_json::Value>,
) -> (String, String) {
    let primary = raw
        .and_then(|v| v.get("contacts"))
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    let profile_name = primary
        .and_then(|c| c.get("profile"))
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .or_else(|| {
            primary
                .and_then(|c| c.get("name"))
                .and_then(|n| n.get("formatted_name"))
                .and_then(|n| n.as_str())
        });

    let display_name = contact_name
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| profile_name.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or("-")
        .to_string();

    let mut phone_display = match contact_phone {
        Some(ContactPhone::Many(values)) => values
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Some(ContactPhone::One(value)) => value.trim().to_string(),
        None => String::new(),
    };

    if phone_display.is_empty() {
        phone_display = primary
            .and_then(|c| c.get("wa_id"))
            .and_then(|w| w.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_default();
    }

    if phone_display.is_empty() {
        let normalized = normalize_sender_id(sender_id);
        phone_display = if normalized.is_empty() {
            "-".to_string()
        } else {
            normalized
        };
    }

    (display_name, phone_display)
}

pub fn build_welcome_message(instructions: &BTreeMap<String, String>) -> String {
    let lines: Vec<&str> = instructions
        .values()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if lines.is_empty() {
        return "🎉 Welcome to the personal assistant bot.".to_string();
    }

    let block = lines
        .iter()
        .map(|line| format!("- {line}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "🎉 Welcome to the personal assistant bot.\n\n\
         Here are the commands you can run:\n{block}"
    )
}
