use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Minimum digit count for something to be treated as a phone number.
const MIN_PHONE_DIGITS: usize = 8;

pub fn digits_of(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Digits-only projection of a sender id; falls back to the trimmed
/// original when no digits remain.
pub fn normalize_sender_id(sender_id: &str) -> String {
    let digits = digits_of(sender_id);
    if digits.is_empty() {
        sender_id.trim().to_string()
    } else {
        digits
    }
}

/// Inbound `contact_phone` arrives as a single string, a list of strings,
/// or nothing at all, depending on how the contact card was shared.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContactPhone {
    One(String),
    Many(Vec<String>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizedContactPhone {
    None,
    One(String),
    /// The contact card carried more than one distinct phone number.
    Multiple,
}

pub fn normalize_contact_phone(contact_phone: Option<&ContactPhone>) -> NormalizedContactPhone {
    match contact_phone {
        None => NormalizedContactPhone::None,
        Some(ContactPhone::One(value)) => {
            let digits = digits_of(value);
            if digits.len() >= MIN_PHONE_DIGITS {
                NormalizedContactPhone::One(digits)
            } else {
                NormalizedContactPhone::None
            }
        }
        Some(ContactPhone::Many(values)) => {
            let mut normalized: Vec<String> = Vec::new();
            for value in values {
                let digits = digits_of(value);
                if digits.len() >= MIN_PHONE_DIGITS && !normalized.contains(&digits) {
                    normalized.push(digits);
                }
            }
            match normalized.len() {
                0 => NormalizedContactPhone::None,
                1 => NormalizedContactPhone::One(normalized.remove(0)),
                _ => NormalizedContactPhone::Multiple,
            }
        }
    }
}

/// Resolve a flow "to" reply into a gateway address.
///
/// Already-addressed ids (`...@s.whatsapp.net`) pass through unchanged;
/// otherwise at least 8 digits are required, first from the literal text,
/// then from the shared contact's phone.
pub fn normalize_recipient(value: &str, contact_phone: Option<&str>) -> Option<String> {
    let value = value.trim();
    if !value.is_empty() && value.contains('@') {
        return Some(value.to_string());
    }

    if !value.is_empty() {
        let digits = digits_of(value);
        if digits.len() >= MIN_PHONE_DIGITS {
            return Some(format!("{digits}@s.whatsapp.net"));
        }
    }

    if let Some(phone) = contact_phone {
        let digits = digits_of(phone);
        if digits.len() >= MIN_PHONE_DIGITS {
            return Some(format!("{digits}@s.whatsapp.net"));
        }
    }

    None
}

/// Find a 12-hex-char token (a user-visible short id) in free text.
pub fn extract_id_prefix(text: Option<&str>) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\b([0-9a-fA-F]{12})\b").expect("short-id regex is valid")
    });
    re.captures(text?)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
