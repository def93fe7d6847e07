//! Assistant-mode delivery notice.
//!
//! In assistant mode the worker does not message the recipient directly; it
//! sends the originator a ready-to-forward notice with a `wa.me` link.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::{format::display_recipient, model::ScheduledMessage, normalize::digits_of};

const NOTICE_PREVIEW_CHARS: usize = 160;

/// Everything outside RFC 3986 unreserved characters is escaped in the
/// `wa.me` text parameter.
const WA_TEXT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn build_whatsapp_link(chat_id: &str, text: &str) -> Option<String> {
    let digits = digits_of(chat_id);
    if digits.is_empty() {
        return None;
    }
    let encoded = utf8_percent_encode(text, WA_TEXT).to_string();
    Some(format!("https://wa.me/{digits}?text={encoded}"))
}

pub fn format_assistant_delivery(msg: &ScheduledMessage) -> String {
    let to_display = display_recipient(&msg.chat_id);
    let mut preview: String = msg.text.trim().replace('\n', " ");
    if preview.chars().count() > NOTICE_PREVIEW_CHARS {
        preview = format!(
            "{}...",
            preview
                .chars()
                .take(NOTICE_PREVIEW_CHARS - 3)
                .collect::<String>()
        );
    }

    match build_whatsapp_link(&msg.chat_id, &msg.text) {
        Some(link) => format!(
            "⏰ Scheduled message ready\nTo: {to_display}\nText: {preview}\nSend: {link}"
        ),
        None => format!(
            "⏰ Scheduled message ready\nTo: {to_display}\nText: {preview}\n\
             Send link unavailable for this recipient."
        ),
    }
}
