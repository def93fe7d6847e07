//! User-visible reply formatting for the WhatsApp surface.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    model::{short_id, ScheduledMessage},
    timeparse::format_local,
};

const LIST_PREVIEW_CHARS: usize = 40;

pub fn format_when_prompt(tz_name: Option<&str>) -> String {
    let tz = match tz_name.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => "UTC",
    };
    format!(
        "*When?*\nUse YYYY-MM-DD HH:MM\n\
         Or use HH:MM / 'today HH:MM' / 'tomorrow HH:MM'.\n\
         For example: today 18:30\n\
         (Current time zone: {tz})"
    )
}

/// Strip the gateway suffix for display (`123@s.whatsapp.net` -> `123`).
pub fn display_recipient(value: &str) -> &str {
    value.split('@').next().unwrap_or(value)
}

pub fn format_schedule_reply(
    scheduled_id: &Uuid,
    to_value: &str,
    send_at: DateTime<Utc>,
    tz_name: Option<&str>,
) -> String {
    let display_at = format_local(send_at, tz_name);
    format!(
        "✅ Scheduled\nID: {}\nTo: {}\nAt: {display_at}",
        short_id(scheduled_id),
        display_recipient(to_value)
    )
}

pub fn format_list_reply(messages: &[ScheduledMessage], tz_name: Option<&str>) -> String {
    if messages.is_empty() {
        return "✅ No scheduled messages".to_string();
    }

    let mut lines = vec!["✅ Scheduled messages".to_string()];
    for msg in messages {
        let when = format_local(msg.send_at, tz_name);
        let mut preview: String = msg.text.trim().replace('\n', " ");
        if preview.chars().count() > LIST_PREVIEW_CHARS {
            preview = format!(
                "{}...",
                preview
                    .chars()
                    .take(LIST_PREVIEW_CHARS - 3)
                    .collect::<String>()
            );
        }
        lines.push(format!("- {} | {when} | {preview}", msg.short_id()));
    }
    lines.join("\n")
}
