use std::sync::OnceLock;

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;

use crate::{Error, Result};

/// Resolve the configured IANA timezone name.
pub fn load_timezone(tz_name: Option<&str>) -> Result<Tz> {
    let name = match tz_name.map(str::trim) {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(Error::InvalidArgument(
                "timezone required; set DEFAULT_TIMEZONE".to_string(),
            ))
        }
    };
    name.parse::<Tz>()
        .map_err(|_| Error::InvalidArgument(format!("invalid timezone '{name}'")))
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        // DST fall-back: take the earlier of the two wall times.
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(Error::InvalidArgument(
            "invalid time (does not exist in the configured timezone)".to_string(),
        )),
    }
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map_err(|_| Error::InvalidArgument("invalid time (use HH:MM)".to_string()))
}

/// Parse a user-entered send time in the configured timezone.
///
/// Accepted forms:
/// - `HH:MM`: the next occurrence of that wall time (rolls to tomorrow if
///   already past today)
/// - `today HH:MM` / `tomorrow HH:MM`
/// - `YYYY-MM-DD HH:MM`
pub fn parse_send_at(
    value: &str,
    tz_name: Option<&str>,
    now_utc: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    static HHMM: OnceLock<Regex> = OnceLock::new();
    let hhmm = HHMM.get_or_init(|| Regex::new(r"^\d{1,2}:\d{2}$").expect("hh:mm regex is valid"));

    let value = value.trim();
    let lowered = value.to_lowercase();
    let tz = load_timezone(tz_name)?;
    let now_local = now_utc.with_timezone(&tz);

    if hhmm.is_match(value) {
        let time = parse_hhmm(value)?;
        let send_at = resolve_local(tz, now_local.date_naive().and_time(time))?;
        if send_at <= now_utc {
            let tomorrow = now_local.date_naive() + Duration::days(1);
            return resolve_local(tz, tomorrow.and_time(time));
        }
        return Ok(send_at);
    }

    if lowered.starts_with("today") || lowered.starts_with("tomorrow") {
        let mut parts = lowered.split_whitespace();
        let day = parts.next().unwrap_or_default();
        let Some(time_part) = parts.next() else {
            return Err(Error::InvalidArgument(
                "time required (use 'today HH:MM' or 'tomorrow HH:MM')".to_string(),
            ));
        };
        let time = parse_hhmm(time_part)?;
        let mut base = now_local.date_naive();
        if day == "tomorrow" {
            base = base + Duration::days(1);
        }
        return resolve_local(tz, base.and_time(time));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M").map_err(|_| {
        Error::InvalidArgument("invalid 'at' format (use YYYY-MM-DD HH:MM)".to_string())
    })?;
    resolve_local(tz, naive)
}

/// Render an instant as local wall time; falls back to UTC when the
/// timezone is missing or unparseable.
pub fn format_local(value: DateTime<Utc>, tz_name: Option<&str>) -> String {
    match load_timezone(tz_name) {
        Ok(tz) => value.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string(),
        Err(_) => value.format("%Y-%m-%d %H:%M").to_string(),
    }
}
