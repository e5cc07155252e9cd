//! Detection and parsing of the optional `schedule` argument.
//!
//! Only tools whose input schema declares a `schedule` property take this
//! path. A preprocessed `targetISO` wins; otherwise the natural-language
//! `text`/`when` field is parsed. Unparseable or past targets execute
//! immediately.

use chrono::{DateTime, Duration, Local, NaiveTime, Utc};
use serde_json::Value;

/// Whether the tool's schema declares a `schedule` argument.
pub fn schema_declares_schedule(schema: &Value) -> bool {
    schema["properties"]
        .as_object()
        .map(|props| props.contains_key("schedule"))
        .unwrap_or(false)
}

/// The delay until the schedule's target, when it lies in the future.
pub fn schedule_delay_ms(args: &Value, now: DateTime<Utc>) -> Option<u64> {
    let schedule = args.get("schedule")?;
    let target = parse_target(schedule, now)?;
    let delay = target.signed_duration_since(now).num_milliseconds();
    if delay > 0 {
        Some(delay as u64)
    } else {
        None
    }
}

fn parse_target(schedule: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(iso) = schedule.get("targetISO").and_then(|v| v.as_str()) {
        if let Ok(target) = DateTime::parse_from_rfc3339(iso) {
            return Some(target.with_timezone(&Utc));
        }
    }

    let text = schedule
        .get("text")
        .or_else(|| schedule.get("when"))
        .and_then(|v| v.as_str())?;
    parse_natural(text, now)
}

/// Parse a small natural-language subset: relative offsets
/// ("in 5 minutes", "10s后"), wall-clock times ("at 18:30", "18:30"),
/// and bare RFC3339 stamps.
fn parse_natural(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = text.trim().to_lowercase();

    if let Ok(target) = DateTime::parse_from_rfc3339(&text) {
        return Some(target.with_timezone(&Utc));
    }

    if let Some(offset) = parse_relative(&text) {
        return Some(now + offset);
    }

    if let Some(time) = parse_wall_clock(&text) {
        let local_now = now.with_timezone(&Local);
        let mut candidate = local_now.date_naive().and_time(time);
        if candidate <= local_now.naive_local() {
            candidate = candidate + Duration::days(1);
        }
        return candidate
            .and_local_timezone(Local)
            .single()
            .map(|dt| dt.with_timezone(&Utc));
    }

    None
}

/// "in 5 minutes", "in 2h", "30分钟后", "10s后".
fn parse_relative(text: &str) -> Option<Duration> {
    let stripped = text
        .strip_prefix("in ")
        .or_else(|| text.strip_suffix('后').map(str::trim_end))
        .or_else(|| text.strip_suffix("later").map(str::trim_end))?;

    let digits: String = stripped.chars().take_while(|c| c.is_ascii_digit()).collect();
    let amount: i64 = digits.parse().ok()?;
    let unit = stripped[digits.len()..].trim();

    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" | "秒" | "秒钟" => {
            Some(Duration::seconds(amount))
        }
        "m" | "min" | "mins" | "minute" | "minutes" | "分" | "分钟" => {
            Some(Duration::minutes(amount))
        }
        "h" | "hr" | "hrs" | "hour" | "hours" | "小时" => Some(Duration::hours(amount)),
        "d" | "day" | "days" | "天" => Some(Duration::days(amount)),
        _ => None,
    }
}

/// "at 18:30", "18:30", "at 7:05".
fn parse_wall_clock(text: &str) -> Option<NaiveTime> {
    let text = text.strip_prefix("at ").unwrap_or(text).trim();
    let (hours, minutes) = text.split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
}
