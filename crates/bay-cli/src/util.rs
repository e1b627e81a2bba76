//! Parsing of operator-entered times and durations.

use std::sync::LazyLock;

use anyhow::Context;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;

/// `1h30m`, `2h`, `45m`
static UNIT_DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?$").unwrap());

/// `1:30`
static CLOCK_DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):([0-5]\d)$").unwrap());

/// Bookings are well under a day; anything longer is a typo.
const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// Parse a session length.
///
/// Supports:
/// - Units: "1h30m", "2h", "90m"
/// - Clock: "1:30"
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (hours, minutes) = if let Some(caps) = CLOCK_DURATION_RE.captures(s) {
        (caps[1].to_string(), caps[2].to_string())
    } else if let Some(caps) = UNIT_DURATION_RE.captures(s).filter(|_| !s.is_empty()) {
        (
            caps.get(1).map_or("0", |m| m.as_str()).to_string(),
            caps.get(2).map_or("0", |m| m.as_str()).to_string(),
        )
    } else {
        anyhow::bail!("Invalid duration: {s}. Use e.g. 1h30m, 90m or 1:30");
    };

    let hours: i64 = hours.parse().context("failed to parse hours")?;
    let minutes: i64 = minutes.parse().context("failed to parse minutes")?;
    let total = hours
        .checked_mul(60)
        .and_then(|h| h.checked_add(minutes))
        .filter(|total| *total <= MAX_DURATION_MINUTES)
        .with_context(|| format!("Duration too long: {s}"))?;
    if total == 0 {
        anyhow::bail!("Duration must be positive: {s}");
    }
    Ok(Duration::minutes(total))
}

/// Parse a start or end time.
///
/// Supports:
/// - Time of day on `today`: "14:30"
/// - Full local datetime: "2025-03-14 14:30" or "2025-03-14T14:30"
pub fn parse_time_on(s: &str, today: NaiveDate) -> anyhow::Result<NaiveDateTime> {
    let s = s.trim();
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M") {
        return Ok(today.and_time(time));
    }
    for format in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(datetime);
        }
    }
    anyhow::bail!("Invalid time: {s}. Use HH:MM or YYYY-MM-DD HH:MM")
}

/// Split a console line into words, keeping double-quoted runs together.
pub fn split_words(line: &str) -> anyhow::Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        anyhow::bail!("Unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
