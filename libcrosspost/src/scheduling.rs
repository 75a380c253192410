//! Parsing of human-friendly schedule strings
//!
//! Accepted forms, tried in order:
//! - `now`
//! - `random:MIN-MAX`, e.g. `random:10m-2h`, measured from the previous
//!   scheduled post when one is given
//! - RFC 3339 timestamps (`2025-11-20T15:00:00+09:00`)
//! - `@<unix seconds>`
//! - relative durations (`30m`, `2h`, `1 day`), optionally prefixed with `in `
//! - natural language (`tomorrow 9am`, `next monday 10:00`)

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::{CrosspostError, Result};

const MIN_RANDOM_SECONDS: i64 = 30;
const MAX_RANDOM_SECONDS: i64 = 30 * 24 * 3600;

/// Parse a schedule string relative to the current time
pub fn parse_schedule(input: &str, last_scheduled: Option<i64>) -> Result<DateTime<Utc>> {
    parse_schedule_at(input, Utc::now(), last_scheduled)
}

/// Parse a schedule string relative to `now`
pub fn parse_schedule_at(
    input: &str,
    now: DateTime<Utc>,
    last_scheduled: Option<i64>,
) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CrosspostError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(range) = input.strip_prefix("random:") {
        return parse_random(range, now, last_scheduled);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(seconds) = input.strip_prefix('@') {
        let timestamp: i64 = seconds.parse().map_err(|_| {
            CrosspostError::InvalidInput(format!("Invalid unix timestamp: {}", input))
        })?;
        return DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
            CrosspostError::InvalidInput(format!("Timestamp out of range: {}", input))
        });
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Some(duration) = parse_duration(relative) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|_| {
        CrosspostError::InvalidInput(format!("Could not parse schedule string: {}", input))
    })
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::try_seconds(i64::try_from(std_duration.as_secs()).ok()?)
}

fn parse_random(
    range: &str,
    now: DateTime<Utc>,
    last_scheduled: Option<i64>,
) -> Result<DateTime<Utc>> {
    let (min, max) = range.split_once('-').ok_or_else(|| {
        CrosspostError::InvalidInput("Random format must be random:MIN-MAX".to_string())
    })?;

    let invalid = |part: &str| {
        CrosspostError::InvalidInput(format!("Could not parse duration: {}", part))
    };
    let min_secs = parse_duration(min.trim())
        .ok_or_else(|| invalid(min))?
        .num_seconds();
    let max_secs = parse_duration(max.trim())
        .ok_or_else(|| invalid(max))?
        .num_seconds();

    if min_secs < MIN_RANDOM_SECONDS {
        return Err(CrosspostError::InvalidInput(format!(
            "Minimum random interval must be at least {} seconds",
            MIN_RANDOM_SECONDS
        )));
    }
    if max_secs > MAX_RANDOM_SECONDS {
        return Err(CrosspostError::InvalidInput(format!(
            "Maximum random interval must be at most {} days",
            MAX_RANDOM_SECONDS / (24 * 3600)
        )));
    }
    if min_secs >= max_secs {
        return Err(CrosspostError::InvalidInput(
            "Minimum must be less than maximum".to_string(),
        ));
    }

    // Spread from the previous post, but never into the past
    let base = last_scheduled
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .filter(|ts| *ts > now)
        .unwrap_or(now);

    let offset = rand::thread_rng().gen_range(min_secs..=max_secs);
    Ok(base + Duration::seconds(offset))
}

/// Render a unix timestamp for CLI output
pub fn format_timestamp(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
