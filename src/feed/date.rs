//! Timestamp normalization for feed dates and persisted watermarks.
//!
//! Feeds disagree about how to write a date, and the config file stores
//! watermarks in yet another layout. Every accepted variant lives here so
//! that new layouts are added in one place.
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// RFC 1123 with a numeric zone, weekday already removed:
/// `02 Jan 2006 15:04:05 -0700`.
const RFC1123_NUMERIC: &str = "%d %b %Y %H:%M:%S %z";

/// RFC 1123 without weekday or zone token. The zone is resolved separately.
const RFC1123_NAIVE: &str = "%d %b %Y %H:%M:%S";

/// Persisted watermark without its trailing zone token.
const WATERMARK_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// Layout used when writing a watermark back to the config file.
const WATERMARK_OUTPUT: &str = "%Y-%m-%d %H:%M:%S%.f +0000 UTC";

/// No accepted layout matched the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized date format: {input:?}")]
pub struct DateFormatError {
    pub input: String,
}

/// Parses a timestamp string into a UTC instant.
///
/// Layouts are tried in this order:
///
/// 1. RFC 1123 with numeric zone (`Tue, 02 Jan 2024 10:00:00 +0300`)
/// 2. RFC 1123 with named zone (`Tue, 02 Jan 2024 10:00:00 GMT`)
/// 3. Persisted watermark (`2024-01-02 10:00:00 +0000 UTC` or
///    `2024-01-02 10:00:00 +0000 +0000`)
/// 4. RFC 3339 (`2024-01-02T10:00:00Z`), as used by `dc:date` and Atom
///
/// A last lenient RFC 2822 pass catches variants such as single-digit days.
/// Surrounding whitespace is ignored. A leading weekday name is skipped
/// without being checked against the date, since feeds often get it wrong.
///
/// # Errors
///
/// Returns [`DateFormatError`] when nothing matches.
pub fn normalize(raw: &str) -> Result<DateTime<Utc>, DateFormatError> {
    let s = raw.trim();
    let dated = strip_weekday(s);

    let parsed = DateTime::parse_from_str(dated, RFC1123_NUMERIC)
        .ok()
        .or_else(|| parse_named_zone(dated))
        .or_else(|| parse_watermark(s))
        .or_else(|| DateTime::parse_from_rfc3339(s).ok())
        .or_else(|| DateTime::parse_from_rfc2822(dated).ok());

    parsed
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| DateFormatError {
            input: raw.to_string(),
        })
}

/// Formats an instant in the layout the config file stores.
///
/// The fractional part is written only when non-zero, so second-precision
/// feed dates round-trip as `2024-01-02 10:00:00 +0000 UTC`.
pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.format(WATERMARK_OUTPUT).to_string()
}

/// Drops a leading `Day,` token. chrono rejects a weekday that disagrees with
/// the date.
fn strip_weekday(s: &str) -> &str {
    match s.split_once(',') {
        Some((day, rest)) if !day.is_empty() && day.bytes().all(|b| b.is_ascii_alphabetic()) => {
            rest.trim_start()
        }
        _ => s,
    }
}

fn parse_named_zone(s: &str) -> Option<DateTime<FixedOffset>> {
    let (head, zone) = s.rsplit_once(' ')?;
    if zone.is_empty() || !zone.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }

    let naive = NaiveDateTime::parse_from_str(head, RFC1123_NAIVE).ok()?;
    let offset = FixedOffset::east_opt(zone_offset_secs(zone))?;
    offset.from_local_datetime(&naive).single()
}

/// Offset for a zone abbreviation. Unknown names resolve to UTC.
fn zone_offset_secs(zone: &str) -> i32 {
    const HOUR: i32 = 3600;
    match zone.to_ascii_uppercase().as_str() {
        "EST" => -5 * HOUR,
        "EDT" => -4 * HOUR,
        "CST" => -6 * HOUR,
        "CDT" => -5 * HOUR,
        "MST" => -7 * HOUR,
        "MDT" => -6 * HOUR,
        "PST" => -8 * HOUR,
        "PDT" => -7 * HOUR,
        "MSK" => 3 * HOUR,
        "UT" | "UTC" | "GMT" | "Z" => 0,
        other => {
            tracing::debug!(zone = other, "Unknown zone abbreviation, assuming UTC");
            0
        }
    }
}

fn parse_watermark(s: &str) -> Option<DateTime<FixedOffset>> {
    let mut parts = s.split_whitespace();
    let (date, time, offset, zone) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || !is_zone_token(zone) {
        return None;
    }

    DateTime::parse_from_str(&format!("{date} {time} {offset}"), WATERMARK_LAYOUT).ok()
}

/// Accepts `UTC`-style names and `+0000`-style numeric offsets.
fn is_zone_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    let numeric = bytes.len() == 5
        && matches!(bytes[0], b'+' | b'-')
        && bytes[1..].iter().all(u8::is_ascii_digit);
    let named = !bytes.is_empty() && bytes.iter().all(u8::is_ascii_alphabetic);
    numeric || named
}
