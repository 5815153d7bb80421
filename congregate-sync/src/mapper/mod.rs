//! Entity mapper: pure conversion between wire records and canonical records.
//!
//! Coercion rules shared by both systems. `null`, missing and `""` inputs all
//! come out as `None`; no rule ever produces an empty string.
//!
//! | rule    | accepted input                                   | output                 |
//! |---------|--------------------------------------------------|------------------------|
//! | text    | any present value                                | string form            |
//! | date    | `YYYY-MM-DD`, RFC 3339, common date forms, epoch ms | calendar date (UTC) |
//! | instant | strings containing `T` pass through; others parsed | millisecond `...Z`   |
//! | boolean | any present value                                | truthiness             |
//! | integer | numbers (truncated) or strings with a leading int | `i64`                 |

pub mod fibery;
pub mod pco;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// `None` for `null` and `""`.
fn present(value: Option<&Value>) -> Option<&Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(v) => Some(v),
    }
}

pub fn text(value: Option<&Value>) -> Option<String> {
    match present(value)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn date(value: Option<&Value>) -> Option<NaiveDate> {
    match present(value)? {
        Value::String(s) => parse_date(s.trim()),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.date_naive()),
        _ => None,
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Some(dt) = parse_instant(s) {
        return Some(dt.date_naive());
    }
    ["%Y/%m/%d", "%m/%d/%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Strings containing `T` are assumed to be ISO already and kept verbatim.
pub fn instant(value: Option<&Value>) -> Option<String> {
    match present(value)? {
        Value::String(s) if s.contains('T') => Some(s.clone()),
        Value::String(s) => {
            parse_instant(s.trim()).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        _ => None,
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` or a bare date (midnight), all UTC.
pub(crate) fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn boolean(value: Option<&Value>) -> Option<bool> {
    match present(value)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan())),
        _ => Some(true),
    }
}

pub fn integer(value: Option<&Value>) -> Option<i64> {
    match present(value)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => leading_integer(s),
        _ => None,
    }
}

fn leading_integer(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

/// `Value` forms used when writing canonical fields out.
pub(crate) fn date_value(date: NaiveDate) -> Value {
    Value::String(date.format("%Y-%m-%d").to_string())
}

pub(crate) fn string_value(s: &Option<String>) -> Option<Value> {
    s.as_ref().map(|s| Value::String(s.clone()))
}

/// Display-name fallback shared by both systems: first + last, else `None`.
pub(crate) fn joined_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = [first, last]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

pub const UNNAMED_PERSON: &str = "Unnamed Person";
pub const UNNAMED_HOUSEHOLD: &str = "Household";
