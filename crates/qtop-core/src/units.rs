//! Conversions between scheduler-native strings and integers.
//!
//! Both the text and the JSON reader go through these helpers so a value
//! means the same thing regardless of the wire format it arrived in.

use chrono::{Local, NaiveDateTime, TimeZone};
use thiserror::Error;

pub const KB_PER_GB: u64 = 1024 * 1024;

const SCHEDULER_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("invalid duration: {0:?}")]
    Duration(String),
    #[error("invalid memory size: {0:?}")]
    Memory(String),
    #[error("invalid timestamp: {0:?}")]
    Timestamp(String),
    #[error("invalid number: {0:?}")]
    Number(String),
}

/// Parses `HH:MM:SS` (also `MM:SS`, plain seconds, or `D:HH:MM:SS`) into
/// seconds. Hours may exceed two digits.
pub fn parse_duration(raw: &str) -> Result<u64, UnitError> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.is_empty() || parts.len() > 4 {
        return Err(UnitError::Duration(raw.to_string()));
    }
    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(UnitError::Duration(raw.to_string()));
        }
        let value: u64 = part
            .parse()
            .map_err(|_| UnitError::Duration(raw.to_string()))?;
        values.push(value);
    }
    let weights: &[u64] = match values.len() {
        1 => &[1],
        2 => &[60, 1],
        3 => &[3_600, 60, 1],
        _ => &[86_400, 3_600, 60, 1],
    };
    values
        .iter()
        .zip(weights)
        .try_fold(0u64, |total, (value, weight)| {
            value.checked_mul(*weight)?.checked_add(total)
        })
        .ok_or_else(|| UnitError::Duration(raw.to_string()))
}

pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3_600;
    let minutes = secs % 3_600 / 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Normalizes a memory string such as `4gb` or `1048576kb` to kilobytes.
/// A bare number is bytes, as the scheduler reports it. Byte counts round
/// up to the next whole kilobyte.
pub fn parse_memory_kb(raw: &str) -> Result<u64, UnitError> {
    let trimmed = raw.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);
    if number.is_empty() {
        return Err(UnitError::Memory(raw.to_string()));
    }
    let value: u64 = number
        .parse()
        .map_err(|_| UnitError::Memory(raw.to_string()))?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => return Ok(value.div_ceil(1024)),
        "kb" | "k" => 1,
        "mb" | "m" => 1024,
        "gb" | "g" => KB_PER_GB,
        "tb" | "t" => KB_PER_GB * 1024,
        _ => return Err(UnitError::Memory(raw.to_string())),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| UnitError::Memory(raw.to_string()))
}

/// Renders kilobytes as whole or one-decimal gigabytes: `4G`, `1.5G`.
pub fn format_gb(kb: u64) -> String {
    let gb = kb as f64 / KB_PER_GB as f64;
    if kb % KB_PER_GB == 0 {
        format!("{}G", kb / KB_PER_GB)
    } else {
        format!("{gb:.1}G")
    }
}

/// Accepts epoch seconds or the scheduler's local `Mon Oct 16 10:00:00 2026`.
pub fn parse_timestamp(raw: &str) -> Result<i64, UnitError> {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return trimmed
            .parse()
            .map_err(|_| UnitError::Timestamp(raw.to_string()));
    }
    let normalized = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&normalized, SCHEDULER_TIME_FORMAT)
        .map_err(|_| UnitError::Timestamp(raw.to_string()))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| UnitError::Timestamp(raw.to_string()))
}

pub fn parse_count(raw: &str) -> Result<u32, UnitError> {
    raw.trim()
        .parse()
        .map_err(|_| UnitError::Number(raw.to_string()))
}

/// Compact span for narrow columns: `45s`, `12m`, `1h05m`, `2d03h`.
pub fn format_span(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3_600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h{:02}m", secs / 3_600, secs % 3_600 / 60)
    } else {
        format!("{}d{:02}h", secs / 86_400, secs % 86_400 / 3_600)
    }
}
