//! Duration parsing for configuration values.
//!
//! Accepts an unsigned integer with an optional unit suffix: `us`, `ms`, `s`,
//! `m`, `h` or `d`. Without a suffix the caller's default unit applies.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Micros,
    Millis,
    Seconds,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("empty value")]
    Empty,
    #[error("unexpected character '{0}'")]
    Unexpected(char),
    #[error("value too large")]
    Overflow,
}

impl TimeError {
    /// The offending character, when there is one.
    pub fn unexpected(&self) -> Option<char> {
        match self {
            TimeError::Unexpected(c) => Some(*c),
            _ => None,
        }
    }
}

/// Parse `text` into a duration, `default` being the unit of a bare number.
pub fn parse_time(text: &str, default: TimeUnit) -> Result<Duration, TimeError> {
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(digits_end);
    if digits.is_empty() {
        return match suffix.chars().next() {
            Some(c) => Err(TimeError::Unexpected(c)),
            None => Err(TimeError::Empty),
        };
    }
    let value: u64 = digits.parse().map_err(|_| TimeError::Overflow)?;

    let micros_per_unit: u64 = match suffix {
        "" => match default {
            TimeUnit::Micros => 1,
            TimeUnit::Millis => 1_000,
            TimeUnit::Seconds => 1_000_000,
        },
        "us" => 1,
        "ms" => 1_000,
        "s" => 1_000_000,
        "m" => 60 * 1_000_000,
        "h" => 3_600 * 1_000_000,
        "d" => 86_400 * 1_000_000,
        other => return Err(TimeError::Unexpected(first_unexpected(other))),
    };

    value
        .checked_mul(micros_per_unit)
        .map(Duration::from_micros)
        .ok_or(TimeError::Overflow)
}

/// First character after the longest known unit prefix.
fn first_unexpected(suffix: &str) -> char {
    let rest = ["us", "ms", "s", "m", "h", "d"]
        .iter()
        .find_map(|unit| suffix.strip_prefix(unit))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(suffix);
    rest.chars().next().unwrap_or(' ')
}
