//! Parsing of human-readable interval strings such as `"1h10m30s"`.
//!
//! Intervals resolve to whole seconds in a `u32`. Anything that would not fit
//! is rejected rather than wrapped.

use serde::{Deserialize, Serialize};

use crate::error::{ArbiterError, Result};

const SECONDS_PER_MINUTE: u32 = 60;
const SECONDS_PER_HOUR: u32 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u32 = 24 * SECONDS_PER_HOUR;

/// Parse an interval string into whole seconds.
///
/// The accepted grammar is a non-empty sequence of `<digits><unit>` pairs
/// with units `d`, `h`, `m`, `s` in strictly decreasing magnitude. The bare
/// literal `"0"` is also accepted.
pub fn parse(input: &str) -> Result<u32> {
    if input == "0" {
        return Ok(0);
    }
    if input.is_empty() {
        return Err(ArbiterError::InvalidDuration("empty duration".to_string()));
    }

    let bytes = input.as_bytes();
    let mut total: u32 = 0;
    let mut previous_rank: Option<u8> = None;
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if start == pos {
            return Err(ArbiterError::InvalidDuration(format!(
                "expected a number at offset {} in {:?}",
                start, input
            )));
        }

        // Only ASCII digits here, so the sole failure mode is magnitude.
        let value: u32 = input[start..pos].parse().map_err(|_| {
            ArbiterError::Overflow(format!("{:?} does not fit in 32 bits", &input[start..pos]))
        })?;

        let Some(&unit) = bytes.get(pos) else {
            return Err(ArbiterError::InvalidDuration(format!(
                "missing unit after {} in {:?}",
                value, input
            )));
        };
        pos += 1;

        let (rank, multiplier) = match unit {
            b'd' => (4, SECONDS_PER_DAY),
            b'h' => (3, SECONDS_PER_HOUR),
            b'm' => (2, SECONDS_PER_MINUTE),
            b's' => (1, 1),
            _ => {
                let found = input[pos - 1..].chars().next().unwrap_or('?');
                return Err(ArbiterError::InvalidDuration(format!(
                    "unknown unit {:?} in {:?}",
                    found, input
                )));
            }
        };

        if let Some(previous) = previous_rank {
            if rank >= previous {
                return Err(ArbiterError::InvalidDuration(format!(
                    "units out of order in {:?}",
                    input
                )));
            }
        }
        previous_rank = Some(rank);

        let seconds = value.checked_mul(multiplier).ok_or_else(|| overflow(input))?;
        total = total.checked_add(seconds).ok_or_else(|| overflow(input))?;
    }

    Ok(total)
}

/// Validate an integer number of seconds.
pub fn from_integer(value: i64) -> Result<u32> {
    if value < 0 {
        return Err(ArbiterError::InvalidDuration(format!(
            "negative duration {}",
            value
        )));
    }
    u32::try_from(value).map_err(|_| overflow(&value.to_string()))
}

/// Validate a numeric literal that may have been written with a fraction.
pub fn from_number(value: f64) -> Result<u32> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(ArbiterError::InvalidDuration(format!(
            "{} is not a whole number of seconds",
            value
        )));
    }
    if value < 0.0 {
        return Err(ArbiterError::InvalidDuration(format!(
            "negative duration {}",
            value
        )));
    }
    if value > u32::MAX as f64 {
        return Err(overflow(&value.to_string()));
    }
    Ok(value as u32)
}

/// Render seconds in the canonical `1d2h3m4s` form accepted by [`parse`].
pub fn format_duration(seconds: u32) -> String {
    if seconds == 0 {
        return "0".to_string();
    }

    let mut out = String::new();
    let mut rest = seconds;
    for (unit, size) in [
        ('d', SECONDS_PER_DAY),
        ('h', SECONDS_PER_HOUR),
        ('m', SECONDS_PER_MINUTE),
        ('s', 1),
    ] {
        let amount = rest / size;
        rest %= size;
        if amount > 0 {
            out.push_str(&amount.to_string());
            out.push(unit);
        }
    }
    out
}

fn overflow(input: &str) -> ArbiterError {
    ArbiterError::Overflow(format!("duration {:?} exceeds {} seconds", input, u32::MAX))
}

/// A duration as written in configuration: either a number of seconds or an
/// interval string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSpec {
    /// Whole seconds
    Seconds(i64),
    /// A numeric literal with a fractional part (always rejected)
    Number(f64),
    /// An interval string such as `"1h30m"`
    Text(String),
}

impl DurationSpec {
    /// Resolve this value to whole seconds.
    pub fn to_seconds(&self) -> Result<u32> {
        match self {
            DurationSpec::Seconds(value) => from_integer(*value),
            DurationSpec::Number(value) => from_number(*value),
            DurationSpec::Text(text) => parse(text),
        }
    }
}

impl From<&str> for DurationSpec {
    fn from(text: &str) -> Self {
        DurationSpec::Text(text.to_string())
    }
}

impl From<u32> for DurationSpec {
    fn from(seconds: u32) -> Self {
        DurationSpec::Seconds(seconds as i64)
    }
}
