//! Parses the `--keep-for` retention duration grammar.
//!
//! Grammar: an unsigned integer followed by exactly one unit character:
//! `S` (seconds), `M` (minutes), `H` (hours), `d` (days), `w` (weeks),
//! `m` (months, fixed at 30 days), `y` (years, fixed at 365 days).
//!
//! This is deliberately not `humantime`: that crate's `M`/`y` units use
//! calendar-aware semantics, while this grammar fixes months/years to a
//! constant number of days.

use std::time::Duration;

use derive_more::{Display, Error};

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const MONTH: u64 = 30 * DAY;
const YEAR: u64 = 365 * DAY;

/// A retention duration parsed from `--keep-for`.
#[derive(Debug, Display, Error)]
#[display("invalid --keep-for duration {raw:?}: {reason}")]
pub struct DurationParseError {
    raw: String,
    #[error(ignore)]
    reason: &'static str,
}

/// Parses a `--keep-for` argument into a [`Duration`].
///
/// # Examples
///
/// ```
/// use btrfs_backup_lib::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
/// assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(2 * 7 * 86_400));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let err = |reason: &'static str| DurationParseError {
        raw: s.to_string(),
        reason,
    };

    if s.is_empty() {
        return Err(err("empty duration"));
    }

    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| err("missing unit suffix"))?;
    let (digits, unit) = s.split_at(split_at);

    if digits.is_empty() {
        return Err(err("missing numeric quantity"));
    }
    if unit.len() != 1 {
        return Err(err("unit must be a single character"));
    }

    let quantity: u64 = digits.parse().map_err(|_| err("quantity out of range"))?;
    let unit_secs = match unit {
        "S" => SECOND,
        "M" => MINUTE,
        "H" => HOUR,
        "d" => DAY,
        "w" => WEEK,
        "m" => MONTH,
        "y" => YEAR,
        _ => return Err(err("unit must be one of S,M,H,d,w,m,y")),
    };

    let secs = quantity
        .checked_mul(unit_secs)
        .ok_or_else(|| err("duration overflows"))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_unit() {
        assert_eq!(parse_duration("5S").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("5M").unwrap(), Duration::from_secs(5 * 60));
        assert_eq!(parse_duration("5H").unwrap(), Duration::from_secs(5 * 3600));
        assert_eq!(parse_duration("5d").unwrap(), Duration::from_secs(5 * DAY));
        assert_eq!(parse_duration("5w").unwrap(), Duration::from_secs(5 * WEEK));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(5 * MONTH));
        assert_eq!(parse_duration("5y").unwrap(), Duration::from_secs(5 * YEAR));
    }

    #[test]
    fn months_and_minutes_are_distinct_units() {
        // Case sensitivity matters: "m" is months, "M" is minutes.
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(MONTH));
        assert_eq!(parse_duration("1M").unwrap(), Duration::from_secs(MINUTE));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("d").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("1d2w").is_err());
    }
}
