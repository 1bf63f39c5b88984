//! Time source abstraction for metadata freshness checks
//!
//! Expiry validation compares metadata timestamps against "now", but the
//! machine running a build is not always a machine with a clock worth
//! trusting blindly (CI containers, provisioning stations). The [`TimeSource`]
//! trait makes the clock an explicit dependency:
//!
//! - [`SystemTimeSource`]: wall clock via `std::time::SystemTime` (default)
//! - [`FixedTimeSource`]: a pinned timestamp, for tests and replayed builds
//!
//! Timestamps are Unix seconds (UTC). Metadata carries RFC 3339 strings;
//! [`parse_rfc3339`] converts them without pulling in a calendar crate.

use crate::error::LockboxError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Pluggable clock used by the metadata validator.
pub trait TimeSource: Send + Sync {
    /// Current time from this source.
    fn now(&self) -> Result<SystemTime, LockboxError>;

    /// Current time as Unix timestamp (seconds since epoch).
    fn now_unix(&self) -> Result<u64, LockboxError> {
        let time = self.now()?;
        time.duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|_| LockboxError::Time("system clock is before the Unix epoch".to_string()))
    }
}

/// Wall-clock time source (default for builds).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Result<SystemTime, LockboxError> {
        Ok(SystemTime::now())
    }
}

/// Fixed time source for deterministic validation.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    unix_secs: u64,
}

impl FixedTimeSource {
    /// Create a source pinned to the given Unix timestamp.
    pub fn from_unix_secs(unix_secs: u64) -> Self {
        Self { unix_secs }
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Result<SystemTime, LockboxError> {
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(self.unix_secs))
    }

    fn now_unix(&self) -> Result<u64, LockboxError> {
        Ok(self.unix_secs)
    }
}

/// Parse an RFC 3339 timestamp into Unix seconds.
///
/// Accepts the forms metadata servers emit: `YYYY-MM-DDTHH:MM:SSZ`,
/// with optional fractional seconds, and a literal `+00:00` offset.
/// Non-UTC offsets are rejected.
pub fn parse_rfc3339(s: &str) -> Result<u64, LockboxError> {
    let invalid = || LockboxError::Time(format!("Invalid RFC 3339 timestamp: '{}'", s));

    let trimmed = if let Some(t) = s.strip_suffix('Z') {
        t
    } else if let Some(t) = s.strip_suffix("+00:00") {
        t
    } else {
        return Err(invalid());
    };
    // Drop fractional seconds.
    let trimmed = trimmed.split('.').next().unwrap_or(trimmed);

    let (date, time) = trimmed.split_once('T').ok_or_else(invalid)?;

    let date_parts: Vec<u64> = date.split('-').filter_map(|p| p.parse().ok()).collect();
    let time_parts: Vec<u64> = time.split(':').filter_map(|p| p.parse().ok()).collect();
    if date_parts.len() != 3 || time_parts.len() != 3 {
        return Err(invalid());
    }

    const DAYS_IN_MONTH: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    let (year, month, day) = (date_parts[0], date_parts[1], date_parts[2]);
    let (hour, min, sec) = (time_parts[0], time_parts[1], time_parts[2]);
    if year < 1970 || !(1..=12).contains(&month) {
        return Err(invalid());
    }
    let month_days = DAYS_IN_MONTH[(month - 1) as usize]
        + if month == 2 && is_leap_year(year) { 1 } else { 0 };
    if !(1..=month_days).contains(&day) {
        return Err(invalid());
    }
    if hour > 23 || min > 59 || sec > 60 {
        return Err(invalid());
    }

    let mut days: u64 = 0;
    for y in 1970..year {
        days += if is_leap_year(y) { 366 } else { 365 };
    }
    for m in 1..month {
        days += DAYS_IN_MONTH[(m - 1) as usize];
        if m == 2 && is_leap_year(year) {
            days += 1;
        }
    }
    days += day - 1;

    Ok(days * 86400 + hour * 3600 + min * 60 + sec)
}

fn is_leap_year(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}
