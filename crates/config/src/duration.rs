//! The duration grammar and possibly-unbounded timeouts

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors from the duration grammar
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("cannot parse {0:?} as time; use `<num>(min|s|ms|us)` format")]
    BadFormat(String),

    #[error("duration value {0:?} out of range")]
    OutOfRange(String),
}

/// Parse `<n>(min|s|ms|us)`; a bare `m` is accepted for minutes
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(digits_end);
    if num.is_empty() {
        return Err(DurationParseError::BadFormat(s.to_owned()));
    }
    let value: u64 = num
        .parse()
        .map_err(|_| DurationParseError::OutOfRange(s.to_owned()))?;

    match unit {
        "min" | "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| DurationParseError::OutOfRange(s.to_owned())),
        "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "us" => Ok(Duration::from_micros(value)),
        _ => Err(DurationParseError::BadFormat(s.to_owned())),
    }
}

/// A deadline that may be unbounded.
///
/// `inf` timeouts never fire; a finite timeout bounds one blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(Option<Duration>);

impl Timeout {
    /// Never fires
    pub const INF: Timeout = Timeout(None);

    #[inline]
    pub const fn finite(d: Duration) -> Self {
        Self(Some(d))
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.0.is_some()
    }

    #[inline]
    pub fn get(&self) -> Option<Duration> {
        self.0
    }

    /// The tighter of two deadlines
    pub fn min(&self, other: Timeout) -> Timeout {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Timeout(Some(a.min(b))),
            (Some(a), None) => Timeout(Some(a)),
            (None, b) => Timeout(b),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self(Some(d))
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("inf"),
            Some(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// Parse the full grammar including `inf`
pub fn parse_timeout(s: &str) -> Result<Timeout, DurationParseError> {
    if s == "inf" {
        return Ok(Timeout::INF);
    }
    parse_duration(s).map(Timeout::finite)
}
