//! Rate strings such as `16/3m`: a request limit per fixed time window.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Unit suffix of the window part of a rate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowUnit {
    /// `s`
    Second,
    /// `m`
    Minute,
    /// `h`
    Hour,
    /// `d`
    Day,
}

impl WindowUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.seconds())
    }

    fn seconds(&self) -> u64 {
        match self {
            WindowUnit::Second => 1,
            WindowUnit::Minute => 60,
            WindowUnit::Hour => 3600,
            WindowUnit::Day => 86400,
        }
    }

    /// Parse a unit suffix, ignoring case.
    pub fn from_suffix(suffix: char) -> Option<Self> {
        match suffix.to_ascii_lowercase() {
            's' => Some(WindowUnit::Second),
            'm' => Some(WindowUnit::Minute),
            'h' => Some(WindowUnit::Hour),
            'd' => Some(WindowUnit::Day),
            _ => None,
        }
    }

    /// The canonical (lowercase) suffix.
    pub fn suffix(&self) -> char {
        match self {
            WindowUnit::Second => 's',
            WindowUnit::Minute => 'm',
            WindowUnit::Hour => 'h',
            WindowUnit::Day => 'd',
        }
    }
}

/// Longest window a rate may use: 100 years of days.
pub const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 86400);

/// A parsed rate: at most `limit` requests per `window`.
///
/// A `RateSpec` is validated when it is built and is immutable afterwards,
/// so limiters never re-parse anything on the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct RateSpec {
    limit: u64,
    window: Duration,
}

impl RateSpec {
    /// Build a rate from its parts.
    ///
    /// A zero `limit` is accepted and yields a limiter that denies every
    /// keyed request. The window must be a whole number of seconds,
    /// greater than zero and no longer than [`MAX_WINDOW`].
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(GatekeeperError::Config(
                "rate window must be greater than zero".to_string(),
            ));
        }
        if window.subsec_nanos() != 0 {
            return Err(GatekeeperError::Config(format!(
                "rate window must be a whole number of seconds, got {:?}",
                window
            )));
        }
        if window > MAX_WINDOW {
            return Err(GatekeeperError::Config(format!(
                "rate window of {}s exceeds the maximum of {}s",
                window.as_secs(),
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(Self { limit, window })
    }

    /// Parse a rate string of the form `<limit>/<count><unit>`.
    ///
    /// `unit` is one of `s`, `m`, `h`, `d` in either case, and both numbers
    /// must be positive integers.
    pub fn parse(rate: &str) -> Result<Self> {
        let trimmed = rate.trim();
        let (limit_part, window_part) = trimmed
            .split_once('/')
            .ok_or_else(|| GatekeeperError::invalid_rate(rate, "missing '/' separator"))?;

        let limit = parse_positive(limit_part)
            .ok_or_else(|| GatekeeperError::invalid_rate(rate, "limit must be a positive integer"))?;

        let suffix = window_part
            .chars()
            .last()
            .ok_or_else(|| GatekeeperError::invalid_rate(rate, "missing window"))?;
        let unit = WindowUnit::from_suffix(suffix).ok_or_else(|| {
            GatekeeperError::invalid_rate(
                rate,
                format!("unknown window unit '{}', expected one of s, m, h, d", suffix),
            )
        })?;

        let count_part = &window_part[..window_part.len() - suffix.len_utf8()];
        let count = parse_positive(count_part).ok_or_else(|| {
            GatekeeperError::invalid_rate(rate, "window length must be a positive integer")
        })?;

        let window = count
            .checked_mul(unit.seconds())
            .map(Duration::from_secs)
            .filter(|window| *window <= MAX_WINDOW)
            .ok_or_else(|| {
                GatekeeperError::invalid_rate(
                    rate,
                    format!("window is too long, at most {}d", MAX_WINDOW.as_secs() / 86400),
                )
            })?;

        Ok(Self { limit, window })
    }

    /// Maximum number of admitted requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of the window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

fn parse_positive(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok().filter(|n| *n > 0)
}

impl FromStr for RateSpec {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RateSpec {
    type Error = GatekeeperError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Largest unit that divides the window evenly.
        let secs = self.window.as_secs();
        let unit = [WindowUnit::Day, WindowUnit::Hour, WindowUnit::Minute]
            .into_iter()
            .find(|unit| secs % unit.seconds() == 0)
            .unwrap_or(WindowUnit::Second);
        write!(f, "{}/{}{}", self.limit, secs / unit.seconds(), unit.suffix())
    }
}

impl Serialize for RateSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
