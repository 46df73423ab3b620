//! Wall-clock and timezone collaborators for the daily reset.
//!
//! The reset is keyed by calendar date in a fixed timezone, not by UTC. Both
//! the clock and the timezone are injected so that midnight rollovers can be
//! tested deterministically.

use chrono::{DateTime, Local, NaiveDate, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::sync::Mutex;
use tracing::warn;

use crate::errors::{ResetError, ResetResult};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A canonical `YYYY-MM-DD` calendar date.
///
/// Keys compare lexicographically in date order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DateKey(String);

impl DateKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    /// Parse a stored key, rejecting anything that is not a zero-padded date.
    pub fn parse(raw: &str) -> ResetResult<Self> {
        let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|e| ResetError::InvalidDateKey(format!("'{raw}': {e}")))?;
        let key = Self::from_date(date);
        if key.0 != raw {
            return Err(ResetError::InvalidDateKey(format!(
                "'{raw}' is not zero-padded YYYY-MM-DD"
            )));
        }
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps instants to calendar dates in the reset timezone.
#[derive(Debug, Clone)]
pub struct ResetCalendar {
    timezone_name: String,
    timezone: Option<Tz>,
}

impl ResetCalendar {
    /// Resolve `timezone_name` against the IANA database.
    ///
    /// An unknown name is not an error: dates fall back to the host's local
    /// calendar.
    pub fn new(timezone_name: &str) -> Self {
        let timezone = match timezone_name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(e) => {
                warn!(
                    timezone = %timezone_name,
                    "Unknown reset timezone, falling back to local date: {e}"
                );
                None
            }
        };

        Self {
            timezone_name: timezone_name.to_string(),
            timezone,
        }
    }

    pub fn timezone_name(&self) -> &str {
        &self.timezone_name
    }

    /// The resolved timezone, if the name was valid.
    pub fn timezone(&self) -> Option<Tz> {
        self.timezone
    }

    /// Date key for `now` in the reset timezone.
    pub fn date_key(&self, now: DateTime<Utc>) -> DateKey {
        let date = match self.timezone {
            Some(tz) => now.with_timezone(&tz).date_naive(),
            None => now.with_timezone(&Local).date_naive(),
        };
        DateKey::from_date(date)
    }

    /// Date key for the clock's current time.
    pub fn today(&self, clock: &dyn Clock) -> DateKey {
        self.date_key(clock.now())
    }
}
