//! Artifact retention policy.
//!
//! A policy is written as `<years>y<days>d<hours>h<minutes>m`, every
//! component optional and in any order. Years are 365 days. Unrecognised
//! text is ignored, and an empty or all-zero policy disables retention.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

static COMPONENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s*([ydhm])").unwrap());

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const YEAR: i64 = 365 * DAY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaxAge {
    seconds: i64,
}

impl MaxAge {
    /// Parse a policy string. Never fails; see the module docs.
    pub fn parse(policy: &str) -> Self {
        let mut years = None;
        let mut days = None;
        let mut hours = None;
        let mut minutes = None;

        for cap in COMPONENT_REGEX.captures_iter(policy) {
            let Ok(value) = cap[1].parse::<i64>() else {
                continue;
            };
            let slot = match cap[2].to_ascii_lowercase().as_str() {
                "y" => &mut years,
                "d" => &mut days,
                "h" => &mut hours,
                _ => &mut minutes,
            };
            // First occurrence of a unit wins.
            slot.get_or_insert(value);
        }

        let seconds = [(years, YEAR), (days, DAY), (hours, HOUR), (minutes, MINUTE)]
            .into_iter()
            .map(|(count, unit)| count.unwrap_or(0).saturating_mul(unit))
            .fold(0i64, i64::saturating_add);
        Self { seconds }
    }

    pub fn is_disabled(&self) -> bool {
        self.seconds == 0
    }

    pub fn as_secs(&self) -> i64 {
        self.seconds
    }

    /// Whether artifacts last changed at `last_change` are past this age
    /// at `now`.
    pub fn is_expired_at(&self, last_change: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.is_disabled() {
            return false;
        }
        now.signed_duration_since(last_change).num_seconds() > self.seconds
    }
}

impl fmt::Display for MaxAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_disabled() {
            return f.write_str("disabled");
        }
        let mut rest = self.seconds;
        for (unit, suffix) in [(YEAR, 'y'), (DAY, 'd'), (HOUR, 'h'), (MINUTE, 'm')] {
            let count = rest / unit;
            if count > 0 {
                write!(f, "{count}{suffix}")?;
                rest -= count * unit;
            }
        }
        Ok(())
    }
}
