//! Fire rules: when a job definition is due.

use core::str::FromStr;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use mailforge_core::{DomainError, DomainResult};

/// When a job fires.
///
/// Cron rules use standard 5-field Unix expressions (minute, hour,
/// day-of-month, month, day-of-week); interval rules fire a fixed number of
/// minutes after the previous run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireRule {
    Cron(String),
    Interval(u32),
}

impl FireRule {
    /// Validate and wrap a 5-field cron expression.
    pub fn cron(expression: impl Into<String>) -> DomainResult<Self> {
        let expression = expression.into();
        Schedule::from_str(&widen(&expression))
            .map_err(|e| DomainError::validation(format!("cron '{expression}': {e}")))?;
        Ok(Self::Cron(expression))
    }

    /// Fire every `minutes` minutes.
    pub fn every_minutes(minutes: u32) -> DomainResult<Self> {
        if minutes == 0 {
            return Err(DomainError::validation("interval must be at least 1 minute"));
        }
        Ok(Self::Interval(minutes))
    }

    /// Is the rule satisfied at `now`, given the job last ran at `last_run`?
    ///
    /// A job that has never run is due immediately. A cron job is due when
    /// the schedule has an occurrence in `(last_run, now]`.
    pub fn is_due(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        let Some(last_run) = last_run else {
            return true;
        };
        match self {
            FireRule::Interval(minutes) => now - last_run >= Duration::minutes(i64::from(*minutes)),
            FireRule::Cron(expression) => match Schedule::from_str(&widen(expression)) {
                Ok(schedule) => schedule
                    .after(&last_run)
                    .next()
                    .is_some_and(|next| next <= now),
                // Unparseable rules never fire; construction validates, so
                // this only covers rows corrupted out-of-band.
                Err(_) => false,
            },
        }
    }
}

/// Widen a 5-field Unix expression to the 7-field form the `cron` crate
/// parses (seconds pinned to :00, any year). Expressions already carrying 6+
/// fields pass through unchanged.
fn widen(expression: &str) -> String {
    if expression.split_whitespace().count() >= 6 {
        expression.to_string()
    } else {
        format!("0 {expression} *")
    }
}

impl fmt::Display for FireRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FireRule::Cron(expression) => write!(f, "cron:{expression}"),
            FireRule::Interval(minutes) => write!(f, "interval:{minutes}"),
        }
    }
}

impl FromStr for FireRule {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("cron", expression)) => Self::cron(expression),
            Some(("interval", minutes)) => {
                let minutes = minutes
                    .parse::<u32>()
                    .map_err(|e| DomainError::validation(format!("interval '{minutes}': {e}")))?;
                Self::every_minutes(minutes)
            }
            _ => Err(DomainError::validation(format!("unknown fire rule '{s}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn interval_rule_due_after_elapsed_minutes() {
        let rule = FireRule::every_minutes(5).unwrap();

        assert!(rule.is_due(at(10, 0), None));
        assert!(!rule.is_due(at(10, 4), Some(at(10, 0))));
        assert!(rule.is_due(at(10, 5), Some(at(10, 0))));
        assert!(rule.is_due(at(10, 10), Some(at(10, 0))));
    }

    #[test]
    fn cron_rule_due_when_an_occurrence_passed() {
        // Hourly at minute 0.
        let rule = FireRule::cron("0 * * * *").unwrap();

        assert!(rule.is_due(at(10, 30), None));
        assert!(!rule.is_due(at(10, 30), Some(at(10, 15))));
        assert!(rule.is_due(at(11, 0), Some(at(10, 15))));
        assert!(rule.is_due(at(12, 45), Some(at(10, 15))));
    }

    #[test]
    fn step_cron_expressions_parse() {
        let rule = FireRule::cron("*/5 * * * *").unwrap();
        assert!(rule.is_due(at(10, 5), Some(at(10, 0))));
        assert!(!rule.is_due(at(10, 4), Some(at(10, 0))));
    }

    #[test]
    fn invalid_rules_are_rejected_at_construction() {
        assert!(FireRule::cron("not a cron").is_err());
        assert!(FireRule::cron("99 * * * *").is_err());
        assert!(FireRule::every_minutes(0).is_err());
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        for raw in ["cron:*/10 * * * *", "interval:15"] {
            let rule: FireRule = raw.parse().unwrap();
            assert_eq!(rule.to_string(), raw);
        }
        assert!("every-other-day".parse::<FireRule>().is_err());
        assert!("interval:soon".parse::<FireRule>().is_err());
    }

    proptest! {
        /// A rule that is due stays due as long as the job does not run.
        #[test]
        fn due_rules_stay_due(
            minutes in 1u32..120,
            elapsed in 0i64..600,
            extra in 0i64..600,
        ) {
            let base = at(0, 0);
            let rule = FireRule::every_minutes(minutes).unwrap();
            let now = base + Duration::minutes(elapsed);
            if rule.is_due(now, Some(base)) {
                prop_assert!(rule.is_due(now + Duration::minutes(extra), Some(base)));
            }
        }

        /// Interval rules survive a Display/parse round trip.
        #[test]
        fn interval_rules_round_trip(minutes in 1u32..10_000) {
            let raw = format!("interval:{minutes}");
            let rule: FireRule = raw.parse().unwrap();
            prop_assert_eq!(rule.to_string(), raw);
        }
    }
}
