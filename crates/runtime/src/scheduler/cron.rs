//! Clock abstraction and cron expression evaluation.
//!
//! The public surface is standard 5-field cron (minute, hour, day-of-month,
//! month, day-of-week). Expressions are normalised to the `cron` crate's
//! 6-field form by prefixing a zero seconds field. Evaluation is pure: the
//! caller supplies the reference instant.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::types::CronError;

/// Source of "now", injectable so tests can pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, for tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Successful validation: the next two firings after the reference instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronValidation {
    pub first_firing: DateTime<Utc>,
    pub second_firing: DateTime<Utc>,
}

/// Stateless evaluator over 5-field cron expressions.
pub struct CronEvaluator;

impl CronEvaluator {
    /// Validate an expression and report its next two firings (UTC) after
    /// `after`.
    pub fn validate(
        expression: &str,
        after: DateTime<Utc>,
    ) -> Result<CronValidation, CronError> {
        let schedule = Self::parse(expression)?;
        let mut upcoming = schedule.after(&after);
        let first_firing = upcoming
            .next()
            .ok_or_else(|| Self::never_fires(expression))?;
        let second_firing = upcoming
            .next()
            .ok_or_else(|| Self::never_fires(expression))?;
        Ok(CronValidation {
            first_firing,
            second_firing,
        })
    }

    /// Next firing of `expression`, evaluated in `timezone`, strictly after
    /// `after`.
    pub fn next(
        expression: &str,
        timezone: &str,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, CronError> {
        let schedule = Self::parse(expression)?;
        let tz: chrono_tz::Tz = timezone
            .parse()
            .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))?;
        schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| Self::never_fires(expression))
    }

    fn parse(expression: &str) -> Result<Schedule, CronError> {
        let field_count = expression.split_whitespace().count();
        if field_count != 5 {
            return Err(CronError::InvalidExpression {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, found {field_count}"),
            });
        }
        Schedule::from_str(&format!("0 {}", expression.trim())).map_err(|e| {
            CronError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })
    }

    fn never_fires(expression: &str) -> CronError {
        CronError::InvalidExpression {
            expression: expression.to_string(),
            reason: "expression has no upcoming firing".to_string(),
        }
    }
}
