//! Cron Evaluator (§4.D).
//!
//! Accepts standard 5-field cron (`min hour dom month dow`) or the 6-field
//! variant with a leading seconds field. Rejects malformed expressions at
//! parse time; computes the next fire time strictly greater than a
//! reference instant.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::ValidationError;

/// A parsed, armed cron expression.
#[derive(Debug, Clone)]
pub struct CronEvaluator {
    schedule: Schedule,
    source: String,
}

impl CronEvaluator {
    /// Parse a cron expression, rejecting malformed input synchronously
    /// (§4.D, §7 Validation).
    pub fn parse(expr: &str) -> Result<Self, ValidationError> {
        let normalized = normalize(expr);
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| ValidationError::InvalidCron(expr.to_string(), e.to_string()))?;
        Ok(Self {
            schedule,
            source: expr.to_string(),
        })
    }

    /// The original expression as supplied by the caller.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Next fire time strictly greater than `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// The `cron` crate expects a 6- or 7-field expression with seconds first.
/// spec.md's 5-field form (`min hour dom month dow`) needs a synthetic
/// leading `0` seconds field; a 6-field form (seconds already present) is
/// passed through unchanged.
fn normalize(expr: &str) -> String {
    let field_count = expr.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_malformed_expression() {
        assert!(CronEvaluator::parse("not a cron").is_err());
    }

    #[test]
    fn five_field_next_fire() {
        // Every hour on the hour.
        let cron = CronEvaluator::parse("0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let next = cron.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn six_field_every_second() {
        let cron = CronEvaluator::parse("* * * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
        let next = cron.next_after(after).unwrap();
        assert_eq!(next, after + chrono::Duration::seconds(1));
    }

    #[test]
    fn next_is_strictly_after_reference() {
        let cron = CronEvaluator::parse("0 0 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = cron.next_after(after).unwrap();
        assert!(next > after);
    }
}
