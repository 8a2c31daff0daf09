//! Time-Window / Condition Gate (§4.H).

use chrono::{DateTime, Timelike, Utc};

use crate::models::{parse_hhmm, ConditionSpec, TimeWindow};

impl TimeWindow {
    /// Convert `t` to the window's timezone, compare weekday against
    /// `days`, and return true iff the local time-of-day lies *strictly*
    /// between `start` and `end` (§4.H; boundary excluded per §9.2).
    ///
    /// Validation (bad timezone/HHMM/empty days) happens at schedule-insert
    /// time via [`TimeWindow::validate`], not here — this assumes a
    /// previously-validated window and is defensive rather than fallible.
    pub fn is_in_time_window(&self, t: DateTime<Utc>) -> bool {
        let Ok(tz) = crate::clock::load_location(&self.iana_timezone) else {
            return false;
        };
        let local = t.with_timezone(&tz);
        let weekday = crate::models::Weekday::from(local.weekday());
        if !self.days_of_week.contains(&weekday) {
            return false;
        }

        let Ok((start_h, start_m)) = parse_hhmm(&self.start_hhmm) else {
            return false;
        };
        let Ok((end_h, end_m)) = parse_hhmm(&self.end_hhmm) else {
            return false;
        };

        let minute_of_day = local.hour() * 60 + local.minute();
        let start = start_h * 60 + start_m;
        let end = end_h * 60 + end_m;
        minute_of_day > start && minute_of_day < end
    }
}

/// Evaluate a single pluggable condition (§4.H). Unimplemented condition
/// types evaluate to `true` (permissive default) and are flagged via
/// `tracing::warn!`, per spec.
pub fn evaluate_condition(condition: &ConditionSpec, now: DateTime<Utc>) -> bool {
    match condition.kind.as_str() {
        "time_of_day" => {
            let Ok(threshold) = condition.value.parse::<i64>() else {
                tracing::warn!(condition = %condition.kind, "time_of_day condition has non-integer value; permissive default");
                return true;
            };
            let hour = now.hour() as i64;
            match condition.operator.as_str() {
                ">" => hour > threshold,
                "<" => hour < threshold,
                other => {
                    tracing::warn!(operator = other, "unsupported time_of_day operator; permissive default");
                    true
                }
            }
        }
        "disk_space" | "custom" => {
            tracing::warn!(condition = %condition.kind, "condition type not implemented; permissive default");
            true
        }
        other => {
            tracing::warn!(condition = other, "unknown condition type; permissive default");
            true
        }
    }
}

/// Evaluate every condition in a list; all must pass.
pub fn evaluate_conditions(conditions: &[ConditionSpec], now: DateTime<Utc>) -> bool {
    conditions.iter().all(|c| evaluate_condition(c, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Weekday;
    use chrono::TimeZone;

    fn window() -> TimeWindow {
        TimeWindow {
            start_hhmm: "09:00".into(),
            end_hhmm: "17:00".into(),
            days_of_week: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            iana_timezone: "UTC".into(),
        }
    }

    /// S4: Monday 12:00 UTC -> in window.
    #[test]
    fn s4_monday_noon_in_window() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(); // a Monday
        assert!(window().is_in_time_window(t));
    }

    /// S4: Monday 20:00 UTC -> out.
    #[test]
    fn s4_monday_evening_out_of_window() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap();
        assert!(!window().is_in_time_window(t));
    }

    /// S4: Saturday 12:00 UTC -> out (wrong day).
    #[test]
    fn s4_saturday_out_of_window() {
        let t = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
        assert!(!window().is_in_time_window(t));
    }

    /// §8 boundary: exactly at StartTime is OUT (strict inequality).
    #[test]
    fn boundary_at_start_time_is_out() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        assert!(!window().is_in_time_window(t));
    }

    #[test]
    fn boundary_at_end_time_is_out() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap();
        assert!(!window().is_in_time_window(t));
    }

    #[test]
    fn unimplemented_condition_is_permissive() {
        let c = ConditionSpec {
            kind: "disk_space".into(),
            operator: ">".into(),
            value: "10".into(),
            params: Default::default(),
        };
        assert!(evaluate_condition(&c, Utc::now()));
    }

    #[test]
    fn time_of_day_condition_respects_operator() {
        let c = ConditionSpec {
            kind: "time_of_day".into(),
            operator: ">".into(),
            value: "5".into(),
            params: Default::default(),
        };
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert!(evaluate_condition(&c, t));
        let t2 = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        assert!(!evaluate_condition(&c, t2));
    }
}
