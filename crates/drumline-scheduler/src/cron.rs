//! Next-fire computation for cron and interval triggers.
//!
//! Triggers are evaluated in the schedule's IANA timezone and the result is
//! converted to UTC for storage. Local times that do not exist across a DST
//! spring-forward are skipped; ambiguous times on fall-back resolve to the
//! earliest instant.

use std::str::FromStr;

use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use ::cron::Schedule as CronSchedule;

use crate::error::{Result, SchedulerError};
use crate::types::Trigger;

/// Bound on the nonexistent-anchor scan: a little over a year of daily steps.
const MAX_INTERVAL_STEPS: u32 = 400;

/// Convert a 5-field Unix cron expression to the 6-field format the `cron`
/// crate expects, by prepending second 0. 6-field expressions pass through.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Validate a cron expression without computing a fire time.
pub fn validate_cron(expr: &str) -> Result<()> {
    CronSchedule::from_str(&normalize_cron_expr(expr))
        .map(|_| ())
        .map_err(|e| SchedulerError::InvalidSchedule(format!("bad cron expression {expr:?}: {e}")))
}

fn parse_tz(timezone: &str) -> Result<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))
}

/// Compute the next fire time strictly after `after`, evaluated in
/// `timezone`, returned as a UTC instant.
///
/// For interval triggers, `last_run` anchors the cadence: the next fire is
/// `last_run`'s local date plus the interval, at the configured local time.
/// Without a previous run the first candidate is `after`'s local date.
pub fn next_fire(
    trigger: &Trigger,
    timezone: &str,
    after: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let tz = parse_tz(timezone)?;
    match trigger {
        Trigger::Cron { expression } => {
            let schedule = CronSchedule::from_str(&normalize_cron_expr(expression)).map_err(
                |e| SchedulerError::InvalidSchedule(format!("bad cron expression {expression:?}: {e}")),
            )?;
            schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!(
                        "cron expression {expression:?} has no upcoming fire time"
                    ))
                })
        }
        Trigger::Interval {
            days,
            at_hour,
            at_minute,
        } => {
            let step = Duration::days((*days).max(1) as i64);
            let time = NaiveTime::from_hms_opt(*at_hour as u32, *at_minute as u32, 0)
                .ok_or_else(|| {
                    SchedulerError::InvalidSchedule(format!(
                        "invalid interval anchor time {at_hour:02}:{at_minute:02}"
                    ))
                })?;
            let mut date = match last_run {
                Some(run) => run.with_timezone(&tz).date_naive() + step,
                None => after.with_timezone(&tz).date_naive(),
            };
            for _ in 0..MAX_INTERVAL_STEPS {
                match tz.from_local_datetime(&date.and_time(time)) {
                    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                        let candidate = dt.with_timezone(&Utc);
                        if candidate > after {
                            return Ok(candidate);
                        }
                        date += step;
                    }
                    // The anchor does not exist on this date (spring forward);
                    // the next day that has it picks the cadence back up.
                    LocalResult::None => date += Duration::days(1),
                }
            }
            Err(SchedulerError::InvalidSchedule(
                "could not find a future interval fire time".to_string(),
            ))
        }
    }
}
