//! Schedule records

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet picked up by the tick loop
    Scheduled,
    /// Running on schedule
    Active,
    /// Explicitly disabled, window expired, or max runs reached
    Disabled,
}

/// A recurring schedule bound to a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJob {
    pub id: String,
    pub recipe_id: String,

    /// Cron expression, standard 5-field or 6-field with seconds
    pub cron: String,

    /// IANA timezone name; occurrences are computed in UTC when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    /// Window start; no fires before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,

    /// Window end; the job self-disables past this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<Utc>>,

    /// The job self-disables after this many fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,

    #[serde(default)]
    pub run_count: u32,

    pub status: JobStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Accept standard 5-field cron expressions by prepending a seconds field
pub(crate) fn parse_cron(expression: &str) -> Result<Schedule, cron::error::Error> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
}

impl ScheduledJob {
    /// Compute the next occurrence strictly after `after`
    ///
    /// Honors the timezone and the start of the window. Returns None when
    /// the schedule has no further occurrences.
    pub fn compute_next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let schedule = parse_cron(&self.cron).ok()?;
        let floor = match self.start_at {
            Some(start) if start > after => start,
            _ => after,
        };

        let next = match &self.timezone {
            Some(tz_name) => {
                let tz: chrono_tz::Tz = tz_name.parse().ok()?;
                schedule
                    .after(&floor.with_timezone(&tz))
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
            None => schedule.after(&floor).next(),
        }?;

        match self.end_at {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    /// Window-expiry check, independent of run counting
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.end_at, Some(end) if now > end)
    }

    /// Max-run exhaustion check
    pub fn runs_exhausted(&self) -> bool {
        matches!(self.max_runs, Some(max) if self.run_count >= max)
    }
}

/// A single-fire schedule bound to a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeJob {
    pub id: String,
    pub recipe_id: String,
    pub execute_at: DateTime<Utc>,

    /// Set once the fire has happened; a fired job never fires again
    #[serde(default)]
    pub fired: bool,

    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(cron: &str) -> ScheduledJob {
        ScheduledJob {
            id: "job-1".to_string(),
            recipe_id: "recipe-1".to_string(),
            cron: cron.to_string(),
            timezone: None,
            start_at: None,
            end_at: None,
            max_runs: None,
            run_count: 0,
            status: JobStatus::Active,
            next_run: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_five_field_expressions_accepted() {
        assert!(parse_cron("0 9 * * 1-5").is_ok());
        assert!(parse_cron("0 0 9 * * Mon-Fri").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_next_run_daily() {
        let job = job("0 9 * * *");
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        let next = job.compute_next_run(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_respects_window_start() {
        let mut job = job("0 9 * * *");
        job.start_at = Some(Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());

        let after = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        let next = job.compute_next_run(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_past_window_end_is_none() {
        let mut job = job("0 9 * * *");
        job.end_at = Some(Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap());

        let after = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        assert!(job.compute_next_run(after).is_none());
    }

    #[test]
    fn test_next_run_in_timezone() {
        let mut job = job("0 9 * * *");
        job.timezone = Some("America/New_York".to_string());

        // 9am New York in winter is 14:00 UTC
        let after = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let next = job.compute_next_run(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 10, 14, 0, 0).unwrap());
    }

    #[test]
    fn test_exhaustion_checks() {
        let mut job = job("0 9 * * *");
        job.max_runs = Some(2);
        assert!(!job.runs_exhausted());
        job.run_count = 2;
        assert!(job.runs_exhausted());

        job.end_at = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert!(job.is_expired(Utc::now()));
    }
}
