//! Schedule types and cron computation.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ScheduleError;

/// Schedule lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Active,
    Paused,
    Failed,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleStatus::Active => write!(f, "active"),
            ScheduleStatus::Paused => write!(f, "paused"),
            ScheduleStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ScheduleStatus::Active),
            "paused" => Ok(ScheduleStatus::Paused),
            "failed" => Ok(ScheduleStatus::Failed),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// A cron-driven workflow trigger (`schedules` row).
///
/// Expressions use the 6/7-field form with a leading seconds column, e.g.
/// `0 0 6 * * *` for daily at 06:00 UTC.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: Uuid,
    /// Bound workflow instance; unbound schedules get a fresh instance per
    /// trigger.
    pub workflow_id: Option<Uuid>,
    pub intent: String,
    pub platform: String,
    pub cron: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub status: ScheduleStatus,
    pub retry_count: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Build an active schedule with its first fire time computed.
    pub fn new(
        intent: &str,
        platform: &str,
        cron: &str,
        workflow_id: Option<Uuid>,
    ) -> Result<Self, ScheduleError> {
        let next_run_at = next_cron_fire(cron)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            workflow_id,
            intent: intent.to_string(),
            platform: platform.to_string(),
            cron: cron.to_string(),
            next_run_at,
            last_run_at: None,
            status: ScheduleStatus::Active,
            retry_count: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Parse a cron expression and compute the next fire time from now.
pub fn next_cron_fire(expr: &str) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = cron::Schedule::from_str(expr).map_err(|e| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })?;
    Ok(schedule.upcoming(Utc).next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            ScheduleStatus::Active,
            ScheduleStatus::Paused,
            ScheduleStatus::Failed,
        ] {
            let parsed: ScheduleStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn next_cron_fire_valid() {
        let next = next_cron_fire("0 0 6 * * *").unwrap();
        assert!(next.is_some());
        assert!(next.unwrap() > Utc::now());
    }

    #[test]
    fn next_cron_fire_invalid() {
        assert!(matches!(
            next_cron_fire("not a cron"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn new_schedule_has_future_fire_time() {
        let schedule = Schedule::new("daily_sales_report", "VinSolutions", "0 0 6 * * *", None)
            .unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert!(schedule.enabled);
        assert!(schedule.next_run_at.unwrap() > Utc::now());
    }

    #[test]
    fn new_schedule_rejects_bad_cron() {
        assert!(Schedule::new("x", "y", "bogus", None).is_err());
    }
}
