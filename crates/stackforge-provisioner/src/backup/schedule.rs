// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Due-time computation for backup schedules.
//!
//! A schedule is due when its most recent occurrence lies after its last run.
//! Only the latest occurrence is considered, so a driver that was down for
//! several periods fires once, not once per missed period.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use super::types::{BackupSchedule, ScheduleFrequency};
use crate::error::Result;

/// The most recent time at or before `now` the schedule should have fired.
pub fn latest_occurrence(schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let time = schedule.time_of_day()?;
    let today = now.date_naive();
    let occurrence = match schedule.frequency {
        ScheduleFrequency::Hourly => {
            let hour_start = today
                .and_hms_opt(now.hour(), 0, 0)
                .map(|t| t.and_utc())
                .unwrap_or(now);
            let candidate = hour_start + Duration::minutes(i64::from(time.minute()));
            if candidate > now {
                candidate - Duration::hours(1)
            } else {
                candidate
            }
        }
        ScheduleFrequency::Daily => {
            let candidate = today.and_time(time).and_utc();
            if candidate > now {
                candidate - Duration::days(1)
            } else {
                candidate
            }
        }
        ScheduleFrequency::Weekly => {
            let sunday = today - Duration::days(i64::from(now.weekday().num_days_from_sunday()));
            let candidate = sunday.and_time(time).and_utc();
            if candidate > now {
                candidate - Duration::weeks(1)
            } else {
                candidate
            }
        }
    };
    Ok(occurrence)
}

/// Whether an enabled schedule has an occurrence it has not run for yet.
pub fn is_due(schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<bool> {
    if !schedule.enabled {
        return Ok(false);
    }
    let occurrence = latest_occurrence(schedule, now)?;
    Ok(match schedule.last_run_at {
        Some(last) => occurrence > last,
        None => occurrence >= schedule.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::BackupType;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn schedule(frequency: ScheduleFrequency, time: &str) -> BackupSchedule {
        let mut s = BackupSchedule::new("p1", BackupType::Full, frequency, time);
        s.created_at = at(2024, 1, 1, 0, 0);
        s
    }

    #[test]
    fn test_daily_occurrence() {
        let s = schedule(ScheduleFrequency::Daily, "02:00");
        assert_eq!(latest_occurrence(&s, at(2024, 3, 5, 1, 59)).unwrap(), at(2024, 3, 4, 2, 0));
        assert_eq!(latest_occurrence(&s, at(2024, 3, 5, 2, 0)).unwrap(), at(2024, 3, 5, 2, 0));
    }

    #[test]
    fn test_hourly_occurrence_uses_minute() {
        let s = schedule(ScheduleFrequency::Hourly, "00:15");
        assert_eq!(latest_occurrence(&s, at(2024, 3, 5, 10, 14)).unwrap(), at(2024, 3, 5, 9, 15));
        assert_eq!(latest_occurrence(&s, at(2024, 3, 5, 10, 20)).unwrap(), at(2024, 3, 5, 10, 15));
    }

    #[test]
    fn test_weekly_occurrence_is_sunday() {
        let s = schedule(ScheduleFrequency::Weekly, "03:30");
        // 2024-03-06 is a Wednesday; the previous Sunday is 2024-03-03.
        assert_eq!(latest_occurrence(&s, at(2024, 3, 6, 12, 0)).unwrap(), at(2024, 3, 3, 3, 30));
        // Sunday before the time of day falls back a week.
        assert_eq!(latest_occurrence(&s, at(2024, 3, 3, 3, 0)).unwrap(), at(2024, 2, 25, 3, 30));
    }

    #[test]
    fn test_missed_periods_fire_once() {
        let mut s = schedule(ScheduleFrequency::Daily, "02:00");
        s.last_run_at = Some(at(2024, 3, 1, 2, 0));
        let now = at(2024, 3, 5, 9, 0);
        assert!(is_due(&s, now).unwrap());
        s.last_run_at = Some(now);
        assert!(!is_due(&s, now + Duration::hours(1)).unwrap());
    }

    #[test]
    fn test_disabled_schedule_never_due() {
        let mut s = schedule(ScheduleFrequency::Hourly, "00:00");
        s.enabled = false;
        assert!(!is_due(&s, at(2024, 3, 5, 9, 0)).unwrap());
    }

    #[test]
    fn test_new_schedule_waits_for_first_occurrence() {
        let mut s = schedule(ScheduleFrequency::Daily, "02:00");
        s.created_at = at(2024, 3, 5, 9, 0);
        assert!(!is_due(&s, at(2024, 3, 5, 10, 0)).unwrap());
        assert!(is_due(&s, at(2024, 3, 6, 2, 0)).unwrap());
    }
}
