// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for backup schedules and retention.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::TestContext;
use stackforge_provisioner::backup::{
    BackupConfig, BackupSchedule, BackupStatus, BackupType, ScheduleFrequency,
};
use stackforge_provisioner::error::{Error, ResourceKind};

fn at(d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, d, h, min, 0).unwrap()
}

fn daily(project_id: &str) -> BackupSchedule {
    let mut schedule = BackupSchedule::new(project_id, BackupType::Full, ScheduleFrequency::Daily, "02:00");
    schedule.created_at = at(1, 0, 0);
    schedule
}

#[tokio::test]
async fn test_daily_schedule_fires_once_per_occurrence() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.engine.set_backup_schedule(daily("p1")).await.unwrap();

    assert!(ctx.engine.run_due_schedules(at(1, 1, 59)).await.is_empty());

    let started = ctx.engine.run_due_schedules(at(1, 2, 0)).await;
    assert_eq!(started.len(), 1);
    assert!(started[0].scheduled);
    ctx.backup_completed(&started[0].backup_id).await;

    // A day and an hour later: exactly one more backup, not one per check.
    assert!(ctx.engine.run_due_schedules(at(1, 12, 0)).await.is_empty());
    let started = ctx.engine.run_due_schedules(at(2, 3, 0)).await;
    assert_eq!(started.len(), 1);
    ctx.backup_completed(&started[0].backup_id).await;
    assert!(ctx.engine.run_due_schedules(at(2, 3, 1)).await.is_empty());

    assert_eq!(ctx.engine.list_backups(Some("p1")).await.len(), 2);
    let schedule = ctx
        .engine
        .get_backup_schedule("p1", BackupType::Full)
        .await
        .unwrap();
    assert_eq!(schedule.last_run_at, Some(at(2, 3, 0)));
}

#[tokio::test]
async fn test_missed_occurrences_fire_once() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.engine.set_backup_schedule(daily("p1")).await.unwrap();

    let started = ctx.engine.run_due_schedules(at(5, 8, 0)).await;
    assert_eq!(started.len(), 1);
    assert!(ctx.engine.run_due_schedules(at(5, 9, 0)).await.is_empty());
}

#[tokio::test]
async fn test_disabled_schedule_never_fires() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    let mut schedule = daily("p1");
    schedule.enabled = false;
    ctx.engine.set_backup_schedule(schedule).await.unwrap();

    assert!(ctx.engine.run_due_schedules(at(3, 2, 0)).await.is_empty());
    assert!(ctx.engine.list_backups(Some("p1")).await.is_empty());
}

#[tokio::test]
async fn test_schedule_validation() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let mut bad_time = daily("p1");
    bad_time.time = "25:00".to_string();
    assert!(matches!(
        ctx.engine.set_backup_schedule(bad_time).await,
        Err(Error::InvalidRequest(_))
    ));

    assert!(matches!(
        ctx.engine.set_backup_schedule(daily("ghost")).await,
        Err(Error::NotFound { .. })
    ));

    let err = ctx
        .engine
        .get_backup_schedule("p1", BackupType::Database)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound {
            kind: ResourceKind::Schedule,
            ..
        }
    ));
}

#[tokio::test]
async fn test_schedule_update_keeps_one_per_type() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.engine.set_backup_schedule(daily("p1")).await.unwrap();

    let mut hourly = daily("p1");
    hourly.frequency = ScheduleFrequency::Hourly;
    hourly.time = "00:15".to_string();
    ctx.engine.set_backup_schedule(hourly).await.unwrap();

    let schedules = ctx.engine.list_schedules(Some("p1")).await;
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].frequency, ScheduleFrequency::Hourly);
    assert_eq!(schedules[0].created_at, at(1, 0, 0));
}

#[tokio::test]
async fn test_scheduled_backups_expire_after_retention() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    let mut schedule = daily("p1");
    schedule.retention = 3;
    ctx.engine.set_backup_schedule(schedule).await.unwrap();

    let started = ctx.engine.run_due_schedules(at(1, 2, 0)).await;
    let backup = ctx.backup_completed(&started[0].backup_id).await;
    let completed = backup.completed_at.unwrap();
    assert_eq!(backup.expires_at, Some(completed + chrono::Duration::days(3)));

    assert_eq!(ctx.engine.cleanup_expired(completed).await, 0);
    assert_eq!(
        ctx.engine
            .cleanup_expired(completed + chrono::Duration::days(4))
            .await,
        1
    );
    assert!(matches!(
        ctx.engine.get_backup_info(&backup.backup_id).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_manual_backup_retention_is_in_days() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let mut request = BackupConfig::new("p1", BackupType::Database);
    request.retention = 7;
    let backup = ctx.engine.create_backup(request).await.unwrap();
    let backup = ctx.backup_completed(&backup.backup_id).await;

    assert_eq!(backup.status, BackupStatus::Completed);
    assert!(!backup.scheduled);
    assert_eq!(
        backup.expires_at,
        Some(backup.completed_at.unwrap() + chrono::Duration::days(7))
    );
}
