// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for quota authorization, measurement and enforcement.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{TestContext, project_config};
use stackforge_provisioner::backup::{BackupConfig, BackupType};
use stackforge_provisioner::error::Error;
use stackforge_provisioner::lifecycle::ProjectStatus;
use stackforge_provisioner::quota::{
    QuotaOperation, QuotaPlan, QuotaResource, QuotaSettings, QuotaWorker, QuotaWorkerConfig,
    RuntimeUsageSource, StaticUsageSource, UsageSample,
};

const MB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_limits_above_plan_are_rejected() {
    let ctx = TestContext::new();
    let mut config = project_config("p1", 5433, 54321);
    config.limits.cpu_millicores = 4_000;

    let err = ctx.orchestrator.create_project(config).await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::QuotaExceeded {
                resource: QuotaResource::Cpu,
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(ctx.adapter.call_count().await, 0);

    let mut config = project_config("p1", 5433, 54321);
    config.limits.cpu_millicores = 4_000;
    config.plan = Some(QuotaPlan::Enterprise);
    ctx.orchestrator.create_project(config).await.unwrap();
    assert_eq!(ctx.settled("p1").await.status, ProjectStatus::ActiveHealthy);
}

#[tokio::test]
async fn test_runtime_usage_is_measured() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.adapter.seed_database("p1", "SELECT 1;\n").await;
    ctx.adapter.put_file("p1", "a.txt", b"12345").await;
    ctx.adapter.put_file("p1", "b.txt", b"678").await;
    ctx.adapter.set_db_metrics("p1", 4, 2, 1).await;

    let backup = ctx
        .engine
        .create_backup(BackupConfig::new("p1", BackupType::Database))
        .await
        .unwrap();
    let backup = ctx.backup_completed(&backup.backup_id).await;

    ctx.quotas.attach_usage_source(Arc::new(RuntimeUsageSource::new(
        ctx.orchestrator.registry().clone(),
        ctx.adapter.clone(),
        ctx.engine.catalog().clone(),
    )));
    let usage = ctx.quotas.update_quota_usage("p1").await.unwrap();

    assert_eq!(usage.database_size, "SELECT 1;\n".len() as u64);
    assert_eq!(usage.storage_size, 8);
    assert_eq!(usage.user_count, 4);
    assert_eq!(usage.table_count, 2);
    assert_eq!(usage.connections, 1);
    assert_eq!(usage.backup_count, 1);
    assert_eq!(usage.backup_size, backup.size);
    assert_eq!(usage.memory, 7 * 64 * MB);
    assert_eq!(
        usage.total_disk_size,
        usage.database_size + usage.storage_size + usage.backup_size
    );
    assert!(usage.measured_at.is_some());

    let status = ctx.quotas.get_quota_status("p1").await.unwrap();
    assert!(!status.exceeded);
    assert_eq!(status.plan, QuotaPlan::Free);
}

#[tokio::test]
async fn test_backup_blocked_over_backup_count() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.quotas
        .record_usage(
            "p1",
            UsageSample {
                backup_count: 3,
                ..UsageSample::default()
            },
        )
        .await
        .unwrap();

    let err = ctx
        .engine
        .create_backup(BackupConfig::new("p1", BackupType::Database))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::QuotaExceeded {
                resource: QuotaResource::Backups,
                limit: 3,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(ctx.engine.list_backups(Some("p1")).await.is_empty());
}

#[tokio::test]
async fn test_upload_gate_warns_then_blocks() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.quotas
        .record_usage(
            "p1",
            UsageSample {
                storage_size: 900 * MB,
                ..UsageSample::default()
            },
        )
        .await
        .unwrap();

    let decision = ctx
        .quotas
        .enforce_quotas("p1", QuotaOperation::Upload, MB)
        .await
        .unwrap();
    assert!(decision.has_warnings());

    let err = ctx
        .quotas
        .enforce_quotas("p1", QuotaOperation::Upload, 200 * MB)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));
}

#[tokio::test]
async fn test_worker_pauses_projects_over_grace_period() {
    let mut settings = QuotaSettings::default();
    settings.enforcement.pause_project = true;
    settings.grace_period = Duration::ZERO;
    let ctx = TestContext::with_settings(settings);
    ctx.create_active("p1", 5433, 54321).await;
    ctx.create_active("p2", 5434, 54323).await;

    let source = Arc::new(StaticUsageSource::new());
    source
        .set(
            "p1",
            UsageSample {
                database_size: 600 * MB,
                ..UsageSample::default()
            },
        )
        .await;
    ctx.quotas.attach_usage_source(source);

    let worker = QuotaWorker::new(ctx.orchestrator.clone(), QuotaWorkerConfig::default());
    let paused = worker.tick(Utc::now() + chrono::Duration::seconds(1)).await;

    assert_eq!(paused, vec!["p1".to_string()]);
    assert_eq!(
        ctx.orchestrator.get_project_info("p1").await.unwrap().status,
        ProjectStatus::Paused
    );
    assert_eq!(
        ctx.orchestrator.get_project_info("p2").await.unwrap().status,
        ProjectStatus::ActiveHealthy
    );
    assert!(ctx.quotas.get_quota_status("p1").await.unwrap().exceeded);
}

#[tokio::test]
async fn test_worker_only_measures_without_pause_enforcement() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let source = Arc::new(StaticUsageSource::new());
    source
        .set(
            "p1",
            UsageSample {
                database_size: 600 * MB,
                ..UsageSample::default()
            },
        )
        .await;
    ctx.quotas.attach_usage_source(source);

    let worker = QuotaWorker::new(ctx.orchestrator.clone(), QuotaWorkerConfig::default());
    assert!(worker.tick(Utc::now() + chrono::Duration::days(2)).await.is_empty());
    assert_eq!(ctx.quotas.get_usage("p1").await.unwrap().database_size, 600 * MB);
    assert_eq!(
        ctx.orchestrator.get_project_info("p1").await.unwrap().status,
        ProjectStatus::ActiveHealthy
    );
}

#[tokio::test]
async fn test_deleted_project_stops_being_tracked() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    assert_eq!(ctx.quotas.project_ids().await, vec!["p1".to_string()]);

    ctx.orchestrator.delete_project("p1").await.unwrap();
    assert!(ctx.quotas.project_ids().await.is_empty());
    assert!(matches!(
        ctx.quotas.get_quotas("p1").await,
        Err(Error::NotFound { .. })
    ));
}
