// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the project lifecycle against the mock runtime.

mod common;

use std::time::Duration;

use common::{TestContext, project_config};
use stackforge_provisioner::error::{Error, ResourceKind};
use stackforge_provisioner::lifecycle::ProjectStatus;

#[tokio::test]
async fn test_create_reaches_active_healthy() {
    let ctx = TestContext::new();
    let accepted = ctx
        .orchestrator
        .create_project(project_config("p1", 5433, 54321))
        .await
        .unwrap();
    assert_eq!(accepted.status, ProjectStatus::Creating);
    assert_eq!(accepted.endpoint, "http://localhost:54321");

    let info = ctx.settled("p1").await;
    assert_eq!(info.status, ProjectStatus::ActiveHealthy);
    assert_eq!(info.containers.len(), 7);
    assert!(info.health_checks.values().all(|ok| *ok));
    assert_eq!(ctx.adapter.running_services("p1").await.len(), 7);
    assert_eq!(ctx.store.status("p1").await.as_deref(), Some("ACTIVE_HEALTHY"));
    assert!(ctx.temp_dir.path().join("projects/p1/project.json").exists());
}

#[tokio::test]
async fn test_duplicate_create_conflicts_and_keeps_record() {
    let ctx = TestContext::new();
    let before = ctx.create_active("p1", 5433, 54321).await;

    let err = ctx
        .orchestrator
        .create_project(project_config("p1", 5434, 54323))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "{err:?}");

    let after = ctx.orchestrator.get_project_info("p1").await.unwrap();
    assert_eq!(after.status, ProjectStatus::ActiveHealthy);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.containers, before.containers);
}

#[tokio::test]
async fn test_duplicate_create_while_creating_conflicts_at_once() {
    let ctx = TestContext::new();
    ctx.adapter.set_unhealthy("p1", "rest", true).await;
    ctx.orchestrator
        .create_project(project_config("p1", 5433, 54321))
        .await
        .unwrap();

    let duplicate = tokio::time::timeout(
        Duration::from_millis(150),
        ctx.orchestrator
            .create_project(project_config("p1", 5434, 54323)),
    )
    .await
    .expect("duplicate create waited for provisioning");
    assert!(matches!(duplicate, Err(Error::Conflict { .. })), "{duplicate:?}");

    // Provisioning times out; the original record is what fails.
    let info = ctx.settled("p1").await;
    assert_eq!(info.status, ProjectStatus::Failed);
    assert_eq!(info.endpoint, "http://localhost:54321");
    let slot = ctx.orchestrator.slot("p1").await.unwrap();
    assert_eq!(slot.read().await.config.db_port, 5433);
}

#[tokio::test]
async fn test_concurrent_creates_register_once() {
    let ctx = TestContext::new();
    let (first, second) = tokio::join!(
        ctx.orchestrator
            .create_project(project_config("p1", 5433, 54321)),
        ctx.orchestrator
            .create_project(project_config("p1", 5434, 54323)),
    );
    assert_eq!(
        [&first, &second].iter().filter(|r| r.is_ok()).count(),
        1,
        "{first:?} {second:?}"
    );
    assert!(
        [&first, &second]
            .iter()
            .any(|r| matches!(r, Err(Error::Conflict { .. })))
    );
    assert_eq!(ctx.settled("p1").await.status, ProjectStatus::ActiveHealthy);
    assert_eq!(ctx.adapter.running_services("p1").await.len(), 7);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_any_runtime_call() {
    let ctx = TestContext::new();
    let err = ctx
        .orchestrator
        .create_project(project_config("Not Valid", 5433, 54321))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert_eq!(ctx.adapter.call_count().await, 0);
    assert!(ctx.orchestrator.list_projects().await.is_empty());
}

#[tokio::test]
async fn test_failed_provisioning_rolls_back() {
    let ctx = TestContext::new();
    ctx.adapter.fail_operation("create_container", Some("rest")).await;

    ctx.orchestrator
        .create_project(project_config("p1", 5433, 54321))
        .await
        .unwrap();
    let info = ctx.settled("p1").await;

    assert_eq!(info.status, ProjectStatus::Failed);
    assert!(info.containers.is_empty());
    assert!(info.error_message.is_some());
    assert_eq!(ctx.adapter.resource_count("p1").await, 0);
    assert_eq!(ctx.store.status("p1").await.as_deref(), Some("FAILED"));
}

#[tokio::test]
async fn test_failed_project_can_be_created_again() {
    let ctx = TestContext::new();
    ctx.adapter.fail_operation("create_container", Some("rest")).await;
    ctx.orchestrator
        .create_project(project_config("p1", 5433, 54321))
        .await
        .unwrap();
    assert_eq!(ctx.settled("p1").await.status, ProjectStatus::Failed);

    ctx.adapter.clear_failures().await;
    ctx.create_active("p1", 5433, 54321).await;
}

#[tokio::test]
async fn test_probe_timeout_fails_creation() {
    let ctx = TestContext::new();
    ctx.adapter.set_unhealthy("p1", "auth", true).await;

    ctx.orchestrator
        .create_project(project_config("p1", 5433, 54321))
        .await
        .unwrap();
    let info = ctx.settled("p1").await;

    assert_eq!(info.status, ProjectStatus::Failed);
    assert_eq!(ctx.adapter.resource_count("p1").await, 0);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let paused = ctx.orchestrator.pause_project("p1").await.unwrap();
    assert_eq!(paused.status, ProjectStatus::Paused);
    assert!(ctx.adapter.running_services("p1").await.is_empty());
    assert_eq!(ctx.store.status("p1").await.as_deref(), Some("PAUSED"));

    let calls = ctx.adapter.call_count().await;
    let again = ctx.orchestrator.pause_project("p1").await.unwrap();
    assert_eq!(again.status, ProjectStatus::Paused);
    assert_eq!(ctx.adapter.call_count().await, calls);

    let resumed = ctx.orchestrator.resume_project("p1").await.unwrap();
    assert_eq!(resumed.status, ProjectStatus::Creating);
    let info = ctx.settled("p1").await;
    assert_eq!(info.status, ProjectStatus::ActiveHealthy);
    assert_eq!(ctx.adapter.running_services("p1").await.len(), 7);
}

#[tokio::test]
async fn test_resume_with_failing_probe_ends_unhealthy() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.orchestrator.pause_project("p1").await.unwrap();

    ctx.adapter.set_unhealthy("p1", "realtime", true).await;
    ctx.orchestrator.resume_project("p1").await.unwrap();
    let info = ctx.settled("p1").await;

    assert_eq!(info.status, ProjectStatus::ActiveUnhealthy);
    assert_eq!(info.health_checks.get("realtime"), Some(&false));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    ctx.orchestrator.delete_project("p1").await.unwrap();
    assert_eq!(ctx.adapter.resource_count("p1").await, 0);
    assert!(!ctx.temp_dir.path().join("projects/p1").exists());
    let err = ctx.orchestrator.get_project_info("p1").await.unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound {
            kind: ResourceKind::Project,
            ..
        }
    ));

    ctx.orchestrator.delete_project("p1").await.unwrap();
    ctx.orchestrator.delete_project("never-existed").await.unwrap();
}

#[tokio::test]
async fn test_update_recreates_only_changed_services() {
    let ctx = TestContext::new();
    let before = ctx.create_active("p1", 5433, 54321).await;

    let mut config = project_config("p1", 5433, 54321);
    config.anon_key = "rotated-anon-key".to_string();
    let after = ctx.orchestrator.update_project("p1", config).await.unwrap();

    assert_eq!(after.status, ProjectStatus::ActiveHealthy);
    assert_eq!(after.containers.get("db"), before.containers.get("db"));
    assert_eq!(after.containers.get("auth"), before.containers.get("auth"));
    assert_ne!(after.containers.get("kong"), before.containers.get("kong"));
    assert_ne!(after.containers.get("storage"), before.containers.get("storage"));
    assert_eq!(ctx.adapter.running_services("p1").await.len(), 7);
}

#[tokio::test]
async fn test_failed_update_keeps_project_unhealthy() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.adapter.fail_operation("create_container", Some("kong")).await;

    let mut config = project_config("p1", 5433, 54321);
    config.anon_key = "rotated-anon-key".to_string();
    let err = ctx.orchestrator.update_project("p1", config).await.unwrap_err();
    assert!(matches!(err, Error::Provisioning { .. }), "{err:?}");

    let info = ctx.orchestrator.get_project_info("p1").await.unwrap();
    assert_eq!(info.status, ProjectStatus::ActiveUnhealthy);
    assert!(!info.containers.contains_key("kong"));
    assert_eq!(info.health_checks.get("kong"), Some(&false));
    assert!(info.error_message.is_some());
    assert_eq!(ctx.store.status("p1").await.as_deref(), Some("ACTIVE_UNHEALTHY"));

    let saved = std::fs::read_to_string(ctx.temp_dir.path().join("projects/p1/project.json")).unwrap();
    assert!(saved.contains("rotated-anon-key"));
    assert!(saved.contains("ACTIVE_UNHEALTHY"));
}

#[tokio::test]
async fn test_update_rejects_immutable_fields() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let mut config = project_config("p1", 5433, 54321);
    config.db_password = "changed".to_string();
    let err = ctx.orchestrator.update_project("p1", config).await.unwrap_err();
    assert!(
        matches!(err, Error::ImmutableField { field: "db_password", .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_update_requires_active_project() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.orchestrator.pause_project("p1").await.unwrap();

    let err = ctx
        .orchestrator
        .update_project("p1", project_config("p1", 5433, 54321))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            status: ProjectStatus::Paused,
            ..
        }
    ));
}

#[tokio::test]
async fn test_logs_and_commands() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let logs = ctx
        .orchestrator
        .get_logs("p1", "rest", 2, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(logs.lines().count(), 2);

    let command = vec!["echo".to_string(), "hello".to_string()];
    let output = ctx
        .orchestrator
        .execute_command("p1", "db", &command, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "echo hello\n");

    let err = ctx
        .orchestrator
        .get_logs("p1", "nope", 10, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound { .. }));
}

#[tokio::test]
async fn test_logs_of_paused_project_are_unavailable() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.orchestrator.pause_project("p1").await.unwrap();

    let err = ctx
        .orchestrator
        .get_logs("p1", "rest", 10, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound { .. }));
}

#[tokio::test]
async fn test_transient_runtime_errors_are_retried() {
    let ctx = TestContext::new();
    ctx.adapter.fail_next_calls_unavailable(2).await;
    ctx.create_active("p1", 5433, 54321).await;
}

#[tokio::test]
async fn test_projects_are_isolated() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.create_active("p2", 5434, 54323).await;

    ctx.orchestrator.delete_project("p1").await.unwrap();
    assert_eq!(ctx.adapter.resource_count("p1").await, 0);
    assert_eq!(ctx.adapter.running_services("p2").await.len(), 7);
    assert_eq!(
        ctx.orchestrator.get_project_info("p2").await.unwrap().status,
        ProjectStatus::ActiveHealthy
    );
}

#[tokio::test]
async fn test_delete_racing_pause_leaves_nothing_behind() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;

    let (deleted, paused) = tokio::join!(
        ctx.orchestrator.delete_project("p1"),
        ctx.orchestrator.pause_project("p1"),
    );
    deleted.unwrap();
    match paused {
        Ok(info) => assert_eq!(info.status, ProjectStatus::Paused),
        Err(e) => assert!(matches!(e, Error::NotFound { .. }), "{e:?}"),
    }
    assert!(ctx.orchestrator.get_project_info("p1").await.is_err());
    assert_eq!(ctx.adapter.resource_count("p1").await, 0);
}

#[tokio::test]
async fn test_delete_racing_resume_leaves_nothing_behind() {
    let ctx = TestContext::new();
    ctx.create_active("p1", 5433, 54321).await;
    ctx.orchestrator.pause_project("p1").await.unwrap();

    let (resumed, deleted) = tokio::join!(
        ctx.orchestrator.resume_project("p1"),
        ctx.orchestrator.delete_project("p1"),
    );
    deleted.unwrap();
    match resumed {
        Ok(info) => assert_eq!(info.status, ProjectStatus::Creating),
        Err(e) => assert!(matches!(e, Error::NotFound { .. }), "{e:?}"),
    }
    assert!(ctx.orchestrator.get_project_info("p1").await.is_err());
    assert_eq!(ctx.adapter.resource_count("p1").await, 0);
    assert!(ctx.adapter.running_services("p1").await.is_empty());
}
