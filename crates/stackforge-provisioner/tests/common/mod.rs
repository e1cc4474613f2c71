// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stackforge-provisioner integration tests.
//!
//! Provides TestContext wiring an orchestrator and a backup engine over the
//! mock runtime adapter, an in-memory project store and a temp directory.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stackforge_provisioner::adapter::MockAdapter;
use stackforge_provisioner::backup::artifact::ArtifactKey;
use stackforge_provisioner::backup::{
    BackupCatalog, BackupEngine, BackupEngineConfig, BackupInfo, BackupStatus, LocalBackupStorage,
    RestoreInfo,
};
use stackforge_provisioner::lifecycle::ProjectStatus;
use stackforge_provisioner::orchestrator::{Orchestrator, OrchestratorConfig};
use stackforge_provisioner::persistence::MemoryProjectStore;
use stackforge_provisioner::project::{ProjectConfig, ProjectInfo, ResourceLimits};
use stackforge_provisioner::quota::{QuotaManager, QuotaSettings};
use stackforge_provisioner::registry::ProjectRegistry;
use stackforge_provisioner::retry::RetryPolicy;
use stackforge_provisioner::tasks::TaskSupervisor;

pub const ENCRYPTION_SECRET: &str = "integration-test-backup-secret";

/// Orchestrator and backup engine over the mock runtime.
pub struct TestContext {
    pub adapter: Arc<MockAdapter>,
    pub store: Arc<MemoryProjectStore>,
    pub quotas: Arc<QuotaManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<BackupEngine>,
    pub temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context with default quota settings.
    pub fn new() -> Self {
        Self::with_settings(QuotaSettings::default())
    }

    /// Context with the given quota settings.
    pub fn with_settings(settings: QuotaSettings) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let adapter = Arc::new(MockAdapter::new());
        let store = Arc::new(MemoryProjectStore::new());
        let quotas = Arc::new(QuotaManager::new(settings));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(ProjectRegistry::new()),
            adapter.clone(),
            store.clone(),
            quotas.clone(),
            TaskSupervisor::new(8),
            OrchestratorConfig {
                projects_dir: Some(temp_dir.path().join("projects")),
                probe_timeout: Duration::from_millis(300),
                probe_interval: Duration::from_millis(10),
                operation_timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    max_retries: 2,
                    delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
                ..OrchestratorConfig::default()
            },
        ));

        let engine = Arc::new(BackupEngine::new(
            orchestrator.clone(),
            Arc::new(BackupCatalog::in_memory()),
            Arc::new(LocalBackupStorage::new(temp_dir.path().join("artifacts"))),
            BackupEngineConfig {
                work_dir: temp_dir.path().join("tmp"),
                encryption_key: Some(ArtifactKey::from_secret(ENCRYPTION_SECRET)),
                exec_timeout: Duration::from_secs(5),
            },
        ));

        Self {
            adapter,
            store,
            quotas,
            orchestrator,
            engine,
            temp_dir,
        }
    }

    /// Create a project and wait for it to leave `CREATING`.
    pub async fn create_active(&self, project_id: &str, db_port: u16, api_port: u16) -> ProjectInfo {
        self.orchestrator
            .create_project(project_config(project_id, db_port, api_port))
            .await
            .expect("create_project failed");
        let info = self.settled(project_id).await;
        assert_eq!(info.status, ProjectStatus::ActiveHealthy, "{info:?}");
        info
    }

    /// Wait until a project is out of `CREATING`.
    pub async fn settled(&self, project_id: &str) -> ProjectInfo {
        wait_for(move || async move {
            let info = self.orchestrator.get_project_info(project_id).await.ok()?;
            (info.status != ProjectStatus::Creating).then_some(info)
        })
        .await
        .unwrap_or_else(|| panic!("project {project_id} did not settle"))
    }

    /// Wait until a project has the given status.
    pub async fn wait_for_status(&self, project_id: &str, status: ProjectStatus) -> ProjectInfo {
        wait_for(move || async move {
            let info = self.orchestrator.get_project_info(project_id).await.ok()?;
            (info.status == status).then_some(info)
        })
        .await
        .unwrap_or_else(|| panic!("project {project_id} never reached {status}"))
    }

    /// Wait until a backup is terminal.
    pub async fn backup_done(&self, backup_id: &str) -> BackupInfo {
        wait_for(move || async move {
            let info = self.engine.get_backup_info(backup_id).await.ok()?;
            info.status.is_terminal().then_some(info)
        })
        .await
        .unwrap_or_else(|| panic!("backup {backup_id} did not finish"))
    }

    /// Wait until a backup is terminal and assert it completed.
    pub async fn backup_completed(&self, backup_id: &str) -> BackupInfo {
        let info = self.backup_done(backup_id).await;
        assert_eq!(info.status, BackupStatus::Completed, "{info:?}");
        info
    }

    /// Wait until a restore is terminal.
    pub async fn restore_done(&self, restore_id: &str) -> RestoreInfo {
        wait_for(move || async move {
            let info = self.engine.get_restore_info(restore_id).await.ok()?;
            info.status.is_terminal().then_some(info)
        })
        .await
        .unwrap_or_else(|| panic!("restore {restore_id} did not finish"))
    }
}

/// Poll `check` every 10ms for up to 5s.
pub async fn wait_for<F, Fut, T>(mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..500 {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// A valid project config without a dashboard.
pub fn project_config(project_id: &str, db_port: u16, api_port: u16) -> ProjectConfig {
    ProjectConfig {
        project_id: project_id.to_string(),
        project_name: format!("{project_id} project"),
        organization_id: "org-1".to_string(),
        region: "local".to_string(),
        db_password: "postgres-password".to_string(),
        db_port,
        api_port,
        studio_port: 0,
        jwt_secret: "super-secret-jwt-token-with-at-least-32-characters".to_string(),
        anon_key: "anon-key".to_string(),
        service_key: "service-key".to_string(),
        dashboard_user: "admin".to_string(),
        dashboard_pass: "admin".to_string(),
        limits: ResourceLimits::default(),
        plan: None,
        quotas: None,
    }
}
