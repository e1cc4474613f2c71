// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for stackforge-provisioner.
//!
//! [`ProvisionerRuntime`] wires the orchestrator, the backup engine and the
//! quota manager together and runs their background workers inside an
//! existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stackforge_provisioner::adapter::{DockerAdapter, DockerAdapterConfig};
//! use stackforge_provisioner::runtime::ProvisionerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ProvisionerRuntime::builder()
//!         .adapter(Arc::new(DockerAdapter::new(DockerAdapterConfig::from_env())))
//!         .data_dir("/var/lib/stackforge")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let projects = runtime.orchestrator().list_projects().await;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapter::RuntimeAdapter;
use crate::backup::artifact::ArtifactKey;
use crate::backup::{
    BackupCatalog, BackupEngine, BackupEngineConfig, BackupScheduler, BackupSchedulerConfig,
    BackupStorage, LocalBackupStorage, RetentionWorker, RetentionWorkerConfig,
};
use crate::config::Config;
use crate::health_monitor::{HealthMonitor, HealthMonitorConfig};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::persistence::{MemoryProjectStore, ProjectStore};
use crate::quota::{QuotaManager, QuotaSettings, QuotaWorker, QuotaWorkerConfig, RuntimeUsageSource};
use crate::registry::ProjectRegistry;
use crate::tasks::TaskSupervisor;
use crate::template::TemplateContext;

/// Builder for [`ProvisionerRuntime`].
pub struct ProvisionerRuntimeBuilder {
    adapter: Option<Arc<dyn RuntimeAdapter>>,
    store: Option<Arc<dyn ProjectStore>>,
    remote_storage: Option<Arc<dyn BackupStorage>>,
    data_dir: PathBuf,
    template: TemplateContext,
    base_db_port: u16,
    base_api_port: u16,
    quota_settings: QuotaSettings,
    encryption_secret: Option<String>,
    download_base: Option<(String, String)>,
    probe_timeout: Duration,
    max_concurrent_operations: usize,
    shutdown_grace: Duration,
    health: HealthMonitorConfig,
    quota_worker: QuotaWorkerConfig,
    scheduler: BackupSchedulerConfig,
    retention: RetentionWorkerConfig,
}

impl Default for ProvisionerRuntimeBuilder {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        Self {
            adapter: None,
            store: None,
            remote_storage: None,
            data_dir: PathBuf::from(".data"),
            template: orchestrator.template,
            base_db_port: orchestrator.base_db_port,
            base_api_port: orchestrator.base_api_port,
            quota_settings: QuotaSettings::default(),
            encryption_secret: None,
            download_base: None,
            probe_timeout: orchestrator.probe_timeout,
            max_concurrent_operations: 16,
            shutdown_grace: Duration::from_secs(30),
            health: HealthMonitorConfig::default(),
            quota_worker: QuotaWorkerConfig::default(),
            scheduler: BackupSchedulerConfig::default(),
            retention: RetentionWorkerConfig::default(),
        }
    }
}

impl ProvisionerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every setting from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.data_dir = config.data_dir.clone();
        self.template = config.template.clone();
        self.base_db_port = config.base_db_port;
        self.base_api_port = config.base_api_port;
        self.quota_settings.default_plan = config.default_plan;
        self.quota_settings.enforcement.pause_project = config.pause_over_quota;
        self.quota_settings.grace_period = config.quota_grace_period;
        self.encryption_secret = config.backup_encryption_secret.clone();
        self.download_base = match (
            &config.backup_download_base_url,
            &config.download_signing_secret,
        ) {
            (Some(url), Some(secret)) => Some((url.clone(), secret.clone())),
            (Some(_), None) => {
                warn!("BACKUP_DOWNLOAD_BASE_URL is set without ENCRYPTION_SECRET; using file URLs");
                None
            }
            _ => None,
        };
        self.probe_timeout = config.probe_timeout;
        self.max_concurrent_operations = config.max_concurrent_operations;
        self.shutdown_grace = config.shutdown_grace;
        self.health.poll_interval = config.health_check_interval;
        self.quota_worker.poll_interval = config.quota_update_interval;
        self.scheduler.poll_interval = config.backup_schedule_interval;
        self.retention.poll_interval = config.backup_retention_interval;
        self
    }

    /// Set the container runtime (required).
    pub fn adapter(mut self, adapter: Arc<dyn RuntimeAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Set the project record store (default: in-memory).
    pub fn store(mut self, store: Arc<dyn ProjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Keep a remote copy of every backup artifact.
    pub fn remote_storage(mut self, storage: Arc<dyn BackupStorage>) -> Self {
        self.remote_storage = Some(storage);
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the health sweep interval.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health.poll_interval = interval;
        self
    }

    /// Set the quota settings.
    pub fn quota_settings(mut self, settings: QuotaSettings) -> Self {
        self.quota_settings = settings;
        self
    }

    /// Set the probe deadline for starting projects.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<ProvisionerRuntimeConfig> {
        let adapter = self
            .adapter
            .ok_or_else(|| anyhow::anyhow!("runtime adapter is required"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryProjectStore::new()));

        Ok(ProvisionerRuntimeConfig {
            adapter,
            store,
            remote_storage: self.remote_storage,
            data_dir: self.data_dir,
            template: self.template,
            base_db_port: self.base_db_port,
            base_api_port: self.base_api_port,
            quota_settings: self.quota_settings,
            encryption_secret: self.encryption_secret,
            download_base: self.download_base,
            probe_timeout: self.probe_timeout,
            max_concurrent_operations: self.max_concurrent_operations,
            shutdown_grace: self.shutdown_grace,
            health: self.health,
            quota_worker: self.quota_worker,
            scheduler: self.scheduler,
            retention: self.retention,
        })
    }
}

/// Validated runtime configuration.
pub struct ProvisionerRuntimeConfig {
    adapter: Arc<dyn RuntimeAdapter>,
    store: Arc<dyn ProjectStore>,
    remote_storage: Option<Arc<dyn BackupStorage>>,
    data_dir: PathBuf,
    template: TemplateContext,
    base_db_port: u16,
    base_api_port: u16,
    quota_settings: QuotaSettings,
    encryption_secret: Option<String>,
    download_base: Option<(String, String)>,
    probe_timeout: Duration,
    max_concurrent_operations: usize,
    shutdown_grace: Duration,
    health: HealthMonitorConfig,
    quota_worker: QuotaWorkerConfig,
    scheduler: BackupSchedulerConfig,
    retention: RetentionWorkerConfig,
}

impl ProvisionerRuntimeConfig {
    /// Recover persisted state and start the background workers.
    pub async fn start(self) -> Result<ProvisionerRuntime> {
        info!(
            adapter = self.adapter.adapter_type(),
            data_dir = %self.data_dir.display(),
            max_concurrent_operations = self.max_concurrent_operations,
            "Starting ProvisionerRuntime"
        );

        let projects_dir = self.data_dir.join("projects");
        let backups_dir = self.data_dir.join("backups");
        let artifacts_dir = backups_dir.join("artifacts");
        let work_dir = backups_dir.join("tmp");
        for dir in [&projects_dir, &artifacts_dir, &work_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        if let Err(e) = self.adapter.ping().await {
            warn!(error = %e, "Container runtime is not reachable; operations will retry");
        }

        let registry = Arc::new(ProjectRegistry::new());
        let quotas = Arc::new(QuotaManager::new(self.quota_settings));
        let tasks = TaskSupervisor::new(self.max_concurrent_operations);
        let catalog = Arc::new(BackupCatalog::open(backups_dir.join("catalog.json")).await?);

        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            self.adapter.clone(),
            self.store,
            quotas.clone(),
            tasks.clone(),
            OrchestratorConfig {
                template: self.template,
                projects_dir: Some(projects_dir),
                base_db_port: self.base_db_port,
                base_api_port: self.base_api_port,
                probe_timeout: self.probe_timeout,
                ..OrchestratorConfig::default()
            },
        ));

        quotas.attach_usage_source(Arc::new(RuntimeUsageSource::new(
            registry,
            self.adapter,
            catalog.clone(),
        )));

        let mut local = LocalBackupStorage::new(artifacts_dir);
        if let Some((url, secret)) = &self.download_base {
            local = local.with_download_base(url.as_str(), secret.as_bytes());
        }

        let mut engine = BackupEngine::new(
            orchestrator.clone(),
            catalog,
            Arc::new(local),
            BackupEngineConfig {
                work_dir,
                encryption_key: self.encryption_secret.as_deref().map(ArtifactKey::from_secret),
                ..BackupEngineConfig::default()
            },
        );
        if let Some(remote) = self.remote_storage {
            engine = engine.with_remote(remote);
        }
        let engine = Arc::new(engine);

        match orchestrator.recover().await {
            Ok(recovered) => info!(recovered, "Projects recovered"),
            Err(e) => warn!(error = %e, "Failed to recover projects"),
        }
        match engine.recover().await {
            Ok(interrupted) => info!(
                backups = interrupted.backups.len(),
                restores = interrupted.restores.len(),
                "Interrupted backup operations marked failed"
            ),
            Err(e) => warn!(error = %e, "Failed to recover backup catalog"),
        }

        let health_monitor = HealthMonitor::new(orchestrator.clone(), self.health);
        let health_shutdown = health_monitor.shutdown_handle();
        let health_handle = tokio::spawn(async move { health_monitor.run().await });

        let quota_worker = QuotaWorker::new(orchestrator.clone(), self.quota_worker);
        let quota_shutdown = quota_worker.shutdown_handle();
        let quota_handle = tokio::spawn(async move { quota_worker.run().await });

        let scheduler = BackupScheduler::new(engine.clone(), self.scheduler);
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

        let retention = RetentionWorker::new(engine.clone(), self.retention);
        let retention_shutdown = retention.shutdown_handle();
        let retention_handle = tokio::spawn(async move { retention.run().await });

        info!("ProvisionerRuntime started");

        Ok(ProvisionerRuntime {
            orchestrator,
            engine,
            quotas,
            tasks,
            shutdown_grace: self.shutdown_grace,
            workers: vec![
                Worker::new("Health monitor", health_shutdown, health_handle),
                Worker::new("Quota worker", quota_shutdown, quota_handle),
                Worker::new("Backup scheduler", scheduler_shutdown, scheduler_handle),
                Worker::new("Retention worker", retention_shutdown, retention_handle),
            ],
        })
    }
}

struct Worker {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn new(name: &'static str, shutdown: Arc<Notify>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            handle,
        }
    }
}

/// A running provisioner.
pub struct ProvisionerRuntime {
    orchestrator: Arc<Orchestrator>,
    engine: Arc<BackupEngine>,
    quotas: Arc<QuotaManager>,
    tasks: TaskSupervisor,
    shutdown_grace: Duration,
    workers: Vec<Worker>,
}

impl ProvisionerRuntime {
    /// Create a new builder.
    pub fn builder() -> ProvisionerRuntimeBuilder {
        ProvisionerRuntimeBuilder::new()
    }

    /// Lifecycle operations.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Backup and restore operations.
    pub fn backups(&self) -> &Arc<BackupEngine> {
        &self.engine
    }

    /// Quota operations.
    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    /// Stop the workers, then wait up to the shutdown grace for running
    /// operations to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("ProvisionerRuntime shutting down...");

        for worker in &self.workers {
            worker.shutdown.notify_one();
        }
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!("{} task panicked: {}", worker.name, e);
            }
        }

        if !self.tasks.shutdown(self.shutdown_grace).await {
            warn!("Some operations were still running at shutdown");
        }

        info!("ProvisionerRuntime shutdown complete");
        Ok(())
    }

    /// Check if every background worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|w| !w.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::quota::QuotaPlan;

    #[test]
    fn test_builder_default_values() {
        let builder = ProvisionerRuntimeBuilder::new();
        assert_eq!(builder.data_dir, PathBuf::from(".data"));
        assert_eq!(builder.base_db_port, 5433);
        assert_eq!(builder.max_concurrent_operations, 16);
        assert!(builder.adapter.is_none());
    }

    #[test]
    fn test_build_requires_adapter() {
        assert!(ProvisionerRuntimeBuilder::new().build().is_err());
    }

    #[test]
    fn test_builder_takes_config() {
        let mut config = Config::from_env().unwrap();
        config.default_plan = QuotaPlan::Pro;
        config.pause_over_quota = true;
        config.backup_download_base_url = Some("https://dl.example".to_string());
        config.download_signing_secret = None;
        config.health_check_interval = Duration::from_secs(5);

        let builder = ProvisionerRuntimeBuilder::new().config(&config);
        assert_eq!(builder.quota_settings.default_plan, QuotaPlan::Pro);
        assert!(builder.quota_settings.enforcement.pause_project);
        assert!(builder.download_base.is_none());
        assert_eq!(builder.health.poll_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProvisionerRuntime::builder()
            .adapter(Arc::new(MockAdapter::new()))
            .data_dir(dir.path())
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        assert!(dir.path().join("backups/artifacts").is_dir());
        assert!(runtime.orchestrator().list_projects().await.is_empty());

        runtime.shutdown().await.unwrap();
    }
}
