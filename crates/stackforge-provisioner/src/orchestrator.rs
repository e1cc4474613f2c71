// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle orchestrator.
//!
//! The orchestrator is the only writer of project status. Every operation
//! follows the same shape:
//!
//! 1. take the project's [`ProjectLease`]
//! 2. plan the transition with [`next_status`] (illegal events fail here,
//!    before any side effect)
//! 3. perform the runtime side effects through the adapter
//! 4. commit the planned status, then sync it to the project store and the
//!    project file
//!
//! Provisioning and resume continue on the [`TaskSupervisor`] after the call
//! returns; callers poll [`Orchestrator::get_project_info`].

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::{ExecOutput, RuntimeAdapter, RuntimeError};
use crate::error::{Error, ResourceKind, Result};
use crate::lifecycle::{LifecycleEvent, ProjectStatus, next_status};
use crate::persistence::{NewProjectRecord, PersistenceError, ProjectStore};
use crate::project::{ProjectConfig, ProjectInfo};
use crate::quota::QuotaManager;
use crate::registry::{ProjectEntry, ProjectLease, ProjectRegistry, ProjectSlot};
use crate::retry::RetryPolicy;
use crate::tasks::TaskSupervisor;
use crate::template::{self, ProjectManifest, TemplateContext};

const PROJECT_FILE: &str = "project.json";

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Placement settings for rendering.
    pub template: TemplateContext,
    /// Directory holding one sub-directory per project (none = no files).
    pub projects_dir: Option<PathBuf>,
    /// First database host port handed out by [`Orchestrator::allocate_ports`].
    pub base_db_port: u16,
    /// First API host port handed out by [`Orchestrator::allocate_ports`].
    pub base_api_port: u16,
    /// How long a starting project may take to pass its probes.
    pub probe_timeout: Duration,
    /// Delay between probe rounds while a project starts.
    pub probe_interval: Duration,
    /// Deadline for one runtime call, retries included.
    pub operation_timeout: Duration,
    /// Backoff for an unreachable runtime.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            template: TemplateContext::default(),
            projects_dir: None,
            base_db_port: 5433,
            base_api_port: 54321,
            probe_timeout: Duration::from_secs(180),
            probe_interval: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Host ports for a new project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocation {
    /// Database port.
    pub db_port: u16,
    /// API gateway port.
    pub api_port: u16,
    /// Dashboard port.
    pub studio_port: u16,
}

/// Outcome of one health sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Projects probed.
    pub probed: usize,
    /// Projects skipped because another operation held them.
    pub busy: usize,
    /// Projects whose probing failed.
    pub failed: usize,
}

/// What is written to `{projects_dir}/{id}/project.json`.
#[derive(Debug, Serialize, Deserialize)]
struct ProjectFile {
    info: ProjectInfo,
    config: ProjectConfig,
    manifest: ProjectManifest,
}

/// Drives projects through their lifecycle.
pub struct Orchestrator {
    registry: Arc<ProjectRegistry>,
    adapter: Arc<dyn RuntimeAdapter>,
    store: Arc<dyn ProjectStore>,
    quotas: Arc<QuotaManager>,
    tasks: TaskSupervisor,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator over an injected registry.
    pub fn new(
        registry: Arc<ProjectRegistry>,
        adapter: Arc<dyn RuntimeAdapter>,
        store: Arc<dyn ProjectStore>,
        quotas: Arc<QuotaManager>,
        tasks: TaskSupervisor,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            adapter,
            store,
            quotas,
            tasks,
            config,
        }
    }

    /// Project registry.
    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    /// Runtime adapter.
    pub fn adapter(&self) -> &Arc<dyn RuntimeAdapter> {
        &self.adapter
    }

    /// Quota manager.
    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    /// Task pool for long-running operations.
    pub fn tasks(&self) -> &TaskSupervisor {
        &self.tasks
    }

    /// Settings.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Register a project and start provisioning it.
    ///
    /// Returns the project in `CREATING`; provisioning continues in the
    /// background and ends in `ACTIVE_HEALTHY` or, after rollback, `FAILED`.
    pub async fn create_project(self: &Arc<Self>, config: ProjectConfig) -> Result<ProjectInfo> {
        config.validate()?;
        let project_id = config.project_id.clone();
        let (plan, quotas) = self.quotas.authorize_project(&config).await?;
        let manifest = template::render(&config, &self.config.template);

        // A FAILED project may be created again under the same id. Any other
        // status conflicts at once, without waiting on the operation lock.
        let previous = match self.registry.get(&project_id).await {
            Some(slot) => {
                if slot.status().await != ProjectStatus::Failed {
                    return Err(id_taken(project_id));
                }
                let lease = slot.lease().await;
                if lease.slot().is_removed() {
                    None
                } else {
                    let status = lease.read().await.info.status;
                    if status != ProjectStatus::Failed {
                        return Err(id_taken(project_id));
                    }
                    self.registry.remove(&lease).await;
                    Some(status)
                }
            }
            None => None,
        };
        let initial = next_status(previous, LifecycleEvent::Create).map_err(|source| {
            Error::IllegalTransition {
                project_id: project_id.clone(),
                source,
            }
        })?;

        let mut info = ProjectInfo::new(
            project_id.clone(),
            manifest.endpoint.clone(),
            manifest.db_endpoint.clone(),
        );
        info.status = initial;
        let slot = self
            .registry
            .register(ProjectEntry {
                info,
                config: config.clone(),
                manifest,
                persisted: None,
            })
            .await?;
        let lease = slot.lease().await;
        if slot.is_removed() {
            return Err(Error::not_found(ResourceKind::Project, project_id));
        }

        if let Err(e) = self.create_record(&config, initial).await {
            self.registry.remove(&lease).await;
            return Err(Error::provisioning(project_id, "create_project_record", e.into()));
        }
        lease.write().await.persisted = Some(initial);
        self.quotas.register_project(&project_id, plan, quotas).await;
        self.save_project_file(&lease).await;

        info!(project_id = %project_id, plan = %plan, "Project accepted, provisioning");
        let snapshot = lease.read().await.info.clone();

        let this = self.clone();
        let on_failure = {
            let this = self.clone();
            let project_id = project_id.clone();
            move |reason: String| async move { this.abort_provisioning(&project_id, reason).await }
        };
        self.tasks.spawn(
            "provision",
            project_id,
            async move { this.provision(lease).await },
            on_failure,
        );
        Ok(snapshot)
    }

    /// Snapshot of a project's fact sheet.
    pub async fn get_project_info(&self, project_id: &str) -> Result<ProjectInfo> {
        Ok(self.slot(project_id).await?.info().await)
    }

    /// Snapshot of every registered project, in id order.
    pub async fn list_projects(&self) -> Vec<ProjectInfo> {
        let mut projects = Vec::new();
        for slot in self.registry.list().await {
            projects.push(slot.info().await);
        }
        projects
    }

    /// Apply a new config to an active project, recreating only the
    /// services whose rendered definition changed.
    pub async fn update_project(&self, project_id: &str, config: ProjectConfig) -> Result<ProjectInfo> {
        config.validate()?;
        let lease = self.lease(project_id).await?;
        let (status, current_config, current_manifest, mut containers) = {
            let entry = lease.read().await;
            (
                entry.info.status,
                entry.config.clone(),
                entry.manifest.clone(),
                entry.info.containers.clone(),
            )
        };
        if !status.is_active() {
            return Err(Error::InvalidState {
                project_id: project_id.to_string(),
                status,
                operation: "update",
            });
        }
        if let Some(field) = template::immutable_change(&current_config, &config) {
            return Err(Error::ImmutableField {
                project_id: project_id.to_string(),
                field,
            });
        }
        self.plan(project_id, status, LifecycleEvent::Update)?;
        let (plan, quotas) = self.quotas.authorize_project(&config).await?;
        let desired = template::render(&config, &self.config.template);
        let changed = template::diff(&current_manifest, &desired);

        self.registry
            .replace_config(&lease, config, desired.clone())
            .await?;

        if let Err(e) = self
            .recreate_services(&lease, &desired, &changed, &mut containers)
            .await
        {
            // The new config is committed; services left without a container
            // fail their probes and keep the project unhealthy.
            error!(project_id, error = %e, "Update failed while recreating services");
            lease.write().await.info.error_message = Some(e.to_string());
            let healthy = self.probe_all(&lease).await.unwrap_or(false);
            if let Err(commit) = self.apply(&lease, probe_event(healthy)).await {
                error!(project_id, error = %commit, "Failed to commit status after failed update");
            }
            self.save_project_file(&lease).await;
            return Err(e);
        }
        {
            let mut entry = lease.write().await;
            entry.info.health_checks.retain(|name, _| desired.service(name).is_some());
            entry.info.updated_at = Utc::now();
        }
        self.quotas.set_quotas(project_id, quotas, Some(plan)).await?;
        info!(project_id, recreated = ?changed, "Project updated");

        let healthy = self.probe_all(&lease).await?;
        self.apply(&lease, probe_event(healthy)).await?;
        self.save_project_file(&lease).await;
        Ok(lease.read().await.info.clone())
    }

    /// Stop every container of an active project, keeping its volumes.
    /// Pausing a paused project does nothing.
    pub async fn pause_project(&self, project_id: &str) -> Result<ProjectInfo> {
        let lease = self.lease(project_id).await?;
        self.pause_with(&lease).await
    }

    /// Restart a paused project. Resuming an active project does nothing.
    ///
    /// Returns the project in `CREATING`; it becomes active once its probes
    /// have run.
    pub async fn resume_project(self: &Arc<Self>, project_id: &str) -> Result<ProjectInfo> {
        let lease = self.lease(project_id).await?;
        let status = lease.read().await.info.status;
        if status.is_active() {
            return Ok(lease.read().await.info.clone());
        }
        self.start_all(&lease).await?;
        let snapshot = lease.read().await.info.clone();

        let this = self.clone();
        let on_failure = {
            let this = self.clone();
            let project_id = project_id.to_string();
            move |reason: String| async move { this.abort_resume(&project_id, reason).await }
        };
        self.tasks.spawn(
            "resume",
            project_id.to_string(),
            async move {
                let timeout = this.config.probe_timeout;
                if let Err(e) = this.settle(&lease, timeout).await {
                    error!(project_id = %lease.project_id(), error = %e, "Failed to settle resumed project");
                }
            },
            on_failure,
        );
        Ok(snapshot)
    }

    /// Tear down a project and forget it. Deleting an unknown project
    /// succeeds.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let Some(slot) = self.registry.get(project_id).await else {
            debug!(project_id, "Delete of unregistered project");
            return Ok(());
        };
        let lease = slot.lease().await;
        if slot.is_removed() {
            return Ok(());
        }
        let status = lease.read().await.info.status;
        self.plan(project_id, status, LifecycleEvent::Delete)?;
        let _backup = slot.backup_lock().await;
        if status != ProjectStatus::Deleting {
            self.apply(&lease, LifecycleEvent::Delete).await?;
        }
        self.teardown(&lease).await
    }

    /// The last `tail` log lines of a running service.
    pub async fn get_logs(
        &self,
        project_id: &str,
        service: &str,
        tail: usize,
        timeout: Duration,
    ) -> Result<String> {
        let container_id = self.running_container(project_id, service).await?;
        let logs = tokio::time::timeout(timeout, self.adapter.logs(&container_id, tail))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("get_logs {project_id}/{service}"),
                elapsed: timeout,
            })?;
        logs.map_err(|e| service_error(project_id, service, e))
    }

    /// Run a command in a running service and capture its output.
    pub async fn execute_command(
        &self,
        project_id: &str,
        service: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        if command.is_empty() {
            return Err(Error::InvalidRequest("command is empty".into()));
        }
        let container_id = self.running_container(project_id, service).await?;
        let output = tokio::time::timeout(timeout, self.adapter.exec(&container_id, command, None))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("execute_command {project_id}/{service}"),
                elapsed: timeout,
            })?;
        output.map_err(|e| service_error(project_id, service, e))
    }

    /// Next free `(db, api, studio)` host ports from the configured bases.
    pub async fn allocate_ports(&self) -> Result<PortAllocation> {
        let used = self.registry.used_ports().await;
        for i in 0u16..1000 {
            let db_port = self.config.base_db_port.checked_add(i);
            let api_port = self.config.base_api_port.checked_add(2 * i);
            let (Some(db_port), Some(api_port)) = (db_port, api_port) else {
                break;
            };
            let Some(studio_port) = api_port.checked_add(1) else {
                break;
            };
            if [db_port, api_port, studio_port]
                .iter()
                .all(|p| !used.contains(p))
            {
                return Ok(PortAllocation {
                    db_port,
                    api_port,
                    studio_port,
                });
            }
        }
        Err(Error::InvalidRequest("no free host ports left".into()))
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Probe every active project and derive healthy or unhealthy.
    ///
    /// Projects held by another operation are skipped this round. A failure
    /// on one project never affects the others.
    pub async fn sweep_health(&self) -> SweepSummary {
        let slots = self.registry.list().await;
        let results = join_all(slots.iter().map(|slot| self.reconcile(slot))).await;
        let mut summary = SweepSummary::default();
        for (slot, result) in slots.iter().zip(results) {
            match result {
                Ok(true) => summary.probed += 1,
                Ok(false) => summary.busy += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(project_id = %slot.project_id(), error = %e, "Health check failed");
                }
            }
        }
        debug!(
            probed = summary.probed,
            busy = summary.busy,
            failed = summary.failed,
            "Health sweep finished"
        );
        summary
    }

    /// Returns false when the project was busy.
    async fn reconcile(&self, slot: &Arc<ProjectSlot>) -> Result<bool> {
        let Some(lease) = slot.try_lease() else {
            return Ok(false);
        };
        if slot.is_removed() {
            return Ok(true);
        }
        let (status, persisted) = {
            let entry = lease.read().await;
            (entry.info.status, entry.persisted)
        };
        if persisted != Some(status) {
            self.sync(&lease).await;
        }
        if !status.is_probed() {
            return Ok(true);
        }
        let healthy = self.probe_all(&lease).await?;
        self.apply(&lease, probe_event(healthy)).await?;
        self.refresh_stats(&lease).await;
        Ok(true)
    }

    /// Remove runtime resources of projects the registry does not know, and
    /// leftovers of failed projects.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let owners = self
            .call("*", "list_project_ids", || self.adapter.list_project_ids())
            .await?;
        let mut removed = 0;
        for project_id in owners {
            // Failed projects stay registered; hold their lease while cleaning.
            let mut held = None;
            if let Some(slot) = self.registry.get(&project_id).await {
                let Some(lease) = slot.try_lease() else {
                    continue;
                };
                if lease.read().await.info.status != ProjectStatus::Failed {
                    continue;
                }
                held = Some(lease);
            }
            match self.adapter.remove_project(&project_id).await {
                Ok(()) => {
                    removed += 1;
                    info!(project_id = %project_id, "Removed orphaned runtime resources");
                }
                Err(e) => warn!(project_id = %project_id, error = %e, "Failed to remove orphaned resources"),
            }
            drop(held);
        }
        Ok(removed)
    }

    /// Reload projects from their project files.
    ///
    /// Interrupted creates are rolled back to `FAILED`, interrupted deletes
    /// are finished, and projects that were restarting are probed again.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let Some(dir) = &self.config.projects_dir else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(PROJECT_FILE);
            let file: ProjectFile = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable project file");
                        continue;
                    }
                },
                Err(_) => continue,
            };
            if let Err(e) = self.recover_project(file).await {
                warn!(path = %path.display(), error = %e, "Failed to recover project");
                continue;
            }
            recovered += 1;
        }
        info!(recovered, "Projects recovered");
        Ok(recovered)
    }

    async fn recover_project(self: &Arc<Self>, file: ProjectFile) -> Result<()> {
        let ProjectFile {
            info,
            config,
            manifest,
        } = file;
        let project_id = info.project_id.clone();
        let status = info.status;
        let complete = manifest
            .services
            .iter()
            .all(|svc| info.containers.contains_key(&svc.name));
        if let Ok((plan, quotas)) = self.quotas.resolve(&config).await {
            self.quotas.register_project(&project_id, plan, quotas).await;
        }
        let slot = self
            .registry
            .register(ProjectEntry {
                info,
                config,
                manifest,
                persisted: None,
            })
            .await?;
        let lease = slot.lease().await;
        match status {
            ProjectStatus::Deleting => {
                info!(project_id = %project_id, "Finishing interrupted delete");
                let _backup = slot.backup_lock().await;
                self.teardown(&lease).await?;
            }
            ProjectStatus::Creating if !complete => {
                warn!(project_id = %project_id, "Rolling back interrupted provisioning");
                let reason = Error::InvalidRequest("provisioner restarted during provisioning".into());
                self.rollback(&lease, &reason).await;
            }
            ProjectStatus::Creating => {
                let this = self.clone();
                self.tasks.spawn(
                    "resume",
                    project_id.clone(),
                    async move {
                        let timeout = this.config.probe_timeout;
                        if let Err(e) = this.settle(&lease, timeout).await {
                            error!(project_id = %lease.project_id(), error = %e, "Failed to settle recovered project");
                        }
                    },
                    |_| async {},
                );
            }
            _ => {
                debug!(project_id = %project_id, status = %status, "Project recovered");
            }
        }
        Ok(())
    }

    // ========================================================================
    // Operations on a held lease (shared with the backup engine)
    // ========================================================================

    /// Slot of a registered project.
    pub async fn slot(&self, project_id: &str) -> Result<Arc<ProjectSlot>> {
        self.registry
            .get(project_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Project, project_id))
    }

    /// Wait for the operation lock of a registered project.
    pub async fn lease(&self, project_id: &str) -> Result<ProjectLease> {
        let slot = self.slot(project_id).await?;
        let lease = slot.lease().await;
        if slot.is_removed() {
            return Err(Error::not_found(ResourceKind::Project, project_id));
        }
        Ok(lease)
    }

    /// Pause a leased project.
    pub async fn pause_with(&self, lease: &ProjectLease) -> Result<ProjectInfo> {
        let project_id = lease.project_id();
        let status = lease.read().await.info.status;
        if status == ProjectStatus::Paused {
            debug!(project_id, "Project already paused");
            return Ok(lease.read().await.info.clone());
        }
        self.plan(project_id, status, LifecycleEvent::Pause)?;
        let _backup = lease.slot().backup_lock().await;
        let names: Vec<String> = {
            let entry = lease.read().await;
            entry.manifest.services.iter().rev().map(|s| s.name.clone()).collect()
        };
        self.stop_services(lease, &names).await?;
        lease.write().await.info.health_checks.clear();
        self.apply(lease, LifecycleEvent::Pause).await?;
        info!(project_id, "Project paused");
        Ok(lease.read().await.info.clone())
    }

    /// Start every container of a paused leased project and move it to
    /// `CREATING`. The caller settles it with [`settle`](Self::settle).
    pub async fn start_all(&self, lease: &ProjectLease) -> Result<()> {
        let project_id = lease.project_id();
        let status = lease.read().await.info.status;
        self.plan(project_id, status, LifecycleEvent::Resume)?;
        let names: Vec<String> = {
            let entry = lease.read().await;
            entry.manifest.services.iter().map(|s| s.name.clone()).collect()
        };
        if let Err(e) = self.start_services(lease, &names).await {
            // Leave the project consistently paused.
            let reversed: Vec<String> = names.into_iter().rev().collect();
            if let Err(stop) = self.stop_services(lease, &reversed).await {
                warn!(project_id, error = %stop, "Failed to stop services after failed resume");
            }
            return Err(e);
        }
        self.apply(lease, LifecycleEvent::Resume).await?;
        info!(project_id, "Project resuming");
        Ok(())
    }

    /// Probe a leased `CREATING` project until it passes or `timeout` runs
    /// out, then commit healthy or unhealthy.
    pub async fn settle(&self, lease: &ProjectLease, timeout: Duration) -> Result<ProjectStatus> {
        let healthy = self.wait_healthy(lease, timeout).await?;
        self.apply(lease, probe_event(healthy)).await
    }

    /// Start some services of a leased project (no status change).
    pub async fn start_services(&self, lease: &ProjectLease, names: &[String]) -> Result<()> {
        let project_id = lease.project_id();
        let containers = lease.read().await.info.containers.clone();
        for name in names {
            if let Some(container_id) = containers.get(name) {
                self.call(project_id, "start_container", || {
                    self.adapter.start_container(container_id)
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Stop some services of a leased project (no status change).
    pub async fn stop_services(&self, lease: &ProjectLease, names: &[String]) -> Result<()> {
        let project_id = lease.project_id();
        let containers = lease.read().await.info.containers.clone();
        for name in names {
            if let Some(container_id) = containers.get(name) {
                self.call(project_id, "stop_container", || {
                    self.adapter.stop_container(container_id)
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Record a failed restore: restart every container (best effort) and
    /// leave the project `ACTIVE_UNHEALTHY`.
    pub async fn mark_restore_failed(&self, lease: &ProjectLease, reason: &str) -> Result<()> {
        let project_id = lease.project_id();
        let names: Vec<String> = {
            let entry = lease.read().await;
            entry.manifest.services.iter().map(|s| s.name.clone()).collect()
        };
        if let Err(e) = self.start_services(lease, &names).await {
            warn!(project_id, error = %e, "Failed to restart services after failed restore");
        }
        lease.write().await.info.error_message = Some(reason.to_string());
        self.apply(lease, LifecycleEvent::RestoreFailed).await?;
        warn!(project_id, reason, "Restore failed, project left unhealthy");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn provision(&self, lease: ProjectLease) {
        let project_id = lease.project_id().to_string();
        let manifest = lease.read().await.manifest.clone();
        if let Err(e) = self.materialize(&lease, &manifest).await {
            self.rollback(&lease, &e).await;
            return;
        }
        match self.wait_healthy(&lease, self.config.probe_timeout).await {
            Ok(true) => match self.apply(&lease, LifecycleEvent::ProbesPassed).await {
                Ok(_) => info!(project_id = %project_id, "Project provisioned"),
                Err(e) => error!(project_id = %project_id, error = %e, "Failed to commit provisioned project"),
            },
            Ok(false) => {
                let err = Error::provisioning(
                    project_id.clone(),
                    "health_probes",
                    Error::Timeout {
                        operation: "health probes".into(),
                        elapsed: self.config.probe_timeout,
                    },
                );
                self.rollback(&lease, &err).await;
            }
            Err(e) => self.rollback(&lease, &e).await,
        }
    }

    async fn materialize(&self, lease: &ProjectLease, manifest: &ProjectManifest) -> Result<()> {
        let project_id = lease.project_id();
        self.call(project_id, "create_network", || {
            self.adapter.create_network(project_id, &manifest.network)
        })
        .await?;
        for volume in &manifest.volumes {
            self.call(project_id, "create_volume", || {
                self.adapter.create_volume(project_id, &volume.name)
            })
            .await?;
        }
        for spec in &manifest.services {
            let container_id = self
                .call(project_id, "create_container", || {
                    self.adapter.create_container(project_id, &manifest.network, spec)
                })
                .await?;
            debug!(project_id, service = %spec.name, container_id = %container_id, "Container started");
            lease
                .write()
                .await
                .info
                .containers
                .insert(spec.name.clone(), container_id);
        }
        Ok(())
    }

    /// Replace the containers of `changed` services, recording each one in
    /// the leased entry as soon as it exists.
    async fn recreate_services(
        &self,
        lease: &ProjectLease,
        desired: &ProjectManifest,
        changed: &[String],
        containers: &mut BTreeMap<String, String>,
    ) -> Result<()> {
        let project_id = lease.project_id();
        for service in changed {
            if let Some(container_id) = containers.get(service).cloned() {
                self.call(project_id, "remove_container", || {
                    self.adapter.remove_container(&container_id)
                })
                .await?;
                containers.remove(service);
                lease.write().await.info.containers = containers.clone();
            }
            if let Some(spec) = desired.service(service) {
                let container_id = self
                    .call(project_id, "create_container", || {
                        self.adapter.create_container(project_id, &desired.network, spec)
                    })
                    .await?;
                containers.insert(service.clone(), container_id);
            }
            lease.write().await.info.containers = containers.clone();
        }
        Ok(())
    }

    /// Remove everything created for a project and mark it `FAILED`.
    async fn rollback(&self, lease: &ProjectLease, err: &Error) {
        let project_id = lease.project_id();
        error!(project_id, error = %err, "Provisioning failed, rolling back");
        if let Err(e) = self
            .call(project_id, "remove_project", || self.adapter.remove_project(project_id))
            .await
        {
            error!(project_id, error = %e, "Rollback incomplete, orphan sweep will retry");
        }
        {
            let mut entry = lease.write().await;
            entry.info.containers.clear();
            entry.info.health_checks.clear();
            entry.info.error_message = Some(err.to_string());
        }
        if let Err(e) = self.apply(lease, LifecycleEvent::ProvisioningFailed).await {
            error!(project_id, error = %e, "Failed to mark project as failed");
        }
    }

    async fn abort_provisioning(&self, project_id: &str, reason: String) {
        let Ok(lease) = self.lease(project_id).await else {
            return;
        };
        if lease.read().await.info.status == ProjectStatus::Creating {
            let err = Error::provisioning(project_id, "provision", Error::InvalidRequest(reason));
            self.rollback(&lease, &err).await;
        }
    }

    async fn abort_resume(&self, project_id: &str, reason: String) {
        let Ok(lease) = self.lease(project_id).await else {
            return;
        };
        if lease.read().await.info.status == ProjectStatus::Creating {
            lease.write().await.info.error_message = Some(reason);
            if let Err(e) = self.apply(&lease, LifecycleEvent::ProbesFailed).await {
                error!(project_id, error = %e, "Failed to settle aborted resume");
            }
        }
    }

    async fn teardown(&self, lease: &ProjectLease) -> Result<()> {
        let project_id = lease.project_id();
        self.call(project_id, "remove_project", || self.adapter.remove_project(project_id))
            .await?;
        self.registry.remove(lease).await;
        self.quotas.remove_project(project_id).await;
        if let Some(dir) = self.project_dir(project_id) {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(project_id, error = %e, "Failed to remove project files"),
            }
        }
        info!(project_id, "Project deleted");
        Ok(())
    }

    async fn wait_healthy(&self, lease: &ProjectLease, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe_all(lease).await? {
                return Ok(true);
            }
            if Instant::now() + self.config.probe_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    /// Probe every service, record the results and return whether all passed.
    ///
    /// An unreachable runtime is an error (no health verdict); any other
    /// probe error counts as a failed probe.
    async fn probe_all(&self, lease: &ProjectLease) -> Result<bool> {
        let project_id = lease.project_id();
        let (services, containers) = {
            let entry = lease.read().await;
            (entry.manifest.services.clone(), entry.info.containers.clone())
        };
        let mut results = BTreeMap::new();
        for spec in &services {
            let passed = match containers.get(&spec.name) {
                None => false,
                Some(container_id) => match self
                    .config
                    .retry
                    .run("probe", || self.adapter.probe(container_id, &spec.probe))
                    .await
                {
                    Ok(passed) => passed,
                    Err(RuntimeError::Unavailable(reason)) => {
                        return Err(Error::RuntimeUnavailable { reason });
                    }
                    Err(e) => {
                        debug!(project_id, service = %spec.name, error = %e, "Probe errored");
                        false
                    }
                },
            };
            results.insert(spec.name.clone(), passed);
        }
        let healthy = results.values().all(|passed| *passed);
        lease.write().await.info.health_checks = results;
        Ok(healthy)
    }

    async fn refresh_stats(&self, lease: &ProjectLease) {
        let (containers, storage_volume) = {
            let entry = lease.read().await;
            (
                entry.info.containers.clone(),
                entry.manifest.volume("storage").map(str::to_string),
            )
        };
        let mut cpu = 0.0;
        let mut memory = 0;
        for container_id in containers.values() {
            if let Ok(stats) = self.adapter.stats(container_id).await {
                cpu += stats.cpu_percent;
                memory += stats.memory_bytes;
            }
        }
        let storage = match &storage_volume {
            Some(volume) => self
                .adapter
                .volume_size(lease.project_id(), volume)
                .await
                .ok(),
            None => None,
        };
        let mut entry = lease.write().await;
        entry.info.cpu_usage = cpu;
        entry.info.memory_usage = memory;
        if let Some(storage) = storage {
            entry.info.storage_usage = storage;
        }
    }

    async fn running_container(&self, project_id: &str, service: &str) -> Result<String> {
        let slot = self.slot(project_id).await?;
        let entry = slot.read().await;
        let running = entry.info.status.is_active() || entry.info.status == ProjectStatus::Creating;
        match entry.info.containers.get(service) {
            Some(container_id) if running => Ok(container_id.clone()),
            _ => Err(Error::ServiceNotFound {
                project_id: project_id.to_string(),
                service: service.to_string(),
            }),
        }
    }

    fn plan(&self, project_id: &str, status: ProjectStatus, event: LifecycleEvent) -> Result<ProjectStatus> {
        next_status(Some(status), event).map_err(|source| Error::IllegalTransition {
            project_id: project_id.to_string(),
            source,
        })
    }

    /// Commit a transition and sync it when the status changed.
    async fn apply(&self, lease: &ProjectLease, event: LifecycleEvent) -> Result<ProjectStatus> {
        let project_id = lease.project_id();
        let (from, to, persisted) = {
            let mut entry = lease.write().await;
            let from = entry.info.status;
            let to = self.plan(project_id, from, event)?;
            if from != to {
                entry.info.status = to;
                entry.info.updated_at = Utc::now();
            }
            (from, to, entry.persisted)
        };
        if from != to {
            info!(project_id, from = %from, to = %to, %event, "Project status changed");
        }
        if from != to || persisted != Some(to) {
            self.sync(lease).await;
        }
        Ok(to)
    }

    /// Push the current status to the project store and project file.
    /// Failures are logged; the health sweep retries until they succeed.
    async fn sync(&self, lease: &ProjectLease) {
        let project_id = lease.project_id();
        let status = lease.read().await.info.status;
        match self.store.update_project_status(project_id, status).await {
            Ok(_) => lease.write().await.persisted = Some(status),
            Err(e) => warn!(project_id, status = %status, error = %e, "Failed to persist project status"),
        }
        self.save_project_file(lease).await;
    }

    async fn create_record(
        &self,
        config: &ProjectConfig,
        status: ProjectStatus,
    ) -> std::result::Result<(), PersistenceError> {
        match self.store.get_project_by_reference(&config.project_id).await {
            Ok(_) => {
                self.store
                    .update_project_status(&config.project_id, status)
                    .await?;
            }
            Err(PersistenceError::NotFound(_)) => {
                self.store
                    .create_project_record(NewProjectRecord::from_config(config, status))
                    .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn project_dir(&self, project_id: &str) -> Option<PathBuf> {
        self.config
            .projects_dir
            .as_ref()
            .map(|dir| dir.join(project_id))
    }

    async fn save_project_file(&self, lease: &ProjectLease) {
        let Some(dir) = self.project_dir(lease.project_id()) else {
            return;
        };
        let file = {
            let entry = lease.read().await;
            ProjectFile {
                info: entry.info.clone(),
                config: entry.config.clone(),
                manifest: entry.manifest.clone(),
            }
        };
        if let Err(e) = write_private(&dir, &file).await {
            warn!(project_id = %lease.project_id(), error = %e, "Failed to write project file");
        }
    }

    /// Run one runtime call with retries and the operation deadline.
    async fn call<T, F, Fut>(&self, project_id: &str, operation: &'static str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RuntimeError>>,
    {
        let attempt = self.config.retry.run(operation, op);
        match tokio::time::timeout(self.config.operation_timeout, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::provisioning(project_id, operation, e.into())),
            Err(_) => Err(Error::provisioning(
                project_id,
                operation,
                Error::Timeout {
                    operation: operation.to_string(),
                    elapsed: self.config.operation_timeout,
                },
            )),
        }
    }
}

fn probe_event(healthy: bool) -> LifecycleEvent {
    if healthy {
        LifecycleEvent::ProbesPassed
    } else {
        LifecycleEvent::ProbesFailed
    }
}

fn id_taken(project_id: String) -> Error {
    Error::Conflict {
        project_id,
        reason: "project id is already registered".into(),
    }
}

fn service_error(project_id: &str, service: &str, err: RuntimeError) -> Error {
    match err {
        RuntimeError::ContainerNotFound(_) | RuntimeError::NotRunning(_) => Error::ServiceNotFound {
            project_id: project_id.to_string(),
            service: service.to_string(),
        },
        other => other.into(),
    }
}

/// Write the project file readable by the owner only.
async fn write_private(dir: &Path, file: &ProjectFile) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(PROJECT_FILE);
    let tmp = dir.join(format!("{PROJECT_FILE}.tmp"));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MockAdapter;
    use crate::persistence::MemoryProjectStore;
    use crate::project::fixtures::config;
    use crate::quota::QuotaSettings;

    fn orchestrator(adapter: Arc<MockAdapter>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(ProjectRegistry::new()),
            adapter,
            Arc::new(MemoryProjectStore::new()),
            Arc::new(QuotaManager::new(QuotaSettings::default())),
            TaskSupervisor::new(4),
            OrchestratorConfig {
                probe_timeout: Duration::from_millis(200),
                probe_interval: Duration::from_millis(10),
                retry: RetryPolicy {
                    max_retries: 2,
                    delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
                ..OrchestratorConfig::default()
            },
        ))
    }

    async fn settled(orch: &Orchestrator, project_id: &str) -> ProjectInfo {
        for _ in 0..500 {
            let info = orch.get_project_info(project_id).await.unwrap();
            if info.status != ProjectStatus::Creating {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("project {project_id} did not settle");
    }

    #[tokio::test]
    async fn test_allocate_ports_skips_used() {
        let adapter = Arc::new(MockAdapter::new());
        let orch = orchestrator(adapter);
        let first = orch.allocate_ports().await.unwrap();
        assert_eq!(
            first,
            PortAllocation {
                db_port: 5433,
                api_port: 54321,
                studio_port: 54322
            }
        );
        orch.create_project(config("p1", first.db_port, first.api_port))
            .await
            .unwrap();
        let second = orch.allocate_ports().await.unwrap();
        assert_eq!(second.db_port, 5434);
        assert_eq!(second.api_port, 54323);
    }

    #[tokio::test]
    async fn test_unhealthy_service_flips_status_on_sweep() {
        let adapter = Arc::new(MockAdapter::new());
        let orch = orchestrator(adapter.clone());
        orch.create_project(config("p1", 5433, 54321)).await.unwrap();
        assert_eq!(settled(&orch, "p1").await.status, ProjectStatus::ActiveHealthy);

        adapter.set_unhealthy("p1", "rest", true).await;
        orch.sweep_health().await;
        let info = orch.get_project_info("p1").await.unwrap();
        assert_eq!(info.status, ProjectStatus::ActiveUnhealthy);
        assert_eq!(info.health_checks.get("rest"), Some(&false));
        assert_eq!(adapter.running_services("p1").await.len(), 7);

        adapter.set_unhealthy("p1", "rest", false).await;
        orch.sweep_health().await;
        assert_eq!(
            orch.get_project_info("p1").await.unwrap().status,
            ProjectStatus::ActiveHealthy
        );
    }

    #[tokio::test]
    async fn test_orphan_sweep_removes_unknown_projects() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.create_network("ghost", "stackforge-ghost-net").await.unwrap();
        let orch = orchestrator(adapter.clone());
        assert_eq!(orch.sweep_orphans().await.unwrap(), 1);
        assert_eq!(adapter.resource_count("ghost").await, 0);
    }

    #[tokio::test]
    async fn test_project_files_allow_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let make = |adapter: Arc<MockAdapter>| {
            Arc::new(Orchestrator::new(
                Arc::new(ProjectRegistry::new()),
                adapter,
                Arc::new(MemoryProjectStore::new()),
                Arc::new(QuotaManager::new(QuotaSettings::default())),
                TaskSupervisor::new(4),
                OrchestratorConfig {
                    projects_dir: Some(dir.path().to_path_buf()),
                    probe_interval: Duration::from_millis(10),
                    ..OrchestratorConfig::default()
                },
            ))
        };
        let first = make(adapter.clone());
        first.create_project(config("p1", 5433, 54321)).await.unwrap();
        settled(&first, "p1").await;

        let second = make(adapter);
        assert_eq!(second.recover().await.unwrap(), 1);
        let info = second.get_project_info("p1").await.unwrap();
        assert_eq!(info.status, ProjectStatus::ActiveHealthy);
        assert_eq!(info.containers.len(), 7);
    }
}
