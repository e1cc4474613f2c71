// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup and restore execution.
//!
//! Backups capture project state by running dump and archive tools inside
//! the project's `db` and `storage` containers, seal the result into an
//! artifact and hand it to [`BackupStorage`]. Restores fetch the chain of
//! artifacts a backup depends on, replay it, and feed the result back
//! through the inverse tools.
//!
//! `create_backup`, `restore_backup` and `import_project` return a record
//! immediately and continue on the orchestrator's task pool; callers poll the
//! catalog.
//!
//! # Locking
//!
//! Capture and restore hold the project's backup lock. When the project is
//! paused (or has to be paused), its operation lock is taken first so the
//! data services can be started for the duration without racing a resume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::artifact::{
    self, Artifact, ArtifactKey, ArtifactManifest, ContentIndex, FORMAT_VERSION, digest,
};
use super::catalog::{BackupCatalog, BackupEntry, Interrupted};
use super::schedule::is_due;
use super::storage::{BackupStorage, LocalBackupStorage};
use super::types::{
    BackupConfig, BackupContents, BackupInfo, BackupSchedule, BackupStatus, BackupType,
    RestoreConfig, RestoreInfo, RestoreStatus, ScheduleFrequency,
};
use crate::adapter::RuntimeError;
use crate::error::{Error, ResourceKind, Result};
use crate::lifecycle::ProjectStatus;
use crate::orchestrator::{Orchestrator, PortAllocation};
use crate::project::{ProjectConfig, ProjectInfo};
use crate::quota::QuotaOperation;
use crate::registry::ProjectLease;
use crate::template::{
    DB_SERVICE, ProjectManifest, STORAGE_SERVICE, archive_storage_command,
    dump_database_command, extract_storage_command, restore_database_command,
    wipe_storage_command,
};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct BackupEngineConfig {
    /// Scratch directory for artifacts in transit.
    pub work_dir: PathBuf,
    /// Key for encrypted artifacts.
    pub encryption_key: Option<ArtifactKey>,
    /// Deadline for one dump, archive or restore command.
    pub exec_timeout: Duration,
}

impl Default for BackupEngineConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("stackforge-backups"),
            encryption_key: None,
            exec_timeout: Duration::from_secs(3600),
        }
    }
}

/// Overrides for [`BackupEngine::import_project`].
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Id for the new project (default: the id recorded in the archive).
    pub project_id: Option<String>,
    /// Host ports (default: the next free allocation).
    pub ports: Option<PortAllocation>,
}

/// An accepted import waiting for its project to settle.
struct Import {
    restore_id: String,
    backup_id: String,
    project_id: String,
    artifact: Artifact,
    encrypted: bool,
}

/// Captured project state.
struct Captured {
    database: Option<Vec<u8>>,
    files: BTreeMap<String, Vec<u8>>,
    config: ProjectConfig,
    manifest: ProjectManifest,
}

/// Where a sealed artifact ended up.
struct Stored {
    local_key: String,
    remote_key: Option<String>,
    size: u64,
    checksum: String,
}

/// Backup/restore engine.
pub struct BackupEngine {
    orchestrator: Arc<Orchestrator>,
    catalog: Arc<BackupCatalog>,
    local: Arc<LocalBackupStorage>,
    remote: Option<Arc<dyn BackupStorage>>,
    config: BackupEngineConfig,
}

impl BackupEngine {
    /// Create an engine storing artifacts in `local`.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        catalog: Arc<BackupCatalog>,
        local: Arc<LocalBackupStorage>,
        config: BackupEngineConfig,
    ) -> Self {
        Self {
            orchestrator,
            catalog,
            local,
            remote: None,
            config,
        }
    }

    /// Enable remote copies of artifacts.
    pub fn with_remote(mut self, remote: Arc<dyn BackupStorage>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Backup catalog.
    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    // ========================================================================
    // Backups
    // ========================================================================

    /// Start a backup. Returns the record in `CREATING`.
    pub async fn create_backup(self: &Arc<Self>, config: BackupConfig) -> Result<BackupInfo> {
        self.start_backup(config, None).await
    }

    async fn start_backup(
        self: &Arc<Self>,
        config: BackupConfig,
        unit: Option<ScheduleFrequency>,
    ) -> Result<BackupInfo> {
        let project_id = config.project_id.clone();
        let status = self.orchestrator.slot(&project_id).await?.status().await;
        if !can_capture(status) {
            return Err(Error::InvalidState {
                project_id,
                status,
                operation: "backup",
            });
        }
        if config.encryption && self.config.encryption_key.is_none() {
            return Err(Error::InvalidRequest(
                "encryption requested but no backup encryption secret is configured".into(),
            ));
        }
        if config.s3_upload && self.remote.is_none() {
            return Err(Error::InvalidRequest(
                "remote upload requested but no remote backup storage is configured".into(),
            ));
        }
        let base = match config.backup_type {
            BackupType::Incremental => Some(
                self.catalog
                    .latest_completed(&project_id, &[BackupType::Full, BackupType::Incremental])
                    .await
                    .ok_or_else(|| Error::NoBaseBackup {
                        project_id: project_id.clone(),
                    })?,
            ),
            _ => None,
        };

        let estimate = self
            .catalog
            .latest_completed(&project_id, &[config.backup_type])
            .await
            .map(|e| e.info.size)
            .unwrap_or(0);
        let decision = self
            .orchestrator
            .quotas()
            .enforce_quotas(&project_id, QuotaOperation::Backup, estimate)
            .await?;
        for warning in &decision.warnings {
            warn!(
                project_id = %project_id,
                resource = %warning.resource,
                used_percent = warning.used_percent,
                "Backup pushes project close to its quota"
            );
        }

        let info = BackupInfo {
            backup_id: Uuid::new_v4().to_string(),
            project_id: project_id.clone(),
            backup_type: config.backup_type,
            status: BackupStatus::Creating,
            size: 0,
            compression: config.compression,
            encryption: config.encryption,
            file_path: None,
            s3_key: None,
            base_backup_id: base.as_ref().map(|b| b.info.backup_id.clone()),
            checksum: None,
            error_message: None,
            scheduled: unit.is_some(),
            created_at: Utc::now(),
            completed_at: None,
            expires_at: None,
        };
        self.catalog.insert_backup(info.clone()).await?;
        info!(
            project_id = %project_id,
            backup_id = %info.backup_id,
            backup_type = %config.backup_type,
            "Backup started"
        );

        let backup_id = info.backup_id.clone();
        let this = self.clone();
        let on_failure = {
            let this = self.clone();
            let backup_id = backup_id.clone();
            move |reason: String| async move { this.fail_backup(&backup_id, reason).await }
        };
        self.orchestrator.tasks().spawn(
            "backup",
            backup_id.clone(),
            async move { this.run_backup(&backup_id, config, base, unit).await },
            on_failure,
        );
        Ok(info)
    }

    async fn run_backup(
        &self,
        backup_id: &str,
        config: BackupConfig,
        base: Option<BackupEntry>,
        unit: Option<ScheduleFrequency>,
    ) {
        match self.execute_backup(backup_id, &config, base.as_ref(), unit).await {
            Ok(info) => {
                info!(
                    project_id = %info.project_id,
                    backup_id,
                    size = info.size,
                    "Backup completed"
                );
                if config.auto_cleanup {
                    self.auto_cleanup(&info, config.retention).await;
                }
            }
            Err(e) => self.fail_backup(backup_id, e.to_string()).await,
        }
    }

    async fn execute_backup(
        &self,
        backup_id: &str,
        config: &BackupConfig,
        base: Option<&BackupEntry>,
        unit: Option<ScheduleFrequency>,
    ) -> Result<BackupInfo> {
        let project_id = config.project_id.as_str();
        let contents = config.backup_type.contents();
        let captured = self.capture(project_id, contents).await?;
        let index = ContentIndex::of(captured.database.as_deref(), &captured.files);

        let mut artifact = Artifact {
            manifest: ArtifactManifest {
                format_version: FORMAT_VERSION,
                backup_id: backup_id.to_string(),
                project_id: project_id.to_string(),
                backup_type: config.backup_type,
                base_backup_id: base.map(|b| b.info.backup_id.clone()),
                created_at: Utc::now(),
                removed_files: Vec::new(),
            },
            database: captured.database,
            files: captured.files,
            config: contents.config.then_some(captured.config),
            services: contents.config.then_some(captured.manifest),
        };
        if let Some(base) = base {
            let base_index = base.index.clone().unwrap_or_default();
            let changes = artifact::delta(
                &base_index,
                artifact.database.take().unwrap_or_default(),
                std::mem::take(&mut artifact.files),
            );
            debug!(
                backup_id,
                database_changed = changes.database.is_some(),
                changed_files = changes.files.len(),
                removed_files = changes.removed_files.len(),
                "Incremental delta computed"
            );
            artifact.database = changes.database;
            artifact.files = changes.files;
            artifact.manifest.removed_files = changes.removed_files;
        }

        let key = self
            .config
            .encryption_key
            .as_ref()
            .filter(|_| config.encryption);
        let sealed = artifact::seal(&artifact, config.compression, key)?;
        let local_key = artifact_key(project_id, backup_id, config.compression, config.encryption);
        let remote_key = config
            .s3_upload
            .then(|| remote_key(config.s3_prefix.as_deref(), &local_key));
        let stored = self
            .store_artifact(backup_id, local_key, remote_key, &sealed)
            .await?;

        let completed_at = Utc::now();
        let period = unit.map_or_else(|| chrono::Duration::days(1), ScheduleFrequency::period);
        let expires_at = expiry(completed_at, period, config.retention);
        self.finish_backup(backup_id, stored, index, completed_at, expires_at)
            .await
    }

    async fn finish_backup(
        &self,
        backup_id: &str,
        stored: Stored,
        index: ContentIndex,
        completed_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<BackupInfo> {
        let file_path = self.local.path_for(&stored.local_key)?;
        let local_key = stored.local_key.clone();
        let remote_key = stored.remote_key.clone();
        let result = self
            .catalog
            .update_backup(backup_id, |entry| {
                entry.info.status = BackupStatus::Completed;
                entry.info.size = stored.size;
                entry.info.checksum = Some(stored.checksum);
                entry.info.file_path = Some(file_path.display().to_string());
                entry.info.s3_key = stored.remote_key;
                entry.info.completed_at = Some(completed_at);
                entry.info.expires_at = expires_at;
                entry.index = Some(index);
                entry.local_key = Some(stored.local_key);
            })
            .await;
        if result.is_err() {
            self.delete_artifacts(Some(&local_key), remote_key.as_deref()).await;
        }
        result
    }

    async fn fail_backup(&self, backup_id: &str, reason: String) {
        let message = reason.clone();
        let result = self
            .catalog
            .update_backup(backup_id, |entry| {
                entry.info.status = BackupStatus::Failed;
                entry.info.error_message = Some(message);
                entry.info.completed_at = Some(Utc::now());
            })
            .await;
        match result {
            Ok(info) => error!(
                project_id = %info.project_id,
                backup_id,
                error = %reason,
                "Backup failed"
            ),
            Err(e) => warn!(backup_id, error = %e, "Failed to record backup failure"),
        }
    }

    /// Keep the newest completed backups of the same project and type.
    async fn auto_cleanup(&self, latest: &BackupInfo, retention: u32) {
        let project_id = latest.project_id.as_str();
        let mut keep = retention.max(1) as usize;
        if let Ok(quotas) = self.orchestrator.quotas().get_quotas(project_id).await
            && quotas.max_backups > 0
        {
            keep = keep.min(usize::try_from(quotas.max_backups).unwrap_or(usize::MAX));
        }
        let completed: Vec<BackupInfo> = self
            .catalog
            .list_backups(Some(project_id))
            .await
            .into_iter()
            .filter(|b| b.status == BackupStatus::Completed && b.backup_type == latest.backup_type)
            .collect();
        let excess = completed.len().saturating_sub(keep);
        for old in completed.iter().take(excess) {
            if old.backup_id == latest.backup_id {
                continue;
            }
            match self.delete_backup(&old.backup_id).await {
                Ok(()) => info!(project_id, backup_id = %old.backup_id, "Old backup cleaned up"),
                Err(Error::BackupInUse { dependent_id, .. }) => {
                    debug!(project_id, backup_id = %old.backup_id, dependent_id = %dependent_id, "Keeping base of a retained backup");
                }
                Err(e) => warn!(project_id, backup_id = %old.backup_id, error = %e, "Failed to clean up old backup"),
            }
        }
    }

    /// Backup record.
    pub async fn get_backup_info(&self, backup_id: &str) -> Result<BackupInfo> {
        self.catalog
            .get_backup(backup_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Backup, backup_id))
    }

    /// Backups, oldest first, optionally for one project.
    pub async fn list_backups(&self, project_id: Option<&str>) -> Vec<BackupInfo> {
        self.catalog.list_backups(project_id).await
    }

    /// Delete a finished backup and its artifacts. Fails while an
    /// incremental backup depends on it.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let entry = self
            .catalog
            .entry(backup_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Backup, backup_id))?;
        if entry.info.status == BackupStatus::Creating {
            return Err(Error::InvalidRequest(format!(
                "backup {backup_id} is still being created"
            )));
        }
        if let Some(dependent_id) = self.catalog.dependent_of(backup_id).await {
            return Err(Error::BackupInUse {
                backup_id: backup_id.to_string(),
                dependent_id,
            });
        }
        self.delete_artifacts(entry.local_key.as_deref(), entry.info.s3_key.as_deref())
            .await;
        self.catalog.remove_backup(backup_id).await?;
        info!(project_id = %entry.info.project_id, backup_id, "Backup deleted");
        Ok(())
    }

    /// Time-limited URL for downloading a completed backup.
    pub async fn get_download_url(&self, backup_id: &str, ttl: Duration) -> Result<String> {
        let entry = self
            .catalog
            .entry(backup_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Backup, backup_id))?;
        if entry.info.status != BackupStatus::Completed {
            return Err(Error::InvalidRequest(format!(
                "backup {backup_id} is {} and cannot be downloaded",
                entry.info.status
            )));
        }
        if let (Some(remote), Some(key)) = (&self.remote, &entry.info.s3_key) {
            return Ok(remote.get_download_url(key, ttl).await?);
        }
        let key = entry.local_key.as_deref().ok_or_else(|| {
            Error::InvalidRequest(format!("backup {backup_id} has no stored artifact"))
        })?;
        Ok(self.local.get_download_url(key, ttl).await?)
    }

    /// Delete completed backups past their expiry. Bases of retained
    /// incremental backups are kept. Returns the number deleted.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<BackupInfo> = self
            .catalog
            .list_backups(None)
            .await
            .into_iter()
            .filter(|b| {
                b.status == BackupStatus::Completed && b.expires_at.is_some_and(|at| at <= now)
            })
            .collect();
        let mut deleted = 0;
        // Newest first so an expired incremental frees its expired base.
        for backup in expired.iter().rev() {
            match self.delete_backup(&backup.backup_id).await {
                Ok(()) => deleted += 1,
                Err(Error::BackupInUse { .. }) => {
                    debug!(backup_id = %backup.backup_id, "Expired backup is still a base");
                }
                Err(e) => warn!(backup_id = %backup.backup_id, error = %e, "Failed to delete expired backup"),
            }
        }
        deleted
    }

    // ========================================================================
    // Restores
    // ========================================================================

    /// Start a restore. Returns the record in `RESTORING`.
    pub async fn restore_backup(self: &Arc<Self>, config: RestoreConfig) -> Result<RestoreInfo> {
        let entry = self
            .catalog
            .entry(&config.backup_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Backup, &config.backup_id))?;
        if !entry
            .info
            .backup_type
            .contents()
            .covers(config.restore_type.contents())
        {
            return Err(Error::TypeMismatch {
                backup_id: config.backup_id.clone(),
                backup_type: entry.info.backup_type,
                restore_type: config.restore_type,
            });
        }
        if entry.info.status != BackupStatus::Completed {
            return Err(Error::InvalidRequest(format!(
                "backup {} is {} and cannot be restored",
                config.backup_id, entry.info.status
            )));
        }
        let project_id = config
            .project_id
            .clone()
            .unwrap_or_else(|| entry.info.project_id.clone());
        let status = self.orchestrator.slot(&project_id).await?.status().await;
        if !can_capture(status) {
            return Err(Error::InvalidState {
                project_id,
                status,
                operation: "restore",
            });
        }
        let chain = self.resolve_chain(&entry, config.point_in_time).await?;

        let info = RestoreInfo {
            restore_id: Uuid::new_v4().to_string(),
            backup_id: config.backup_id.clone(),
            project_id: project_id.clone(),
            restore_type: config.restore_type,
            status: RestoreStatus::Restoring,
            progress: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.catalog.insert_restore(info.clone()).await?;
        info!(
            project_id = %project_id,
            backup_id = %config.backup_id,
            restore_id = %info.restore_id,
            chain = chain.len(),
            "Restore started"
        );

        let restore_id = info.restore_id.clone();
        let this = self.clone();
        let on_failure = {
            let this = self.clone();
            let restore_id = restore_id.clone();
            let project_id = project_id.clone();
            move |reason: String| async move { this.fail_restore(&restore_id, &project_id, reason).await }
        };
        self.orchestrator.tasks().spawn(
            "restore",
            restore_id.clone(),
            async move {
                match this.execute_restore(&restore_id, &config, &chain, &project_id).await {
                    Ok(()) => this.finish_restore(&restore_id).await,
                    Err(e) => this.fail_restore(&restore_id, &project_id, e.to_string()).await,
                }
            },
            on_failure,
        );
        Ok(info)
    }

    /// Restore record.
    pub async fn get_restore_info(&self, restore_id: &str) -> Result<RestoreInfo> {
        self.catalog
            .get_restore(restore_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Restore, restore_id))
    }

    /// The chain of backups to replay, full base first.
    async fn resolve_chain(
        &self,
        entry: &BackupEntry,
        point_in_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<BackupEntry>> {
        let mut chain = vec![entry.clone()];
        let mut base_id = entry.info.base_backup_id.clone();
        while let Some(id) = base_id {
            let base = self
                .catalog
                .entry(&id)
                .await
                .ok_or_else(|| Error::not_found(ResourceKind::Backup, &id))?;
            if base.info.status != BackupStatus::Completed {
                return Err(Error::InvalidRequest(format!(
                    "base backup {id} is {}",
                    base.info.status
                )));
            }
            base_id = base.info.base_backup_id.clone();
            chain.push(base);
        }
        chain.reverse();

        if let Some(at) = point_in_time {
            let Some(last) = chain
                .iter()
                .rposition(|e| e.info.completed_at.is_some_and(|done| done <= at))
            else {
                return Err(Error::InvalidRequest(format!(
                    "no backup in the chain of {} completed at or before {at}",
                    entry.info.backup_id
                )));
            };
            chain.truncate(last + 1);
        }
        Ok(chain)
    }

    async fn execute_restore(
        &self,
        restore_id: &str,
        config: &RestoreConfig,
        chain: &[BackupEntry],
        project_id: &str,
    ) -> Result<()> {
        let mut artifacts = Vec::with_capacity(chain.len());
        for entry in chain {
            artifacts.push(self.load_artifact(entry).await?);
        }
        let (database, files) = artifact::replay(&artifacts);
        self.progress(restore_id, 10).await?;

        let slot = self.orchestrator.slot(project_id).await?;
        let lease = if config.stop_project || slot.status().await == ProjectStatus::Paused {
            Some(self.orchestrator.lease(project_id).await?)
        } else {
            None
        };
        let mut resume = false;
        if let Some(lease) = &lease
            && config.stop_project
            && lease.read().await.info.status.is_active()
        {
            self.orchestrator.pause_with(lease).await?;
            resume = true;
        }

        let guard = slot.backup_lock().await;
        let (status, containers) = {
            let entry = slot.read().await;
            (entry.info.status, entry.info.containers.clone())
        };
        let maintenance = match (&lease, status) {
            (Some(lease), ProjectStatus::Paused) => Some(lease),
            (None, ProjectStatus::Paused) | (_, ProjectStatus::Creating) => {
                return Err(Error::InvalidState {
                    project_id: project_id.to_string(),
                    status,
                    operation: "restore",
                });
            }
            _ if can_capture(status) => None,
            _ => {
                return Err(Error::InvalidState {
                    project_id: project_id.to_string(),
                    status,
                    operation: "restore",
                });
            }
        };
        if let Some(lease) = maintenance {
            self.orchestrator
                .start_services(lease, &data_services())
                .await?;
        }
        self.progress(restore_id, 30).await?;

        let written = self
            .write_back(
                restore_id,
                project_id,
                &containers,
                config.restore_type.contents(),
                config.overwrite_data,
                database,
                files,
            )
            .await;
        if let Some(lease) = maintenance
            && let Err(e) = self.orchestrator.stop_services(lease, &data_services()).await
        {
            warn!(project_id, error = %e, "Failed to stop data services after restore");
        }
        drop(guard);
        written?;

        if resume && let Some(lease) = &lease {
            self.orchestrator.start_all(lease).await?;
            let status = self
                .orchestrator
                .settle(lease, self.orchestrator.config().probe_timeout)
                .await?;
            info!(project_id, status = %status, "Project resumed after restore");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_back(
        &self,
        restore_id: &str,
        project_id: &str,
        containers: &BTreeMap<String, String>,
        contents: BackupContents,
        overwrite: bool,
        database: Option<Vec<u8>>,
        files: BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        if contents.database {
            match database {
                Some(dump) => {
                    self.exec(
                        project_id,
                        containers,
                        DB_SERVICE,
                        "restore_database",
                        &restore_database_command(),
                        Some(dump),
                    )
                    .await?;
                }
                None => warn!(project_id, restore_id, "Backup chain holds no database dump"),
            }
        }
        self.progress(restore_id, 60).await?;

        if contents.storage {
            if overwrite {
                self.exec(
                    project_id,
                    containers,
                    STORAGE_SERVICE,
                    "wipe_storage",
                    &wipe_storage_command(),
                    None,
                )
                .await?;
            }
            let archive = artifact::write_tree(&files)?;
            self.exec(
                project_id,
                containers,
                STORAGE_SERVICE,
                "extract_storage",
                &extract_storage_command(),
                Some(archive),
            )
            .await?;
        }
        self.progress(restore_id, 90).await
    }

    async fn progress(&self, restore_id: &str, progress: u8) -> Result<()> {
        self.catalog
            .update_restore(restore_id, |r| r.progress = progress)
            .await?;
        debug!(restore_id, progress, "Restore progress");
        Ok(())
    }

    async fn finish_restore(&self, restore_id: &str) {
        let result = self
            .catalog
            .update_restore(restore_id, |r| {
                r.progress = 100;
                r.status = RestoreStatus::Completed;
                r.completed_at = Some(Utc::now());
            })
            .await;
        match result {
            Ok(info) => info!(project_id = %info.project_id, restore_id, "Restore completed"),
            Err(e) => warn!(restore_id, error = %e, "Failed to record restore completion"),
        }
    }

    /// Mark a restore record failed without touching its project.
    async fn record_restore_failure(&self, restore_id: &str, reason: String) {
        let result = self
            .catalog
            .update_restore(restore_id, |r| {
                r.status = RestoreStatus::Failed;
                r.error_message = Some(reason);
                r.completed_at = Some(Utc::now());
            })
            .await;
        match result {
            Ok(info) => error!(
                project_id = %info.project_id,
                restore_id,
                error = info.error_message.as_deref().unwrap_or_default(),
                "Restore failed"
            ),
            Err(e) => warn!(restore_id, error = %e, "Failed to record restore failure"),
        }
    }

    /// Record the failure and flag the project unhealthy.
    async fn fail_restore(&self, restore_id: &str, project_id: &str, reason: String) {
        self.record_restore_failure(restore_id, reason.clone()).await;
        match self.orchestrator.lease(project_id).await {
            Ok(lease) => {
                if let Err(e) = self.orchestrator.mark_restore_failed(&lease, &reason).await {
                    warn!(project_id, error = %e, "Failed to flag project after restore failure");
                }
            }
            Err(e) => warn!(project_id, error = %e, "Restored project is gone"),
        }
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    /// Create or replace the schedule for a (project, backup type).
    pub async fn set_backup_schedule(&self, schedule: BackupSchedule) -> Result<BackupSchedule> {
        schedule.time_of_day()?;
        self.orchestrator.slot(&schedule.project_id).await?;
        if schedule.encryption && self.config.encryption_key.is_none() {
            return Err(Error::InvalidRequest(
                "encryption requested but no backup encryption secret is configured".into(),
            ));
        }
        if schedule.s3_upload && self.remote.is_none() {
            return Err(Error::InvalidRequest(
                "remote upload requested but no remote backup storage is configured".into(),
            ));
        }
        let saved = self.catalog.upsert_schedule(schedule).await?;
        info!(
            project_id = %saved.project_id,
            backup_type = %saved.backup_type,
            frequency = %saved.frequency,
            time = %saved.time,
            enabled = saved.enabled,
            "Backup schedule saved"
        );
        Ok(saved)
    }

    /// Schedule of a (project, backup type).
    pub async fn get_backup_schedule(
        &self,
        project_id: &str,
        backup_type: BackupType,
    ) -> Result<BackupSchedule> {
        self.catalog
            .schedule(project_id, backup_type)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Schedule, format!("{project_id}/{backup_type}")))
    }

    /// Schedules, optionally for one project.
    pub async fn list_schedules(&self, project_id: Option<&str>) -> Vec<BackupSchedule> {
        self.catalog.schedules(project_id).await
    }

    /// Start a backup for every schedule due at `now`.
    ///
    /// A schedule is marked as run before its backup starts, so however many
    /// occurrences were missed it fires once.
    pub async fn run_due_schedules(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<BackupInfo> {
        let mut started = Vec::new();
        for schedule in self.catalog.schedules(None).await {
            match is_due(&schedule, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(project_id = %schedule.project_id, error = %e, "Invalid backup schedule");
                    continue;
                }
            }
            if self.orchestrator.registry().get(&schedule.project_id).await.is_none() {
                debug!(project_id = %schedule.project_id, "Skipping schedule of unregistered project");
                continue;
            }
            if let Err(e) = self
                .catalog
                .mark_schedule_run(&schedule.project_id, schedule.backup_type, now)
                .await
            {
                warn!(project_id = %schedule.project_id, error = %e, "Failed to mark schedule run");
                continue;
            }
            match self
                .start_backup(schedule.backup_config(), Some(schedule.frequency))
                .await
            {
                Ok(info) => started.push(info),
                Err(e) => warn!(
                    project_id = %schedule.project_id,
                    backup_type = %schedule.backup_type,
                    error = %e,
                    "Scheduled backup could not start"
                ),
            }
        }
        started
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    /// Write a portable FULL archive of a project to `dest`.
    pub async fn export_project(
        &self,
        project_id: &str,
        dest: &Path,
        encrypt: bool,
    ) -> Result<ArtifactManifest> {
        let key = if encrypt {
            Some(self.config.encryption_key.as_ref().ok_or_else(|| {
                Error::InvalidRequest(
                    "encryption requested but no backup encryption secret is configured".into(),
                )
            })?)
        } else {
            None
        };
        let captured = self.capture(project_id, BackupType::Full.contents()).await?;
        let artifact = Artifact {
            manifest: ArtifactManifest {
                format_version: FORMAT_VERSION,
                backup_id: format!("export-{}", Uuid::new_v4()),
                project_id: project_id.to_string(),
                backup_type: BackupType::Full,
                base_backup_id: None,
                created_at: Utc::now(),
                removed_files: Vec::new(),
            },
            database: captured.database,
            files: captured.files,
            config: Some(captured.config),
            services: Some(captured.manifest),
        };
        let sealed = artifact::seal(&artifact, true, key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &sealed).await?;
        info!(project_id, path = %dest.display(), size = sealed.len(), "Project exported");
        Ok(artifact.manifest)
    }

    /// Create a project from an exported archive and restore its data.
    ///
    /// Returns the restore record in `RESTORING` once the project has been
    /// accepted. The rest runs on the task pool: wait for the project to
    /// become active, register the archive as a completed backup of it, and
    /// replay that backup.
    pub async fn import_project(
        self: &Arc<Self>,
        archive: &Path,
        options: ImportOptions,
    ) -> Result<RestoreInfo> {
        let bytes = tokio::fs::read(archive).await?;
        let encrypted = artifact::is_encrypted(&bytes);
        let mut artifact = artifact::open(&bytes, self.config.encryption_key.as_ref())?;
        if artifact.manifest.backup_type != BackupType::Full {
            return Err(Error::InvalidRequest(format!(
                "archive holds a {} backup, imports need a full export",
                artifact.manifest.backup_type
            )));
        }
        let Some(mut config) = artifact.config.take() else {
            return Err(Error::InvalidRequest("archive carries no project config".into()));
        };
        if let Some(project_id) = options.project_id {
            config.project_id = project_id;
        }
        let ports = match options.ports {
            Some(ports) => ports,
            None => self.orchestrator.allocate_ports().await?,
        };
        config.db_port = ports.db_port;
        config.api_port = ports.api_port;
        if config.studio_port != 0 {
            config.studio_port = ports.studio_port;
        }
        let project_id = config.project_id.clone();

        self.orchestrator.create_project(config.clone()).await?;

        let backup_id = Uuid::new_v4().to_string();
        let info = RestoreInfo {
            restore_id: Uuid::new_v4().to_string(),
            backup_id: backup_id.clone(),
            project_id: project_id.clone(),
            restore_type: BackupType::Full,
            status: RestoreStatus::Restoring,
            progress: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.catalog.insert_restore(info.clone()).await?;
        info!(project_id = %project_id, restore_id = %info.restore_id, "Import started");

        artifact.config = Some(config);
        let import = Import {
            restore_id: info.restore_id.clone(),
            backup_id,
            project_id,
            artifact,
            encrypted,
        };
        let restore_id = info.restore_id.clone();
        let this = self.clone();
        let on_failure = {
            let this = self.clone();
            let restore_id = restore_id.clone();
            move |reason: String| async move { this.record_restore_failure(&restore_id, reason).await }
        };
        self.orchestrator.tasks().spawn(
            "import",
            restore_id,
            async move { this.run_import(import).await },
            on_failure,
        );
        Ok(info)
    }

    async fn run_import(&self, import: Import) {
        let Import {
            restore_id,
            backup_id,
            project_id,
            artifact,
            encrypted,
        } = import;
        let entry = match self
            .register_import(&backup_id, &project_id, artifact, encrypted)
            .await
        {
            Ok(entry) => entry,
            // The project never became usable; it keeps its own error.
            Err(e) => {
                self.record_restore_failure(&restore_id, e.to_string()).await;
                return;
            }
        };
        let mut restore = RestoreConfig::new(backup_id, BackupType::Full);
        restore.project_id = Some(project_id.clone());
        restore.overwrite_data = true;
        match self
            .execute_restore(&restore_id, &restore, std::slice::from_ref(&entry), &project_id)
            .await
        {
            Ok(()) => self.finish_restore(&restore_id).await,
            Err(e) => self.fail_restore(&restore_id, &project_id, e.to_string()).await,
        }
    }

    /// Wait for an imported project to settle, then store its archive as a
    /// completed FULL backup of it.
    async fn register_import(
        &self,
        backup_id: &str,
        project_id: &str,
        mut artifact: Artifact,
        encrypted: bool,
    ) -> Result<BackupEntry> {
        let project = self.wait_settled(project_id).await?;
        if !project.status.is_active() {
            return Err(Error::provisioning(
                project_id,
                "import_project",
                Error::InvalidRequest(
                    project
                        .error_message
                        .unwrap_or_else(|| format!("project ended {}", project.status)),
                ),
            ));
        }

        let slot = self.orchestrator.slot(project_id).await?;
        let manifest = slot.read().await.manifest.clone();
        artifact.manifest.backup_id = backup_id.to_string();
        artifact.manifest.project_id = project_id.to_string();
        artifact.services = Some(manifest);
        let index = ContentIndex::of(artifact.database.as_deref(), &artifact.files);
        let key = self.config.encryption_key.as_ref().filter(|_| encrypted);
        let sealed = artifact::seal(&artifact, true, key)?;

        self.catalog
            .insert_backup(BackupInfo {
                backup_id: backup_id.to_string(),
                project_id: project_id.to_string(),
                backup_type: BackupType::Full,
                status: BackupStatus::Creating,
                size: 0,
                compression: true,
                encryption: encrypted,
                file_path: None,
                s3_key: None,
                base_backup_id: None,
                checksum: None,
                error_message: None,
                scheduled: false,
                created_at: Utc::now(),
                completed_at: None,
                expires_at: None,
            })
            .await?;
        let local_key = artifact_key(project_id, backup_id, true, encrypted);
        let stored = match self.store_artifact(backup_id, local_key, None, &sealed).await {
            Ok(stored) => stored,
            Err(e) => {
                self.fail_backup(backup_id, e.to_string()).await;
                return Err(e);
            }
        };
        let completed_at = Utc::now();
        let expires_at = expiry(completed_at, chrono::Duration::days(1), 0);
        self.finish_backup(backup_id, stored, index, completed_at, expires_at)
            .await?;
        info!(project_id, backup_id, "Imported archive registered");
        self.catalog
            .entry(backup_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Backup, backup_id))
    }

    async fn wait_settled(&self, project_id: &str) -> Result<ProjectInfo> {
        let config = self.orchestrator.config();
        let limit = config.probe_timeout + config.operation_timeout;
        let started = tokio::time::Instant::now();
        loop {
            let info = self.orchestrator.get_project_info(project_id).await?;
            if info.status != ProjectStatus::Creating {
                return Ok(info);
            }
            if started.elapsed() >= limit {
                return Err(Error::Timeout {
                    operation: format!("import of project {project_id}"),
                    elapsed: limit,
                });
            }
            tokio::time::sleep(config.probe_interval).await;
        }
    }

    /// Fail interrupted operations from a previous process and clear the
    /// scratch directory.
    pub async fn recover(&self) -> Result<Interrupted> {
        let interrupted = self.catalog.recover().await?;
        for restore in &interrupted.restores {
            let Ok(lease) = self.orchestrator.lease(&restore.project_id).await else {
                continue;
            };
            if let Err(e) = self
                .orchestrator
                .mark_restore_failed(&lease, "restore interrupted by provisioner restart")
                .await
            {
                warn!(project_id = %restore.project_id, error = %e, "Failed to flag interrupted restore");
            }
        }
        match tokio::fs::remove_dir_all(&self.config.work_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.config.work_dir.display(), error = %e, "Failed to clear backup scratch directory"),
        }
        Ok(interrupted)
    }

    // ========================================================================
    // Capture and transport
    // ========================================================================

    /// Run the dump and archive tools of a project.
    async fn capture(&self, project_id: &str, contents: BackupContents) -> Result<Captured> {
        let slot = self.orchestrator.slot(project_id).await?;
        let lease: Option<ProjectLease> = if slot.status().await == ProjectStatus::Paused {
            Some(self.orchestrator.lease(project_id).await?)
        } else {
            None
        };
        let _guard = slot.backup_lock().await;
        if slot.is_removed() {
            return Err(Error::not_found(ResourceKind::Project, project_id));
        }
        let (status, containers, config, manifest) = {
            let entry = slot.read().await;
            (
                entry.info.status,
                entry.info.containers.clone(),
                entry.config.clone(),
                entry.manifest.clone(),
            )
        };
        if !can_capture(status) {
            return Err(Error::InvalidState {
                project_id: project_id.to_string(),
                status,
                operation: "backup",
            });
        }
        let maintenance = lease.as_ref().filter(|_| status == ProjectStatus::Paused);
        if let Some(lease) = maintenance {
            self.orchestrator
                .start_services(lease, &data_services())
                .await?;
        }

        let captured = self.dump(project_id, &containers, contents).await;

        if let Some(lease) = maintenance
            && let Err(e) = self.orchestrator.stop_services(lease, &data_services()).await
        {
            warn!(project_id, error = %e, "Failed to stop data services after capture");
        }
        let (database, files) = captured?;
        Ok(Captured {
            database,
            files,
            config,
            manifest,
        })
    }

    async fn dump(
        &self,
        project_id: &str,
        containers: &BTreeMap<String, String>,
        contents: BackupContents,
    ) -> Result<(Option<Vec<u8>>, BTreeMap<String, Vec<u8>>)> {
        let database = if contents.database {
            Some(
                self.exec(
                    project_id,
                    containers,
                    DB_SERVICE,
                    "dump_database",
                    &dump_database_command(),
                    None,
                )
                .await?,
            )
        } else {
            None
        };
        let files = if contents.storage {
            let archive = self
                .exec(
                    project_id,
                    containers,
                    STORAGE_SERVICE,
                    "archive_storage",
                    &archive_storage_command(),
                    None,
                )
                .await?;
            artifact::read_tree(&archive)?
        } else {
            BTreeMap::new()
        };
        Ok((database, files))
    }

    /// Run a tool in a service container and return its stdout.
    async fn exec(
        &self,
        project_id: &str,
        containers: &BTreeMap<String, String>,
        service: &str,
        operation: &'static str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let container_id = containers
            .get(service)
            .ok_or_else(|| Error::ServiceNotFound {
                project_id: project_id.to_string(),
                service: service.to_string(),
            })?;
        let adapter = self.orchestrator.adapter();
        let attempt = self
            .orchestrator
            .config()
            .retry
            .run(operation, || adapter.exec(container_id, command, stdin.clone()));
        let output = tokio::time::timeout(self.config.exec_timeout, attempt)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("{operation} in {project_id}/{service}"),
                elapsed: self.config.exec_timeout,
            })??;
        if !output.success() {
            let message = output.combined();
            return Err(Error::provisioning(
                project_id,
                operation,
                RuntimeError::command(operation, message.trim()).into(),
            ));
        }
        Ok(output.stdout)
    }

    /// Store a sealed artifact locally and, when asked, remotely.
    async fn store_artifact(
        &self,
        backup_id: &str,
        local_key: String,
        remote_key: Option<String>,
        sealed: &[u8],
    ) -> Result<Stored> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let tmp = self.config.work_dir.join(format!("{backup_id}.part"));
        tokio::fs::write(&tmp, sealed).await?;

        let uploaded: Result<u64> = async {
            let size = self.local.upload(&tmp, &local_key).await?;
            if let (Some(remote), Some(key)) = (&self.remote, &remote_key)
                && let Err(e) = remote.upload(&tmp, key).await
            {
                self.delete_artifacts(Some(&local_key), None).await;
                return Err(e.into());
            }
            Ok(size)
        }
        .await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "Failed to remove scratch artifact");
        }

        Ok(Stored {
            size: uploaded?,
            checksum: digest(sealed),
            local_key,
            remote_key: remote_key.filter(|_| self.remote.is_some()),
        })
    }

    /// Fetch, verify and open a stored artifact.
    async fn load_artifact(&self, entry: &BackupEntry) -> Result<Artifact> {
        let backup_id = &entry.info.backup_id;
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        let tmp = self
            .config
            .work_dir
            .join(format!("{backup_id}.{}.fetch", Uuid::new_v4()));
        let local_present = match &entry.local_key {
            Some(key) => self.local.path_for(key)?.exists(),
            None => false,
        };
        let fetched = match (&entry.local_key, &self.remote, &entry.info.s3_key) {
            (Some(key), _, _) if local_present => self.local.download(key, &tmp).await,
            (_, Some(remote), Some(key)) => remote.download(key, &tmp).await,
            (Some(key), _, _) => self.local.download(key, &tmp).await,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "backup {backup_id} has no stored artifact"
                )));
            }
        };
        fetched?;
        let bytes = tokio::fs::read(&tmp).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "Failed to remove fetched artifact");
        }
        let bytes = bytes?;
        if entry
            .info
            .checksum
            .as_deref()
            .is_some_and(|sum| sum != digest(&bytes))
        {
            return Err(artifact::ArtifactError::Corrupt(format!(
                "checksum mismatch for backup {backup_id}"
            ))
            .into());
        }
        Ok(artifact::open(&bytes, self.config.encryption_key.as_ref())?)
    }

    async fn delete_artifacts(&self, local_key: Option<&str>, remote_key: Option<&str>) {
        if let Some(key) = local_key
            && let Err(e) = self.local.delete(key).await
        {
            warn!(key, error = %e, "Failed to delete local artifact");
        }
        if let (Some(remote), Some(key)) = (&self.remote, remote_key)
            && let Err(e) = remote.delete(key).await
        {
            warn!(key, error = %e, "Failed to delete remote artifact");
        }
    }
}

/// Whether a project in `status` has data that can be captured or written.
fn can_capture(status: ProjectStatus) -> bool {
    status.is_active() || status == ProjectStatus::Paused
}

/// Services started while a paused project is backed up or restored.
fn data_services() -> Vec<String> {
    vec![DB_SERVICE.to_string(), STORAGE_SERVICE.to_string()]
}

/// Local artifact key: `{project}/{backup}.tar[.gz][.enc]`.
fn artifact_key(project_id: &str, backup_id: &str, compressed: bool, encrypted: bool) -> String {
    let mut key = format!("{project_id}/{backup_id}.tar");
    if compressed {
        key.push_str(".gz");
    }
    if encrypted {
        key.push_str(".enc");
    }
    key
}

fn remote_key(prefix: Option<&str>, local_key: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{local_key}"),
        None => local_key.to_string(),
    }
}

/// `completed_at + max(retention, 1) * period`, or none on overflow.
fn expiry(completed_at: DateTime<Utc>, period: chrono::Duration, retention: u32) -> Option<DateTime<Utc>> {
    let units = i32::try_from(retention.max(1)).ok()?;
    period
        .checked_mul(units)
        .and_then(|d| completed_at.checked_add_signed(d))
}
