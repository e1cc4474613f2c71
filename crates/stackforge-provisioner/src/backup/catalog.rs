// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable catalog of backups, restores and schedules.
//!
//! The catalog is a single JSON document rewritten atomically (temp file and
//! rename) after every change. Changes are applied to a copy that becomes
//! current only once it is on disk, so a failed write changes nothing. It
//! enforces record immutability: a backup or
//! restore that reached a terminal status rejects further updates, and a
//! restore's progress never goes down.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::artifact::ContentIndex;
use super::types::{BackupInfo, BackupSchedule, BackupStatus, BackupType, RestoreInfo, RestoreStatus};
use crate::error::{Error, Result};

/// A backup record with engine bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Public record.
    pub info: BackupInfo,
    /// Content digests, set on completion.
    #[serde(default)]
    pub index: Option<ContentIndex>,
    /// Key of the artifact in local storage.
    #[serde(default)]
    pub local_key: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    backups: BTreeMap<String, BackupEntry>,
    #[serde(default)]
    restores: BTreeMap<String, RestoreInfo>,
    #[serde(default)]
    schedules: Vec<BackupSchedule>,
}

/// Records that were in flight when the process stopped.
#[derive(Debug, Default)]
pub struct Interrupted {
    /// Backups marked failed.
    pub backups: Vec<BackupInfo>,
    /// Restores marked failed.
    pub restores: Vec<RestoreInfo>,
}

/// Backup catalog, optionally persisted to a JSON file.
pub struct BackupCatalog {
    path: Option<PathBuf>,
    data: Mutex<CatalogData>,
}

impl BackupCatalog {
    /// Catalog that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(CatalogData::default()),
        }
    }

    /// Load the catalog at `path`, starting empty when the file is absent.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogData::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "Backup catalog loaded");
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    async fn save(&self, data: &CatalogData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(data)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Apply `f` to a copy of the catalog, persist the copy, then make it
    /// current. Nothing changes when `f` or the write fails.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut CatalogData) -> Result<T>,
    {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        let out = f(&mut next)?;
        self.save(&next).await?;
        *data = next;
        Ok(out)
    }

    /// Add a new backup record.
    pub async fn insert_backup(&self, info: BackupInfo) -> Result<()> {
        self.transact(|data| {
            data.backups.insert(
                info.backup_id.clone(),
                BackupEntry {
                    info,
                    index: None,
                    local_key: None,
                },
            );
            Ok(())
        })
        .await
    }

    /// Modify a backup that has not reached a terminal status.
    pub async fn update_backup<F>(&self, backup_id: &str, f: F) -> Result<BackupInfo>
    where
        F: FnOnce(&mut BackupEntry),
    {
        self.transact(|data| {
            let entry = data
                .backups
                .get_mut(backup_id)
                .ok_or_else(|| Error::not_found(crate::error::ResourceKind::Backup, backup_id))?;
            if entry.info.status.is_terminal() {
                return Err(Error::InvalidRequest(format!(
                    "backup {backup_id} is {} and can no longer change",
                    entry.info.status
                )));
            }
            f(entry);
            Ok(entry.info.clone())
        })
        .await
    }

    /// Backup record by id.
    pub async fn get_backup(&self, backup_id: &str) -> Option<BackupInfo> {
        self.data
            .lock()
            .await
            .backups
            .get(backup_id)
            .map(|e| e.info.clone())
    }

    /// Backup record with bookkeeping by id.
    pub async fn entry(&self, backup_id: &str) -> Option<BackupEntry> {
        self.data.lock().await.backups.get(backup_id).cloned()
    }

    /// Backups, oldest first, optionally for one project.
    pub async fn list_backups(&self, project_id: Option<&str>) -> Vec<BackupInfo> {
        let data = self.data.lock().await;
        let mut backups: Vec<BackupInfo> = data
            .backups
            .values()
            .filter(|e| project_id.is_none_or(|p| e.info.project_id == p))
            .map(|e| e.info.clone())
            .collect();
        backups.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        backups
    }

    /// Newest completed backup of a project among the given types.
    pub async fn latest_completed(&self, project_id: &str, types: &[BackupType]) -> Option<BackupEntry> {
        let data = self.data.lock().await;
        data.backups
            .values()
            .filter(|e| {
                e.info.project_id == project_id
                    && e.info.status == BackupStatus::Completed
                    && types.contains(&e.info.backup_type)
            })
            .max_by_key(|e| (e.info.completed_at, e.info.created_at))
            .cloned()
    }

    /// A completed or in-flight backup whose base is `backup_id`, if any.
    /// Failed incrementals never pin their base.
    pub async fn dependent_of(&self, backup_id: &str) -> Option<String> {
        let data = self.data.lock().await;
        data.backups
            .values()
            .find(|e| {
                e.info.base_backup_id.as_deref() == Some(backup_id)
                    && matches!(e.info.status, BackupStatus::Completed | BackupStatus::Creating)
            })
            .map(|e| e.info.backup_id.clone())
    }

    /// Remove a backup record.
    pub async fn remove_backup(&self, backup_id: &str) -> Result<Option<BackupEntry>> {
        if !self.data.lock().await.backups.contains_key(backup_id) {
            return Ok(None);
        }
        self.transact(|data| Ok(data.backups.remove(backup_id))).await
    }

    /// Add a new restore record.
    pub async fn insert_restore(&self, info: RestoreInfo) -> Result<()> {
        self.transact(|data| {
            data.restores.insert(info.restore_id.clone(), info);
            Ok(())
        })
        .await
    }

    /// Modify a restore that has not reached a terminal status. Progress is
    /// clamped so it never decreases.
    pub async fn update_restore<F>(&self, restore_id: &str, f: F) -> Result<RestoreInfo>
    where
        F: FnOnce(&mut RestoreInfo),
    {
        self.transact(|data| {
            let info = data
                .restores
                .get_mut(restore_id)
                .ok_or_else(|| Error::not_found(crate::error::ResourceKind::Restore, restore_id))?;
            if info.status.is_terminal() {
                return Err(Error::InvalidRequest(format!(
                    "restore {restore_id} is {} and can no longer change",
                    info.status
                )));
            }
            let progress = info.progress;
            f(info);
            info.progress = info.progress.max(progress).min(100);
            Ok(info.clone())
        })
        .await
    }

    /// Restore record by id.
    pub async fn get_restore(&self, restore_id: &str) -> Option<RestoreInfo> {
        self.data.lock().await.restores.get(restore_id).cloned()
    }

    /// Insert or replace the schedule for `(project_id, backup_type)`.
    pub async fn upsert_schedule(&self, schedule: BackupSchedule) -> Result<BackupSchedule> {
        self.transact(|data| {
            Ok(match data.schedules.iter_mut().find(|s| {
                s.project_id == schedule.project_id && s.backup_type == schedule.backup_type
            }) {
                Some(existing) => {
                    let created_at = existing.created_at;
                    let last_run_at = existing.last_run_at;
                    *existing = BackupSchedule {
                        created_at,
                        last_run_at: schedule.last_run_at.or(last_run_at),
                        ..schedule
                    };
                    existing.clone()
                }
                None => {
                    data.schedules.push(schedule.clone());
                    schedule
                }
            })
        })
        .await
    }

    /// Schedule for `(project_id, backup_type)`.
    pub async fn schedule(&self, project_id: &str, backup_type: BackupType) -> Option<BackupSchedule> {
        self.data
            .lock()
            .await
            .schedules
            .iter()
            .find(|s| s.project_id == project_id && s.backup_type == backup_type)
            .cloned()
    }

    /// Schedules, optionally for one project.
    pub async fn schedules(&self, project_id: Option<&str>) -> Vec<BackupSchedule> {
        self.data
            .lock()
            .await
            .schedules
            .iter()
            .filter(|s| project_id.is_none_or(|p| s.project_id == p))
            .cloned()
            .collect()
    }

    /// Record that a schedule fired.
    pub async fn mark_schedule_run(
        &self,
        project_id: &str,
        backup_type: BackupType,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.transact(|data| {
            let schedule = data
                .schedules
                .iter_mut()
                .find(|s| s.project_id == project_id && s.backup_type == backup_type)
                .ok_or_else(|| {
                    Error::not_found(
                        crate::error::ResourceKind::Schedule,
                        format!("{project_id}/{backup_type}"),
                    )
                })?;
            schedule.last_run_at = Some(at);
            Ok(())
        })
        .await
    }

    /// Fail every backup and restore left in flight by a previous process.
    pub async fn recover(&self) -> Result<Interrupted> {
        let now = Utc::now();
        let interrupted = self
            .transact(|data| {
                let mut interrupted = Interrupted::default();
                for entry in data.backups.values_mut() {
                    if entry.info.status == BackupStatus::Creating {
                        entry.info.status = BackupStatus::Failed;
                        entry.info.error_message = Some("interrupted by provisioner restart".into());
                        entry.info.completed_at = Some(now);
                        interrupted.backups.push(entry.info.clone());
                    }
                }
                for info in data.restores.values_mut() {
                    if info.status == RestoreStatus::Restoring {
                        info.status = RestoreStatus::Failed;
                        info.error_message = Some("interrupted by provisioner restart".into());
                        info.completed_at = Some(now);
                        interrupted.restores.push(info.clone());
                    }
                }
                Ok(interrupted)
            })
            .await?;
        if !interrupted.backups.is_empty() || !interrupted.restores.is_empty() {
            warn!(
                backups = interrupted.backups.len(),
                restores = interrupted.restores.len(),
                "Marked interrupted backup operations as failed"
            );
        }
        Ok(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::ScheduleFrequency;

    fn backup(id: &str) -> BackupInfo {
        BackupInfo {
            backup_id: id.to_string(),
            project_id: "p1".to_string(),
            backup_type: BackupType::Full,
            status: BackupStatus::Creating,
            size: 0,
            compression: false,
            encryption: false,
            file_path: None,
            s3_key: None,
            base_backup_id: None,
            checksum: None,
            error_message: None,
            scheduled: false,
            created_at: Utc::now(),
            completed_at: None,
            expires_at: None,
        }
    }

    fn restore(id: &str) -> RestoreInfo {
        RestoreInfo {
            restore_id: id.to_string(),
            backup_id: "b1".to_string(),
            project_id: "p1".to_string(),
            restore_type: BackupType::Full,
            status: RestoreStatus::Restoring,
            progress: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_terminal_backup_is_immutable() {
        let catalog = BackupCatalog::in_memory();
        catalog.insert_backup(backup("b1")).await.unwrap();
        catalog
            .update_backup("b1", |e| e.info.status = BackupStatus::Completed)
            .await
            .unwrap();
        let err = catalog
            .update_backup("b1", |e| e.info.size = 42)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(catalog.get_backup("b1").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_restore_progress_is_monotonic() {
        let catalog = BackupCatalog::in_memory();
        catalog.insert_restore(restore("r1")).await.unwrap();
        catalog.update_restore("r1", |r| r.progress = 60).await.unwrap();
        let info = catalog.update_restore("r1", |r| r.progress = 30).await.unwrap();
        assert_eq!(info.progress, 60);
    }

    #[tokio::test]
    async fn test_persisted_and_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        {
            let catalog = BackupCatalog::open(&path).await.unwrap();
            catalog.insert_backup(backup("b1")).await.unwrap();
            catalog.insert_restore(restore("r1")).await.unwrap();
        }
        let catalog = BackupCatalog::open(&path).await.unwrap();
        let interrupted = catalog.recover().await.unwrap();
        assert_eq!(interrupted.backups.len(), 1);
        assert_eq!(interrupted.restores.len(), 1);
        assert_eq!(catalog.get_backup("b1").await.unwrap().status, BackupStatus::Failed);
        assert_eq!(catalog.get_restore("r1").await.unwrap().status, RestoreStatus::Failed);
    }

    #[tokio::test]
    async fn test_one_schedule_per_project_and_type() {
        let catalog = BackupCatalog::in_memory();
        let s = BackupSchedule::new("p1", BackupType::Full, ScheduleFrequency::Daily, "02:00");
        catalog.upsert_schedule(s.clone()).await.unwrap();
        catalog
            .upsert_schedule(BackupSchedule {
                time: "03:00".into(),
                ..s
            })
            .await
            .unwrap();
        let schedules = catalog.schedules(Some("p1")).await;
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].time, "03:00");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_catalog_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = BackupCatalog::open(&path).await.unwrap();
        catalog.insert_backup(backup("b1")).await.unwrap();

        // A directory in place of the temp file makes the write fail.
        let tmp = dir.path().join("catalog.json.tmp");
        std::fs::create_dir(&tmp).unwrap();
        let result = catalog
            .update_backup("b1", |e| e.info.status = BackupStatus::Completed)
            .await;
        assert!(result.is_err());
        assert_eq!(catalog.get_backup("b1").await.unwrap().status, BackupStatus::Creating);
        assert!(catalog.insert_backup(backup("b2")).await.is_err());
        assert!(catalog.get_backup("b2").await.is_none());

        std::fs::remove_dir(&tmp).unwrap();
        let info = catalog
            .update_backup("b1", |e| e.info.status = BackupStatus::Failed)
            .await
            .unwrap();
        assert_eq!(info.status, BackupStatus::Failed);
        let reloaded = BackupCatalog::open(&path).await.unwrap();
        assert_eq!(reloaded.get_backup("b1").await.unwrap().status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_only_live_incrementals_pin_their_base() {
        let catalog = BackupCatalog::in_memory();
        let mut base = backup("base");
        base.status = BackupStatus::Completed;
        catalog.insert_backup(base).await.unwrap();
        let mut inc = backup("inc");
        inc.backup_type = BackupType::Incremental;
        inc.base_backup_id = Some("base".into());
        catalog.insert_backup(inc).await.unwrap();

        assert_eq!(catalog.dependent_of("base").await.as_deref(), Some("inc"));

        catalog
            .update_backup("inc", |e| e.info.status = BackupStatus::Failed)
            .await
            .unwrap();
        assert_eq!(catalog.dependent_of("base").await, None);
    }
}
