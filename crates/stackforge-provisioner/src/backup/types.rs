// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup, restore and schedule records.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a backup captures.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum BackupType {
    /// Database, storage files and configuration.
    Full,
    /// Logical database dump only.
    Database,
    /// Storage volume files only.
    Storage,
    /// Changes since the previous completed backup (database, files, configuration).
    Incremental,
}

/// Parts of a project a backup type holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupContents {
    /// Database dump.
    pub database: bool,
    /// Storage files.
    pub storage: bool,
    /// Configuration snapshot.
    pub config: bool,
}

impl BackupContents {
    /// Whether everything in `other` is also in `self`.
    pub fn covers(self, other: BackupContents) -> bool {
        (self.database || !other.database)
            && (self.storage || !other.storage)
            && (self.config || !other.config)
    }
}

impl BackupType {
    /// Parts captured by (or restored from) this type.
    pub fn contents(self) -> BackupContents {
        match self {
            BackupType::Full | BackupType::Incremental => BackupContents {
                database: true,
                storage: true,
                config: true,
            },
            BackupType::Database => BackupContents {
                database: true,
                storage: false,
                config: false,
            },
            BackupType::Storage => BackupContents {
                database: false,
                storage: true,
                config: false,
            },
        }
    }
}

/// Backup status. `Completed` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    /// Capture in progress.
    Creating,
    /// Artifact stored.
    Completed,
    /// Capture failed; no artifact remains.
    Failed,
}

impl BackupStatus {
    /// `Completed` or `Failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, BackupStatus::Creating)
    }
}

/// Restore status. `Completed` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreStatus {
    /// Restore in progress.
    Restoring,
    /// Data restored.
    Completed,
    /// Restore failed; the project was left `ACTIVE_UNHEALTHY`.
    Failed,
}

impl RestoreStatus {
    /// `Completed` or `Failed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RestoreStatus::Restoring)
    }
}

/// Backup request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Project to back up.
    pub project_id: String,
    /// What to capture.
    pub backup_type: BackupType,
    /// Gzip the artifact.
    #[serde(default)]
    pub compression: bool,
    /// Encrypt the artifact (requires a configured backup key).
    #[serde(default)]
    pub encryption: bool,
    /// Retention in schedule units (days for manual backups); also the
    /// number of completed backups kept by `auto_cleanup`.
    #[serde(default)]
    pub retention: u32,
    /// Delete the oldest completed backups beyond `retention` afterwards.
    #[serde(default)]
    pub auto_cleanup: bool,
    /// Also upload the artifact to remote backup storage.
    #[serde(default)]
    pub s3_upload: bool,
    /// Key prefix for the remote copy.
    #[serde(default)]
    pub s3_prefix: Option<String>,
}

impl BackupConfig {
    /// A request with every option off.
    pub fn new(project_id: impl Into<String>, backup_type: BackupType) -> Self {
        Self {
            project_id: project_id.into(),
            backup_type,
            compression: false,
            encryption: false,
            retention: 0,
            auto_cleanup: false,
            s3_upload: false,
            s3_prefix: None,
        }
    }
}

/// Backup record. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup id.
    pub backup_id: String,
    /// Project the backup was taken from.
    pub project_id: String,
    /// What the backup holds.
    pub backup_type: BackupType,
    /// Status.
    pub status: BackupStatus,
    /// Artifact size in bytes.
    pub size: u64,
    /// Artifact is gzip-compressed.
    pub compression: bool,
    /// Artifact is encrypted.
    pub encryption: bool,
    /// Local artifact path.
    pub file_path: Option<String>,
    /// Remote object key.
    pub s3_key: Option<String>,
    /// Previous backup in an incremental chain.
    pub base_backup_id: Option<String>,
    /// Hex SHA-256 of the artifact.
    pub checksum: Option<String>,
    /// Failure reason.
    pub error_message: Option<String>,
    /// Taken by a schedule.
    #[serde(default)]
    pub scheduled: bool,
    /// Request time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retention deadline.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Restore request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Backup to restore.
    pub backup_id: String,
    /// Target project (the backup's own project when absent).
    #[serde(default)]
    pub project_id: Option<String>,
    /// What to restore; must be contained in the backup.
    pub restore_type: BackupType,
    /// Pause the project for the duration of the restore.
    #[serde(default)]
    pub stop_project: bool,
    /// Wipe the storage volume before extracting files.
    #[serde(default)]
    pub overwrite_data: bool,
    /// Restore the newest backup of the chain taken at or before this time.
    #[serde(default)]
    pub point_in_time: Option<DateTime<Utc>>,
}

impl RestoreConfig {
    /// Restore everything the type covers, without pausing.
    pub fn new(backup_id: impl Into<String>, restore_type: BackupType) -> Self {
        Self {
            backup_id: backup_id.into(),
            project_id: None,
            restore_type,
            stop_project: false,
            overwrite_data: false,
            point_in_time: None,
        }
    }
}

/// Restore record. Immutable once terminal; `progress` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreInfo {
    /// Restore id.
    pub restore_id: String,
    /// Backup being restored (after point-in-time selection).
    pub backup_id: String,
    /// Target project.
    pub project_id: String,
    /// What is restored.
    pub restore_type: BackupType,
    /// Status.
    pub status: RestoreStatus,
    /// Percent complete.
    pub progress: u8,
    /// Failure reason.
    pub error_message: Option<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Schedule cadence.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ScheduleFrequency {
    /// Every hour at the minute of `time`.
    Hourly,
    /// Every day at `time`.
    Daily,
    /// Every Sunday at `time`.
    Weekly,
}

impl ScheduleFrequency {
    /// Length of one period.
    pub fn period(self) -> chrono::Duration {
        match self {
            ScheduleFrequency::Hourly => chrono::Duration::hours(1),
            ScheduleFrequency::Daily => chrono::Duration::days(1),
            ScheduleFrequency::Weekly => chrono::Duration::weeks(1),
        }
    }
}

/// Recurring backup for one (project, backup type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSchedule {
    /// Project to back up.
    pub project_id: String,
    /// What to capture.
    pub backup_type: BackupType,
    /// Cadence.
    pub frequency: ScheduleFrequency,
    /// Time of day, `HH:MM` UTC.
    pub time: String,
    /// Disabled schedules keep their record but never run.
    pub enabled: bool,
    /// Retention of the produced backups, in periods.
    #[serde(default)]
    pub retention: u32,
    /// Gzip produced artifacts.
    #[serde(default)]
    pub compression: bool,
    /// Encrypt produced artifacts.
    #[serde(default)]
    pub encryption: bool,
    /// Upload produced artifacts to remote storage.
    #[serde(default)]
    pub s3_upload: bool,
    /// Last time the schedule fired.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the schedule was first set.
    pub created_at: DateTime<Utc>,
}

impl BackupSchedule {
    /// An enabled schedule with default options.
    pub fn new(
        project_id: impl Into<String>,
        backup_type: BackupType,
        frequency: ScheduleFrequency,
        time: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            backup_type,
            frequency,
            time: time.into(),
            enabled: true,
            retention: 0,
            compression: true,
            encryption: false,
            s3_upload: false,
            last_run_at: None,
            created_at: Utc::now(),
        }
    }

    /// Parsed time of day.
    pub fn time_of_day(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.time, "%H:%M").map_err(|_| {
            Error::InvalidRequest(format!("schedule time {:?} is not HH:MM", self.time))
        })
    }

    /// Backup request issued when the schedule fires.
    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            compression: self.compression,
            encryption: self.encryption,
            retention: self.retention,
            auto_cleanup: self.retention > 0,
            s3_upload: self.s3_upload,
            ..BackupConfig::new(self.project_id.clone(), self.backup_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_type_must_be_contained() {
        let full = BackupType::Full.contents();
        assert!(full.covers(BackupType::Database.contents()));
        assert!(full.covers(BackupType::Storage.contents()));
        assert!(!BackupType::Database.contents().covers(BackupType::Full.contents()));
        assert!(!BackupType::Storage.contents().covers(BackupType::Database.contents()));
        assert!(BackupType::Incremental.contents().covers(BackupType::Full.contents()));
    }

    #[test]
    fn test_backup_type_parsing() {
        assert_eq!("full".parse::<BackupType>().unwrap(), BackupType::Full);
        assert_eq!("INCREMENTAL".parse::<BackupType>().unwrap(), BackupType::Incremental);
        assert_eq!(
            serde_json::to_string(&BackupType::Database).unwrap(),
            "\"DATABASE\""
        );
    }

    #[test]
    fn test_schedule_time_parsing() {
        let mut schedule = BackupSchedule::new("p1", BackupType::Full, ScheduleFrequency::Daily, "02:00");
        assert_eq!(schedule.time_of_day().unwrap(), NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        schedule.time = "25:00".into();
        assert!(schedule.time_of_day().is_err());
        assert_eq!("Weekly".parse::<ScheduleFrequency>().unwrap(), ScheduleFrequency::Weekly);
    }
}
