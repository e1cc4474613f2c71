// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota data model: plans, limits, observed usage and derived status.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Named tier that selects default [`ResourceQuotas`].
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum QuotaPlan {
    /// Free tier.
    #[default]
    Free,
    /// Starter tier.
    Starter,
    /// Pro tier.
    Pro,
    /// No limits.
    Enterprise,
    /// Caller-supplied limits.
    Custom,
}

/// Per-project ceilings. Zero in any field means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceQuotas {
    /// Database size in bytes.
    pub database_size: u64,
    /// File storage size in bytes.
    pub storage_size: u64,
    /// Total size of backup artifacts in bytes.
    pub backup_size: u64,
    /// Database + storage + backups in bytes.
    pub total_disk_size: u64,
    /// CPU in millicores.
    pub cpu_millicores: u64,
    /// Memory in bytes.
    pub memory: u64,
    /// Monthly egress in bytes.
    pub bandwidth: u64,
    /// API requests per hour.
    pub requests_per_hour: u64,
    /// Concurrent database connections.
    pub connections: u64,
    /// Number of retained backups.
    pub max_backups: u64,
    /// Number of auth users.
    pub max_users: u64,
    /// Number of tables in the public schema.
    pub max_tables: u64,
    /// Largest single uploaded file in bytes.
    pub max_file_size: u64,
}

impl ResourceQuotas {
    /// Default quotas for a plan. `Custom` starts from the free tier.
    pub fn for_plan(plan: QuotaPlan) -> Self {
        match plan {
            QuotaPlan::Free | QuotaPlan::Custom => Self {
                database_size: 500 * MB,
                storage_size: GB,
                backup_size: 2 * GB,
                total_disk_size: 3 * GB,
                cpu_millicores: 500,
                memory: 512 * MB,
                bandwidth: 10 * GB,
                requests_per_hour: 1_000,
                connections: 10,
                max_backups: 3,
                max_users: 100,
                max_tables: 50,
                max_file_size: 10 * MB,
            },
            QuotaPlan::Starter => Self {
                database_size: 2 * GB,
                storage_size: 5 * GB,
                backup_size: 10 * GB,
                total_disk_size: 15 * GB,
                cpu_millicores: 1_000,
                memory: GB,
                bandwidth: 50 * GB,
                requests_per_hour: 10_000,
                connections: 50,
                max_backups: 7,
                max_users: 1_000,
                max_tables: 200,
                max_file_size: 50 * MB,
            },
            QuotaPlan::Pro => Self {
                database_size: 10 * GB,
                storage_size: 50 * GB,
                backup_size: 100 * GB,
                total_disk_size: 150 * GB,
                cpu_millicores: 2_000,
                memory: 4 * GB,
                bandwidth: 500 * GB,
                requests_per_hour: 100_000,
                connections: 200,
                max_backups: 30,
                max_users: 0,
                max_tables: 0,
                max_file_size: 500 * MB,
            },
            QuotaPlan::Enterprise => Self::default(),
        }
    }

    /// Limit for one dimension.
    pub fn limit(&self, resource: QuotaResource) -> u64 {
        match resource {
            QuotaResource::DatabaseSize => self.database_size,
            QuotaResource::StorageSize => self.storage_size,
            QuotaResource::BackupSize => self.backup_size,
            QuotaResource::TotalDiskSize => self.total_disk_size,
            QuotaResource::Cpu => self.cpu_millicores,
            QuotaResource::Memory => self.memory,
            QuotaResource::Bandwidth => self.bandwidth,
            QuotaResource::Requests => self.requests_per_hour,
            QuotaResource::Connections => self.connections,
            QuotaResource::Backups => self.max_backups,
            QuotaResource::Users => self.max_users,
            QuotaResource::Tables => self.max_tables,
            QuotaResource::FileSize => self.max_file_size,
        }
    }
}

/// Latest observed consumption of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Project measured.
    pub project_id: String,
    /// Database size in bytes.
    pub database_size: u64,
    /// File storage size in bytes.
    pub storage_size: u64,
    /// Size of completed backup artifacts in bytes.
    pub backup_size: u64,
    /// Always `database_size + storage_size + backup_size`.
    pub total_disk_size: u64,
    /// CPU in millicores across the project's containers.
    pub cpu_millicores: u64,
    /// Memory in bytes across the project's containers.
    pub memory: u64,
    /// Egress in bytes.
    pub bandwidth: u64,
    /// API requests in the last hour.
    pub requests_last_hour: u64,
    /// Open database connections.
    pub connections: u64,
    /// Completed backups.
    pub backup_count: u64,
    /// Auth users.
    pub user_count: u64,
    /// Tables in the public schema.
    pub table_count: u64,
    /// When the measurement was taken (`None` before the first one).
    pub measured_at: Option<DateTime<Utc>>,
}

impl QuotaUsage {
    /// Zero usage for a project that has not been measured yet.
    pub fn empty(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    /// Current value of one dimension. File size has no running total.
    pub fn value(&self, resource: QuotaResource) -> u64 {
        match resource {
            QuotaResource::DatabaseSize => self.database_size,
            QuotaResource::StorageSize => self.storage_size,
            QuotaResource::BackupSize => self.backup_size,
            QuotaResource::TotalDiskSize => self.total_disk_size,
            QuotaResource::Cpu => self.cpu_millicores,
            QuotaResource::Memory => self.memory,
            QuotaResource::Bandwidth => self.bandwidth,
            QuotaResource::Requests => self.requests_last_hour,
            QuotaResource::Connections => self.connections,
            QuotaResource::Backups => self.backup_count,
            QuotaResource::Users => self.user_count,
            QuotaResource::Tables => self.table_count,
            QuotaResource::FileSize => 0,
        }
    }
}

/// One quota dimension.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaResource {
    /// Database size.
    DatabaseSize,
    /// File storage size.
    StorageSize,
    /// Backup artifact size.
    BackupSize,
    /// Combined disk usage.
    TotalDiskSize,
    /// CPU.
    Cpu,
    /// Memory.
    Memory,
    /// Bandwidth.
    Bandwidth,
    /// Requests per hour.
    Requests,
    /// Database connections.
    Connections,
    /// Backup count.
    Backups,
    /// Auth users.
    Users,
    /// Tables.
    Tables,
    /// Single file size.
    FileSize,
}

/// Growth operations gated by [`QuotaManager::enforce_quotas`](super::QuotaManager::enforce_quotas).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaOperation {
    /// File upload of `size` bytes.
    Upload,
    /// Backup of roughly `size` bytes.
    Backup,
    /// New auth user.
    CreateUser,
    /// New table.
    CreateTable,
    /// Database growth of `size` bytes.
    DatabaseWrite,
    /// New database connection.
    Connection,
}

/// Evaluation of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheck {
    /// Observed value.
    pub current: u64,
    /// Limit (0 = unlimited).
    pub limit: u64,
    /// `current / limit` in percent (0 when unlimited).
    pub used_percent: f64,
    /// Above the block threshold.
    pub exceeded: bool,
    /// At or above the warning threshold.
    pub warning: bool,
}

/// Quota status derived from limits and usage. Never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Project evaluated.
    pub project_id: String,
    /// Plan in effect.
    pub plan: QuotaPlan,
    /// Any dimension exceeded.
    pub exceeded: bool,
    /// Human-readable warnings, one per warning dimension.
    pub warnings: Vec<String>,
    /// Human-readable errors, one per exceeded dimension.
    pub errors: Vec<String>,
    /// Per-dimension evaluation.
    pub checks: BTreeMap<QuotaResource, QuotaCheck>,
    /// Usage the status was derived from.
    pub usage: QuotaUsage,
}

/// A threshold crossed by an allowed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaWarning {
    /// Dimension that crossed the warning threshold.
    pub resource: QuotaResource,
    /// Value after the operation.
    pub value: u64,
    /// Limit for the dimension.
    pub limit: u64,
    /// `value / limit` in percent.
    pub used_percent: f64,
}

/// Outcome of an allowed operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaDecision {
    /// Warnings for the caller to relay.
    pub warnings: Vec<QuotaWarning>,
}

impl QuotaDecision {
    /// Whether the caller has anything to relay.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// What happens when a quota threshold is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaEnforcement {
    /// Percentage at which a warning is raised.
    pub warn_at_percent: f64,
    /// Percentage above which operations are blocked.
    pub block_at_percent: f64,
    /// Log breaches for operators.
    pub notify_admin: bool,
    /// Surface breaches to the tenant (through the returned warnings).
    pub notify_user: bool,
    /// Pause projects that stay over quota past the grace period.
    pub pause_project: bool,
    /// Block uploads over storage quotas (otherwise warn).
    pub block_uploads: bool,
    /// Block backups over backup quotas (otherwise warn).
    pub block_backups: bool,
    /// Block user creation over the user quota (otherwise warn).
    pub block_new_users: bool,
}

impl Default for QuotaEnforcement {
    fn default() -> Self {
        Self {
            warn_at_percent: 80.0,
            block_at_percent: 100.0,
            notify_admin: true,
            notify_user: true,
            pause_project: false,
            block_uploads: true,
            block_backups: true,
            block_new_users: true,
        }
    }
}

/// Operator-level quota settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Plan used when a project does not name one.
    pub default_plan: QuotaPlan,
    /// Threshold behaviour.
    pub enforcement: QuotaEnforcement,
    /// How long a project may stay over quota before it is paused.
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            default_plan: QuotaPlan::Free,
            enforcement: QuotaEnforcement::default(),
            grace_period: Duration::from_secs(24 * 3600),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_defaults() {
        let free = ResourceQuotas::for_plan(QuotaPlan::Free);
        assert_eq!(free.database_size, 500 * MB);
        assert_eq!(free.cpu_millicores, 500);
        assert_eq!(free.max_backups, 3);

        let pro = ResourceQuotas::for_plan(QuotaPlan::Pro);
        assert_eq!(pro.max_users, 0);
        assert_eq!(pro.total_disk_size, 150 * GB);

        assert_eq!(ResourceQuotas::for_plan(QuotaPlan::Enterprise), ResourceQuotas::default());
    }

    #[test]
    fn test_plan_parses_case_insensitively() {
        assert_eq!("starter".parse::<QuotaPlan>().unwrap(), QuotaPlan::Starter);
        assert_eq!("PRO".parse::<QuotaPlan>().unwrap(), QuotaPlan::Pro);
        assert!("gold".parse::<QuotaPlan>().is_err());
    }

    #[test]
    fn test_operation_names() {
        assert_eq!("upload".parse::<QuotaOperation>().unwrap(), QuotaOperation::Upload);
        assert_eq!(
            "create_user".parse::<QuotaOperation>().unwrap(),
            QuotaOperation::CreateUser
        );
        assert_eq!(QuotaOperation::DatabaseWrite.to_string(), "database_write");
    }
}
