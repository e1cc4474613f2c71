// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Usage measurement from authoritative sources.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::adapter::RuntimeAdapter;
use crate::backup::{BackupCatalog, BackupStatus};
use crate::error::{Error, ResourceKind, Result};
use crate::registry::ProjectRegistry;
use crate::template::{self, DB_SERVICE};

/// One measurement of a project.
///
/// Counts that need the database running are `None` when it is not; the
/// previous value is kept for those.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSample {
    /// Database size in bytes.
    pub database_size: u64,
    /// Storage volume size in bytes.
    pub storage_size: u64,
    /// Size of completed backups in bytes.
    pub backup_size: u64,
    /// Completed backups.
    pub backup_count: u64,
    /// CPU in millicores across containers.
    pub cpu_millicores: u64,
    /// Memory in bytes across containers.
    pub memory: u64,
    /// Auth users.
    pub user_count: Option<u64>,
    /// Tables in the public schema.
    pub table_count: Option<u64>,
    /// Open database connections.
    pub connections: Option<u64>,
}

/// Source of usage measurements.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Measure one project.
    async fn measure(&self, project_id: &str) -> Result<UsageSample>;
}

const DATABASE_SIZE_SQL: &str = "SELECT pg_database_size('postgres')";
const USER_COUNT_SQL: &str = "SELECT count(*) FROM auth.users";
const TABLE_COUNT_SQL: &str =
    "SELECT count(*) FROM information_schema.tables WHERE table_schema = 'public'";
const CONNECTION_COUNT_SQL: &str = "SELECT count(*) FROM pg_stat_activity";

/// Measures projects through the runtime adapter and the backup catalog.
pub struct RuntimeUsageSource {
    registry: Arc<ProjectRegistry>,
    adapter: Arc<dyn RuntimeAdapter>,
    catalog: Arc<BackupCatalog>,
}

impl RuntimeUsageSource {
    /// Create a source over the live registry.
    pub fn new(
        registry: Arc<ProjectRegistry>,
        adapter: Arc<dyn RuntimeAdapter>,
        catalog: Arc<BackupCatalog>,
    ) -> Self {
        Self {
            registry,
            adapter,
            catalog,
        }
    }

    async fn query(&self, container_id: &str, sql: &str) -> Option<u64> {
        let output = self
            .adapter
            .exec(container_id, &template::sql_query_command(sql), None)
            .await
            .ok()?;
        if !output.success() {
            debug!(sql, stderr = %String::from_utf8_lossy(&output.stderr), "Usage query failed");
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

#[async_trait]
impl UsageSource for RuntimeUsageSource {
    async fn measure(&self, project_id: &str) -> Result<UsageSample> {
        let slot = self
            .registry
            .get(project_id)
            .await
            .ok_or_else(|| Error::not_found(ResourceKind::Project, project_id))?;
        let (containers, db_volume, storage_volume, running) = {
            let entry = slot.read().await;
            (
                entry.info.containers.clone(),
                entry.manifest.volume("db").map(str::to_string),
                entry.manifest.volume("storage").map(str::to_string),
                entry.info.status.is_active(),
            )
        };

        let mut sample = UsageSample::default();
        if let Some(volume) = &storage_volume {
            sample.storage_size = self.adapter.volume_size(project_id, volume).await?;
        }

        let db_container = containers.get(DB_SERVICE).filter(|_| running);
        let db_size = match db_container {
            Some(id) => self.query(id, DATABASE_SIZE_SQL).await,
            None => None,
        };
        sample.database_size = match (db_size, &db_volume) {
            (Some(size), _) => size,
            (None, Some(volume)) => self.adapter.volume_size(project_id, volume).await?,
            (None, None) => 0,
        };
        if let Some(id) = db_container {
            sample.user_count = self.query(id, USER_COUNT_SQL).await;
            sample.table_count = self.query(id, TABLE_COUNT_SQL).await;
            sample.connections = self.query(id, CONNECTION_COUNT_SQL).await;
        }

        if running {
            for id in containers.values() {
                if let Ok(stats) = self.adapter.stats(id).await {
                    sample.cpu_millicores += (stats.cpu_percent * 10.0).round() as u64;
                    sample.memory += stats.memory_bytes;
                }
            }
        }

        for backup in self.catalog.list_backups(Some(project_id)).await {
            if backup.status == BackupStatus::Completed {
                sample.backup_size += backup.size;
                sample.backup_count += 1;
            }
        }
        Ok(sample)
    }
}

/// Fixed measurements, for tests and embedding without a runtime.
#[derive(Debug, Default)]
pub struct StaticUsageSource {
    samples: RwLock<HashMap<String, UsageSample>>,
}

impl StaticUsageSource {
    /// Source with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sample returned for a project.
    pub async fn set(&self, project_id: &str, sample: UsageSample) {
        self.samples
            .write()
            .await
            .insert(project_id.to_string(), sample);
    }
}

#[async_trait]
impl UsageSource for StaticUsageSource {
    async fn measure(&self, project_id: &str) -> Result<UsageSample> {
        Ok(self
            .samples
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}
