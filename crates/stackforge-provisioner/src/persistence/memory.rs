// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory project store, used when no database is configured and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{NewProjectRecord, PersistenceError, ProjectRecord, ProjectStore, Result};
use crate::lifecycle::ProjectStatus;

/// Project records held in a map.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    records: RwLock<HashMap<String, ProjectRecord>>,
    fail_updates: std::sync::atomic::AtomicBool,
}

impl MemoryProjectStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make status updates fail (or succeed again).
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Status stored for a reference.
    pub async fn status(&self, project_ref: &str) -> Option<String> {
        self.records
            .read()
            .await
            .get(project_ref)
            .map(|r| r.status.clone())
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get_project_by_reference(&self, project_ref: &str) -> Result<ProjectRecord> {
        self.records
            .read()
            .await
            .get(project_ref)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(project_ref.to_string()))
    }

    async fn create_project_record(&self, record: NewProjectRecord) -> Result<ProjectRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.project_ref) {
            return Err(PersistenceError::Duplicate(record.project_ref));
        }
        let stored = ProjectRecord {
            project_ref: record.project_ref.clone(),
            project_name: record.project_name,
            organization_id: record.organization_id,
            region: record.region,
            cloud_provider: "LOCAL".to_string(),
            status: record.status.to_string(),
            jwt_secret: record.jwt_secret,
            anon_key: Some(record.anon_key),
            service_role_key: Some(record.service_role_key),
            created_at: Utc::now(),
        };
        records.insert(record.project_ref, stored.clone());
        Ok(stored)
    }

    async fn update_project_status(
        &self,
        project_ref: &str,
        status: ProjectStatus,
    ) -> Result<ProjectRecord> {
        if self.fail_updates.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Database(sqlx::Error::PoolTimedOut));
        }
        let mut records = self.records.write().await;
        let record = records
            .get_mut(project_ref)
            .ok_or_else(|| PersistenceError::NotFound(project_ref.to_string()))?;
        record.status = status.to_string();
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::config;

    #[tokio::test]
    async fn test_create_get_update() {
        let store = MemoryProjectStore::new();
        let record = NewProjectRecord::from_config(&config("p1", 5433, 54321), ProjectStatus::Creating);
        store.create_project_record(record.clone()).await.unwrap();
        assert!(matches!(
            store.create_project_record(record).await,
            Err(PersistenceError::Duplicate(_))
        ));

        let updated = store
            .update_project_status("p1", ProjectStatus::ActiveHealthy)
            .await
            .unwrap();
        assert_eq!(updated.status, "ACTIVE_HEALTHY");
        assert_eq!(
            store.get_project_by_reference("p1").await.unwrap().status,
            "ACTIVE_HEALTHY"
        );
        assert!(matches!(
            store.get_project_by_reference("nope").await,
            Err(PersistenceError::NotFound(_))
        ));
    }
}
