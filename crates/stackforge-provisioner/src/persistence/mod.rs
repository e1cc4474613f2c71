// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project record persistence.
//!
//! The provisioner does not own the project table. It reads and writes
//! project records through the narrow [`ProjectStore`] interface: lookup by
//! reference, create, and status update.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryProjectStore;
pub use self::postgres::PostgresProjectStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::lifecycle::ProjectStatus;

/// Errors from the project store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PersistenceError {
    /// No record for the reference.
    #[error("project record not found: {0}")]
    NotFound(String),

    /// A record with the reference already exists.
    #[error("project record already exists: {0}")]
    Duplicate(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Project record as stored by the metadata database.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProjectRecord {
    /// Project reference (the provisioner's project id).
    pub project_ref: String,
    /// Display name.
    pub project_name: String,
    /// Owning organization.
    pub organization_id: String,
    /// Placement region.
    pub region: String,
    /// Cloud provider label.
    pub cloud_provider: String,
    /// Lifecycle status as its `SCREAMING_SNAKE_CASE` name.
    pub status: String,
    /// JWT secret.
    pub jwt_secret: String,
    /// Public API key.
    pub anon_key: Option<String>,
    /// Service-role API key.
    pub service_role_key: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

/// Fields for a new project record.
#[derive(Debug, Clone)]
pub struct NewProjectRecord {
    /// Project reference.
    pub project_ref: String,
    /// Display name.
    pub project_name: String,
    /// Owning organization.
    pub organization_id: String,
    /// Placement region.
    pub region: String,
    /// Initial status.
    pub status: ProjectStatus,
    /// JWT secret.
    pub jwt_secret: String,
    /// Public API key.
    pub anon_key: String,
    /// Service-role API key.
    pub service_role_key: String,
}

impl NewProjectRecord {
    /// Record fields for a project config.
    pub fn from_config(config: &crate::project::ProjectConfig, status: ProjectStatus) -> Self {
        Self {
            project_ref: config.project_id.clone(),
            project_name: config.project_name.clone(),
            organization_id: config.organization_id.clone(),
            region: config.region.clone(),
            status,
            jwt_secret: config.jwt_secret.clone(),
            anon_key: config.anon_key.clone(),
            service_role_key: config.service_key.clone(),
        }
    }
}

/// Persistence collaborator for project records.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Record by project reference.
    async fn get_project_by_reference(&self, project_ref: &str) -> Result<ProjectRecord>;

    /// Insert a record.
    async fn create_project_record(&self, record: NewProjectRecord) -> Result<ProjectRecord>;

    /// Set the status of a record.
    async fn update_project_status(
        &self,
        project_ref: &str,
        status: ProjectStatus,
    ) -> Result<ProjectRecord>;
}
