// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL project store over the platform's `project` table.
//!
//! The table belongs to the platform metadata database; this module only
//! issues the three queries the provisioner needs.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{NewProjectRecord, PersistenceError, ProjectRecord, ProjectStore, Result};
use crate::lifecycle::ProjectStatus;

/// PostgreSQL-backed project store.
#[derive(Clone)]
pub struct PostgresProjectStore {
    pool: PgPool,
}

impl PostgresProjectStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

const RECORD_COLUMNS: &str = r#"
    project_ref, project_name, organization_id::text AS organization_id, region,
    cloud_provider, status, jwt_secret, anon_key, service_role_key, created_at
"#;

#[async_trait]
impl ProjectStore for PostgresProjectStore {
    async fn get_project_by_reference(&self, project_ref: &str) -> Result<ProjectRecord> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM project WHERE project_ref = $1");
        sqlx::query_as::<_, ProjectRecord>(&query)
            .bind(project_ref)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(project_ref.to_string()))
    }

    async fn create_project_record(&self, record: NewProjectRecord) -> Result<ProjectRecord> {
        let query = format!(
            r#"
            INSERT INTO project (
                project_ref, project_name, organization_id, region, cloud_provider,
                status, jwt_secret, anon_key, service_role_key
            )
            VALUES ($1, $2, CAST($3 AS INTEGER), $4, 'LOCAL', $5, $6, $7, $8)
            RETURNING {RECORD_COLUMNS}
            "#
        );
        sqlx::query_as::<_, ProjectRecord>(&query)
            .bind(&record.project_ref)
            .bind(&record.project_name)
            .bind(&record.organization_id)
            .bind(&record.region)
            .bind(record.status.as_ref())
            .bind(&record.jwt_secret)
            .bind(&record.anon_key)
            .bind(&record.service_role_key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    PersistenceError::Duplicate(record.project_ref.clone())
                }
                other => other.into(),
            })
    }

    async fn update_project_status(
        &self,
        project_ref: &str,
        status: ProjectStatus,
    ) -> Result<ProjectRecord> {
        let query = format!(
            "UPDATE project SET status = $2, updated_at = NOW() WHERE project_ref = $1 RETURNING {RECORD_COLUMNS}"
        );
        sqlx::query_as::<_, ProjectRecord>(&query)
            .bind(project_ref)
            .bind(status.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(project_ref.to_string()))
    }
}
