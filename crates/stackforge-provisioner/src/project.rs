// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project configuration (provisioning input) and runtime fact sheet.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lifecycle::ProjectStatus;
use crate::quota::{QuotaPlan, ResourceQuotas};

/// Container resource limits (zero = unlimited).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU in millicores for the whole project.
    pub cpu_millicores: u64,
    /// Memory in bytes for the whole project.
    pub memory_bytes: u64,
    /// Storage volume size in bytes.
    pub storage_bytes: u64,
}

/// Provisioning input for one project.
///
/// Credentials are generated by the caller; the provisioner only passes them
/// through to the rendered services.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Unique project reference.
    pub project_id: String,
    /// Display name.
    pub project_name: String,
    /// Owning organization.
    pub organization_id: String,
    /// Placement region.
    pub region: String,
    /// Password of the `postgres` superuser.
    pub db_password: String,
    /// Host port of the database.
    pub db_port: u16,
    /// Host port of the API gateway.
    pub api_port: u16,
    /// Host port of the dashboard (0 = no dashboard).
    #[serde(default)]
    pub studio_port: u16,
    /// Secret used to sign and verify JWTs.
    pub jwt_secret: String,
    /// Public API key.
    pub anon_key: String,
    /// Service-role API key.
    pub service_key: String,
    /// Dashboard basic-auth user.
    #[serde(default)]
    pub dashboard_user: String,
    /// Dashboard basic-auth password.
    #[serde(default)]
    pub dashboard_pass: String,
    /// Container resource limits.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Quota plan (the operator default when absent).
    #[serde(default)]
    pub plan: Option<QuotaPlan>,
    /// Explicit quotas, required for [`QuotaPlan::Custom`].
    #[serde(default)]
    pub quotas: Option<ResourceQuotas>,
}

impl fmt::Debug for ProjectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectConfig")
            .field("project_id", &self.project_id)
            .field("project_name", &self.project_name)
            .field("organization_id", &self.organization_id)
            .field("region", &self.region)
            .field("db_port", &self.db_port)
            .field("api_port", &self.api_port)
            .field("studio_port", &self.studio_port)
            .field("limits", &self.limits)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl ProjectConfig {
    /// Host ports the project binds, ignoring a disabled dashboard.
    pub fn host_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.db_port, self.api_port];
        if self.studio_port != 0 {
            ports.push(self.studio_port);
        }
        ports
    }

    /// Reject configurations that cannot be rendered.
    pub fn validate(&self) -> Result<()> {
        let id = &self.project_id;
        if id.is_empty()
            || id.len() > 40
            || !id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || id.starts_with('-')
        {
            return Err(Error::InvalidRequest(format!(
                "project id {id:?} must be 1-40 lowercase letters, digits or dashes"
            )));
        }
        for (name, value) in [
            ("db_password", &self.db_password),
            ("jwt_secret", &self.jwt_secret),
            ("anon_key", &self.anon_key),
            ("service_key", &self.service_key),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidRequest(format!("{name} is required")));
            }
        }
        if self.db_port == 0 || self.api_port == 0 {
            return Err(Error::InvalidRequest("db_port and api_port are required".into()));
        }
        let ports = self.host_ports();
        for (i, port) in ports.iter().enumerate() {
            if ports[i + 1..].contains(port) {
                return Err(Error::InvalidRequest(format!("port {port} is used twice")));
            }
        }
        Ok(())
    }
}

/// Runtime fact sheet of a registered project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    /// Project reference.
    pub project_id: String,
    /// Lifecycle status.
    pub status: ProjectStatus,
    /// Public API endpoint.
    pub endpoint: String,
    /// Database connection endpoint (no credentials).
    pub db_endpoint: String,
    /// Logical service name to container id.
    pub containers: BTreeMap<String, String>,
    /// Logical service name to last probe result.
    pub health_checks: BTreeMap<String, bool>,
    /// CPU usage in percent of one core, summed over containers.
    pub cpu_usage: f64,
    /// Memory usage in bytes, summed over containers.
    pub memory_usage: u64,
    /// File storage volume size in bytes.
    pub storage_usage: u64,
    /// Last failure recorded against the project.
    pub error_message: Option<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl ProjectInfo {
    /// Fresh record in `CREATING`.
    pub fn new(project_id: impl Into<String>, endpoint: String, db_endpoint: String) -> Self {
        let now = Utc::now();
        Self {
            project_id: project_id.into(),
            status: ProjectStatus::Creating,
            endpoint,
            db_endpoint,
            containers: BTreeMap::new(),
            health_checks: BTreeMap::new(),
            cpu_usage: 0.0,
            memory_usage: 0,
            storage_usage: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A valid config for unit tests.
    pub fn config(project_id: &str, db_port: u16, api_port: u16) -> ProjectConfig {
        ProjectConfig {
            project_id: project_id.to_string(),
            project_name: format!("{project_id} name"),
            organization_id: "org-1".to_string(),
            region: "local".to_string(),
            db_password: "x".to_string(),
            db_port,
            api_port,
            studio_port: 0,
            jwt_secret: "super-secret-jwt-token-with-at-least-32-characters".to_string(),
            anon_key: "anon".to_string(),
            service_key: "service".to_string(),
            dashboard_user: "admin".to_string(),
            dashboard_pass: "admin".to_string(),
            limits: ResourceLimits::default(),
            plan: None,
            quotas: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::config;
    use super::*;

    #[test]
    fn test_valid_config_passes() {
        assert!(config("p1", 5433, 54321).validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ids() {
        for id in ["", "Upper", "has space", "-lead", &"a".repeat(41)] {
            let mut c = config("p1", 5433, 54321);
            c.project_id = id.to_string();
            assert!(matches!(c.validate(), Err(Error::InvalidRequest(_))), "{id:?}");
        }
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let mut c = config("p1", 5433, 5433);
        assert!(c.validate().is_err());
        c.api_port = 54321;
        c.studio_port = 54321;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let text = format!("{:?}", config("p1", 5433, 54321));
        assert!(!text.contains("super-secret"));
        assert!(text.contains("p1"));
    }
}
