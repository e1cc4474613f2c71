// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota manager: limits, observed usage, enforcement.
//!
//! Usage is written only by [`QuotaManager::update_quota_usage`], which
//! replaces every measured field from a [`UsageSource`]. Status is derived
//! on each call and never cached.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use strum::IntoEnumIterator;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::*;
use super::usage::{UsageSample, UsageSource};
use crate::error::{Error, ResourceKind, Result};
use crate::project::ProjectConfig;

#[derive(Debug, Clone)]
struct ProjectQuota {
    plan: QuotaPlan,
    quotas: ResourceQuotas,
    usage: QuotaUsage,
    exceeded_since: Option<DateTime<Utc>>,
}

/// Per-project quota bookkeeping.
pub struct QuotaManager {
    settings: RwLock<QuotaSettings>,
    projects: RwLock<HashMap<String, ProjectQuota>>,
    source: OnceLock<Arc<dyn UsageSource>>,
}

fn percent(value: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        value as f64 / limit as f64 * 100.0
    }
}

/// Quota dimensions an operation grows, with the value it would reach.
fn growth(op: QuotaOperation, usage: &QuotaUsage, size: u64) -> Vec<(QuotaResource, u64, u64)> {
    let grow = |resource: QuotaResource, by: u64| {
        let current = usage.value(resource);
        (resource, current, current.saturating_add(by))
    };
    match op {
        QuotaOperation::Upload => vec![
            (QuotaResource::FileSize, 0, size),
            grow(QuotaResource::StorageSize, size),
            grow(QuotaResource::TotalDiskSize, size),
        ],
        QuotaOperation::Backup => vec![
            grow(QuotaResource::BackupSize, size),
            grow(QuotaResource::TotalDiskSize, size),
            grow(QuotaResource::Backups, 1),
        ],
        QuotaOperation::CreateUser => vec![grow(QuotaResource::Users, 1)],
        QuotaOperation::CreateTable => vec![grow(QuotaResource::Tables, 1)],
        QuotaOperation::DatabaseWrite => vec![
            grow(QuotaResource::DatabaseSize, size),
            grow(QuotaResource::TotalDiskSize, size),
        ],
        QuotaOperation::Connection => vec![grow(QuotaResource::Connections, 1)],
    }
}

impl QuotaManager {
    /// Manager with operator settings.
    pub fn new(settings: QuotaSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            projects: RwLock::new(HashMap::new()),
            source: OnceLock::new(),
        }
    }

    /// Attach the usage source used by [`update_quota_usage`](Self::update_quota_usage).
    /// Only the first call has an effect.
    pub fn attach_usage_source(&self, source: Arc<dyn UsageSource>) {
        if self.source.set(source).is_err() {
            debug!("Usage source already attached");
        }
    }

    /// Current operator settings.
    pub async fn settings(&self) -> QuotaSettings {
        self.settings.read().await.clone()
    }

    /// Replace the enforcement policy.
    pub async fn set_enforcement(&self, enforcement: QuotaEnforcement) {
        self.settings.write().await.enforcement = enforcement;
    }

    /// Plan and quotas that apply to a config.
    pub async fn resolve(&self, config: &ProjectConfig) -> Result<(QuotaPlan, ResourceQuotas)> {
        let plan = match config.plan {
            Some(plan) => plan,
            None => self.settings.read().await.default_plan,
        };
        let quotas = match (plan, config.quotas) {
            (_, Some(quotas)) => quotas,
            (QuotaPlan::Custom, None) => {
                return Err(Error::InvalidRequest(
                    "the CUSTOM plan requires explicit quotas".into(),
                ));
            }
            (plan, None) => ResourceQuotas::for_plan(plan),
        };
        Ok((plan, quotas))
    }

    /// Check that a config's resource limits fit its plan.
    pub async fn authorize_project(&self, config: &ProjectConfig) -> Result<(QuotaPlan, ResourceQuotas)> {
        let (plan, quotas) = self.resolve(config).await?;
        for (resource, requested) in [
            (QuotaResource::Cpu, config.limits.cpu_millicores),
            (QuotaResource::Memory, config.limits.memory_bytes),
            (QuotaResource::StorageSize, config.limits.storage_bytes),
        ] {
            let limit = quotas.limit(resource);
            if limit > 0 && requested > limit {
                return Err(Error::QuotaExceeded {
                    project_id: config.project_id.clone(),
                    resource,
                    current: 0,
                    requested,
                    limit,
                });
            }
        }
        Ok((plan, quotas))
    }

    /// Start tracking a project. Usage survives re-registration.
    pub async fn register_project(&self, project_id: &str, plan: QuotaPlan, quotas: ResourceQuotas) {
        let mut projects = self.projects.write().await;
        let usage = projects
            .remove(project_id)
            .map(|p| p.usage)
            .unwrap_or_else(|| QuotaUsage::empty(project_id));
        projects.insert(
            project_id.to_string(),
            ProjectQuota {
                plan,
                quotas,
                usage,
                exceeded_since: None,
            },
        );
    }

    /// Stop tracking a project.
    pub async fn remove_project(&self, project_id: &str) {
        self.projects.write().await.remove(project_id);
    }

    /// Tracked project ids.
    pub async fn project_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.projects.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace a project's quotas (and optionally its plan).
    pub async fn set_quotas(
        &self,
        project_id: &str,
        quotas: ResourceQuotas,
        plan: Option<QuotaPlan>,
    ) -> Result<()> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Project, project_id))?;
        project.quotas = quotas;
        if let Some(plan) = plan {
            project.plan = plan;
        }
        info!(project_id, plan = %project.plan, "Quotas updated");
        Ok(())
    }

    /// Quotas of a project.
    pub async fn get_quotas(&self, project_id: &str) -> Result<ResourceQuotas> {
        self.with_project(project_id, |p| p.quotas).await
    }

    /// Latest usage of a project.
    pub async fn get_usage(&self, project_id: &str) -> Result<QuotaUsage> {
        self.with_project(project_id, |p| p.usage.clone()).await
    }

    async fn with_project<T>(&self, project_id: &str, f: impl FnOnce(&ProjectQuota) -> T) -> Result<T> {
        self.projects
            .read()
            .await
            .get(project_id)
            .map(f)
            .ok_or_else(|| Error::not_found(ResourceKind::Project, project_id))
    }

    /// Status derived from the current quotas and usage.
    pub async fn get_quota_status(&self, project_id: &str) -> Result<QuotaStatus> {
        let enforcement = self.settings.read().await.enforcement;
        self.with_project(project_id, |p| evaluate(project_id, p, &enforcement))
            .await
    }

    /// Gate a growth operation.
    ///
    /// Zero limits always pass. A dimension whose post-operation value
    /// exceeds `block_at_percent` fails with `QuotaExceeded`, unless the
    /// operation's block flag is off, in which case it becomes a warning.
    /// Reaching `warn_at_percent` yields a warning.
    pub async fn enforce_quotas(
        &self,
        project_id: &str,
        operation: QuotaOperation,
        size: u64,
    ) -> Result<QuotaDecision> {
        let enforcement = self.settings.read().await.enforcement;
        let projects = self.projects.read().await;
        let project = projects
            .get(project_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Project, project_id))?;
        let blocking = match operation {
            QuotaOperation::Upload => enforcement.block_uploads,
            QuotaOperation::Backup => enforcement.block_backups,
            QuotaOperation::CreateUser => enforcement.block_new_users,
            _ => true,
        };

        let mut decision = QuotaDecision::default();
        for (resource, current, value) in growth(operation, &project.usage, size) {
            let limit = project.quotas.limit(resource);
            if limit == 0 {
                continue;
            }
            let used_percent = percent(value, limit);
            if used_percent > enforcement.block_at_percent && blocking {
                if enforcement.notify_admin {
                    warn!(project_id, %operation, %resource, value, limit, "Quota exceeded, operation blocked");
                }
                return Err(Error::QuotaExceeded {
                    project_id: project_id.to_string(),
                    resource,
                    current,
                    requested: value,
                    limit,
                });
            }
            if used_percent >= enforcement.warn_at_percent {
                decision.warnings.push(QuotaWarning {
                    resource,
                    value,
                    limit,
                    used_percent,
                });
            }
        }
        if decision.has_warnings() && enforcement.notify_admin {
            info!(
                project_id,
                %operation,
                warnings = decision.warnings.len(),
                "Operation allowed close to quota"
            );
        }
        if !enforcement.notify_user {
            decision.warnings.clear();
        }
        Ok(decision)
    }

    /// Replace a project's usage with a fresh measurement.
    pub async fn record_usage(&self, project_id: &str, sample: UsageSample) -> Result<QuotaUsage> {
        let enforcement = self.settings.read().await.enforcement;
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(project_id)
            .ok_or_else(|| Error::not_found(ResourceKind::Project, project_id))?;

        let previous = &project.usage;
        let usage = QuotaUsage {
            project_id: project_id.to_string(),
            database_size: sample.database_size,
            storage_size: sample.storage_size,
            backup_size: sample.backup_size,
            total_disk_size: sample.database_size + sample.storage_size + sample.backup_size,
            cpu_millicores: sample.cpu_millicores,
            memory: sample.memory,
            bandwidth: 0,
            requests_last_hour: 0,
            connections: sample.connections.unwrap_or(0),
            backup_count: sample.backup_count,
            user_count: sample.user_count.unwrap_or(previous.user_count),
            table_count: sample.table_count.unwrap_or(previous.table_count),
            measured_at: Some(Utc::now()),
        };
        project.usage = usage.clone();

        let status = evaluate(project_id, project, &enforcement);
        match (status.exceeded, project.exceeded_since) {
            (true, None) => {
                project.exceeded_since = Some(Utc::now());
                if enforcement.notify_admin {
                    warn!(project_id, errors = ?status.errors, "Project is over quota");
                }
            }
            (false, Some(_)) => {
                project.exceeded_since = None;
                info!(project_id, "Project is back within quota");
            }
            _ => {}
        }
        Ok(usage)
    }

    /// Measure a project through the attached usage source and record it.
    pub async fn update_quota_usage(&self, project_id: &str) -> Result<QuotaUsage> {
        let source = self
            .source
            .get()
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("no usage source attached".into()))?;
        if !self.projects.read().await.contains_key(project_id) {
            return Err(Error::not_found(ResourceKind::Project, project_id));
        }
        let sample = source.measure(project_id).await?;
        self.record_usage(project_id, sample).await
    }

    /// Projects continuously over quota for longer than the grace period.
    pub async fn over_grace_period(&self, now: DateTime<Utc>) -> Vec<String> {
        let grace = self.settings.read().await.grace_period;
        let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
        let mut ids: Vec<String> = self
            .projects
            .read()
            .await
            .iter()
            .filter(|(_, p)| p.exceeded_since.is_some_and(|since| now - since >= grace))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn evaluate(project_id: &str, project: &ProjectQuota, enforcement: &QuotaEnforcement) -> QuotaStatus {
    let mut status = QuotaStatus {
        project_id: project_id.to_string(),
        plan: project.plan,
        exceeded: false,
        warnings: Vec::new(),
        errors: Vec::new(),
        checks: Default::default(),
        usage: project.usage.clone(),
    };
    for resource in QuotaResource::iter() {
        let current = project.usage.value(resource);
        let limit = project.quotas.limit(resource);
        let used_percent = percent(current, limit);
        let exceeded = limit > 0 && used_percent > enforcement.block_at_percent;
        let warning = limit > 0 && !exceeded && used_percent >= enforcement.warn_at_percent;
        if exceeded {
            status.exceeded = true;
            status
                .errors
                .push(format!("{resource} exceeds quota: {current} of {limit}"));
        } else if warning {
            status
                .warnings
                .push(format!("{resource} at {used_percent:.1}% of quota ({current} of {limit})"));
        }
        status.checks.insert(
            resource,
            QuotaCheck {
                current,
                limit,
                used_percent,
                exceeded,
                warning,
            },
        );
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::usage::StaticUsageSource;

    async fn manager_with(quotas: ResourceQuotas) -> QuotaManager {
        let manager = QuotaManager::new(QuotaSettings::default());
        manager.register_project("p1", QuotaPlan::Custom, quotas).await;
        manager
    }

    fn sample(storage_size: u64) -> UsageSample {
        UsageSample {
            storage_size,
            ..UsageSample::default()
        }
    }

    #[tokio::test]
    async fn test_upload_boundary() {
        let manager = manager_with(ResourceQuotas {
            storage_size: 1_000_000,
            ..ResourceQuotas::default()
        })
        .await;
        manager.record_usage("p1", sample(950_000)).await.unwrap();

        let decision = manager
            .enforce_quotas("p1", QuotaOperation::Upload, 40_000)
            .await
            .unwrap();
        assert_eq!(decision.warnings.len(), 1);
        assert_eq!(decision.warnings[0].resource, QuotaResource::StorageSize);
        assert_eq!(decision.warnings[0].value, 990_000);

        let err = manager
            .enforce_quotas("p1", QuotaOperation::Upload, 60_000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded {
                resource: QuotaResource::StorageSize,
                current: 950_000,
                requested: 1_010_000,
                limit: 1_000_000,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_block_flag_off_turns_breach_into_warning() {
        let manager = manager_with(ResourceQuotas {
            storage_size: 1_000_000,
            ..ResourceQuotas::default()
        })
        .await;
        manager.record_usage("p1", sample(950_000)).await.unwrap();
        manager
            .set_enforcement(QuotaEnforcement {
                block_uploads: false,
                ..QuotaEnforcement::default()
            })
            .await;
        let decision = manager
            .enforce_quotas("p1", QuotaOperation::Upload, 60_000)
            .await
            .unwrap();
        assert!(decision.has_warnings());
    }

    #[tokio::test]
    async fn test_file_size_is_checked_directly() {
        let manager = manager_with(ResourceQuotas {
            max_file_size: 100,
            ..ResourceQuotas::default()
        })
        .await;
        assert!(manager.enforce_quotas("p1", QuotaOperation::Upload, 100).await.is_ok());
        assert!(manager.enforce_quotas("p1", QuotaOperation::Upload, 101).await.is_err());
    }

    #[tokio::test]
    async fn test_unlimited_users_never_exceeded() {
        let manager = manager_with(ResourceQuotas {
            max_users: 0,
            ..ResourceQuotas::default()
        })
        .await;
        manager
            .record_usage(
                "p1",
                UsageSample {
                    user_count: Some(10_000),
                    ..UsageSample::default()
                },
            )
            .await
            .unwrap();
        let status = manager.get_quota_status("p1").await.unwrap();
        assert!(!status.checks[&QuotaResource::Users].exceeded);
        assert!(!status.exceeded);
        assert!(manager.enforce_quotas("p1", QuotaOperation::CreateUser, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_total_disk_is_sum_of_parts() {
        let manager = manager_with(ResourceQuotas::default()).await;
        let usage = manager
            .record_usage(
                "p1",
                UsageSample {
                    database_size: 10,
                    storage_size: 20,
                    backup_size: 30,
                    ..UsageSample::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(usage.total_disk_size, 60);
    }

    #[tokio::test]
    async fn test_unmeasured_counts_keep_previous_value() {
        let manager = manager_with(ResourceQuotas::default()).await;
        manager
            .record_usage(
                "p1",
                UsageSample {
                    user_count: Some(7),
                    ..UsageSample::default()
                },
            )
            .await
            .unwrap();
        let usage = manager.record_usage("p1", UsageSample::default()).await.unwrap();
        assert_eq!(usage.user_count, 7);
    }

    #[tokio::test]
    async fn test_custom_plan_requires_quotas() {
        let manager = QuotaManager::new(QuotaSettings::default());
        let mut config = crate::project::fixtures::config("p1", 5433, 54321);
        config.plan = Some(QuotaPlan::Custom);
        assert!(matches!(
            manager.resolve(&config).await,
            Err(Error::InvalidRequest(_))
        ));
        config.plan = None;
        let (plan, quotas) = manager.resolve(&config).await.unwrap();
        assert_eq!(plan, QuotaPlan::Free);
        assert_eq!(quotas, ResourceQuotas::for_plan(QuotaPlan::Free));
    }

    #[tokio::test]
    async fn test_authorize_rejects_limits_above_plan() {
        let manager = QuotaManager::new(QuotaSettings::default());
        let mut config = crate::project::fixtures::config("p1", 5433, 54321);
        config.limits.cpu_millicores = 4_000;
        assert!(matches!(
            manager.authorize_project(&config).await,
            Err(Error::QuotaExceeded {
                resource: QuotaResource::Cpu,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_update_usage_through_source() {
        let manager = manager_with(ResourceQuotas::default()).await;
        let source = Arc::new(StaticUsageSource::new());
        source.set("p1", sample(1234)).await;
        manager.attach_usage_source(source);
        let usage = manager.update_quota_usage("p1").await.unwrap();
        assert_eq!(usage.storage_size, 1234);
        assert!(usage.measured_at.is_some());
    }

    #[tokio::test]
    async fn test_grace_period_tracking() {
        let manager = manager_with(ResourceQuotas {
            storage_size: 10,
            ..ResourceQuotas::default()
        })
        .await;
        manager.record_usage("p1", sample(100)).await.unwrap();
        assert!(manager.over_grace_period(Utc::now()).await.is_empty());
        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(manager.over_grace_period(later).await, vec!["p1".to_string()]);

        manager.record_usage("p1", sample(1)).await.unwrap();
        assert!(manager.over_grace_period(later).await.is_empty());
    }
}
