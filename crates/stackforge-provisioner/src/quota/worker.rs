// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic usage recomputation.
//!
//! Each poll measures every registered project through the attached
//! [`UsageSource`](super::UsageSource). When `pause_project` enforcement is
//! on, projects over quota for longer than the grace period are paused.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::lifecycle::ProjectStatus;
use crate::orchestrator::Orchestrator;

/// Configuration for the quota worker.
#[derive(Debug, Clone)]
pub struct QuotaWorkerConfig {
    /// How often usage is recomputed.
    pub poll_interval: Duration,
}

impl Default for QuotaWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
        }
    }
}

/// Background worker that keeps quota usage current.
pub struct QuotaWorker {
    orchestrator: Arc<Orchestrator>,
    config: QuotaWorkerConfig,
    shutdown: Arc<Notify>,
}

impl QuotaWorker {
    /// Create a new quota worker.
    pub fn new(orchestrator: Arc<Orchestrator>, config: QuotaWorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Quota worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Quota worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!("Quota worker stopped");
    }

    /// One pass: refresh usage for every project, then pause projects past
    /// their grace period if enforcement asks for it. Returns the ids paused.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let quotas = self.orchestrator.quotas();
        for project_id in quotas.project_ids().await {
            if let Err(e) = quotas.update_quota_usage(&project_id).await {
                warn!(project_id = %project_id, error = %e, "Failed to update quota usage");
            }
        }

        let settings = quotas.settings().await;
        if !settings.enforcement.pause_project {
            return Vec::new();
        }

        let mut paused = Vec::new();
        for project_id in quotas.over_grace_period(now).await {
            let Ok(info) = self.orchestrator.get_project_info(&project_id).await else {
                continue;
            };
            if !info.status.is_active() {
                debug!(project_id = %project_id, status = %info.status, "Over quota but not running");
                continue;
            }
            match self.orchestrator.pause_project(&project_id).await {
                Ok(info) if info.status == ProjectStatus::Paused => {
                    warn!(project_id = %project_id, "Paused project over quota past grace period");
                    paused.push(project_id);
                }
                Ok(_) => {}
                Err(e) => warn!(project_id = %project_id, error = %e, "Failed to pause over-quota project"),
            }
        }
        paused
    }
}
