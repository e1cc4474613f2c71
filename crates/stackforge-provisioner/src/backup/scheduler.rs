// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that fires due backup schedules.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::engine::BackupEngine;

/// Configuration for the backup scheduler.
#[derive(Debug, Clone)]
pub struct BackupSchedulerConfig {
    /// How often schedules are checked.
    pub poll_interval: Duration,
}

impl Default for BackupSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Background worker that starts scheduled backups.
pub struct BackupScheduler {
    engine: Arc<BackupEngine>,
    config: BackupSchedulerConfig,
    shutdown: Arc<Notify>,
}

impl BackupScheduler {
    /// Create a new scheduler.
    pub fn new(engine: Arc<BackupEngine>, config: BackupSchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Backup scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Backup scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let started = self.engine.run_due_schedules(Utc::now()).await;
                    if started.is_empty() {
                        debug!("No backup schedules due");
                    } else {
                        info!(count = started.len(), "Scheduled backups started");
                    }
                }
            }
        }

        info!("Backup scheduler stopped");
    }
}
