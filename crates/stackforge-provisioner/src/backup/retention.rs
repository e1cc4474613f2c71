// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that deletes backups past their expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::info;

use super::engine::BackupEngine;

/// Configuration for the retention worker.
#[derive(Debug, Clone)]
pub struct RetentionWorkerConfig {
    /// How often expired backups are looked for.
    pub poll_interval: Duration,
}

impl Default for RetentionWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
        }
    }
}

/// Background worker for retention cleanup.
pub struct RetentionWorker {
    engine: Arc<BackupEngine>,
    config: RetentionWorkerConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(engine: Arc<BackupEngine>, config: RetentionWorkerConfig) -> Self {
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

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let deleted = self.engine.cleanup_expired(Utc::now()).await;
                    if deleted > 0 {
                        info!(deleted, "Expired backups deleted");
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }
}
