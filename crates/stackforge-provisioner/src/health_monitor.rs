// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps project status in step with reality.
//!
//! Every poll the monitor:
//! - probes each active project and flips it between `ACTIVE_HEALTHY` and
//!   `ACTIVE_UNHEALTHY`
//! - retries status writes the project store rejected earlier
//! - refreshes per-project CPU, memory and storage figures
//!
//! Less often it removes runtime resources that belong to no registered
//! project, such as the leftovers of a rollback that could not finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often to probe projects.
    pub poll_interval: Duration,
    /// Orphan sweep runs every this many polls (0 disables it).
    pub orphan_sweep_every: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            orphan_sweep_every: 10,
        }
    }
}

/// Background worker that probes projects.
pub struct HealthMonitor {
    orchestrator: Arc<Orchestrator>,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(orchestrator: Arc<Orchestrator>, config: HealthMonitorConfig) -> Self {
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

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            orphan_sweep_every = self.config.orphan_sweep_every,
            "Health monitor started"
        );

        let mut polls: u32 = 0;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.orchestrator.sweep_health().await;
                    polls = polls.wrapping_add(1);
                    let every = self.config.orphan_sweep_every;
                    if every > 0 && polls % every == 0 {
                        if let Err(e) = self.orchestrator.sweep_orphans().await {
                            error!(error = %e, "Orphan sweep failed");
                        }
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HealthMonitorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.orphan_sweep_every, 10);
    }
}
