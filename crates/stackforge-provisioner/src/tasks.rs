// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervised pool for long-running operations.
//!
//! Provisioning, backups and restores outlive the call that started them.
//! They run here instead of on detached tasks: the pool bounds concurrency,
//! reports panics through a failure callback so the owning record can be
//! marked failed, and lets shutdown wait for in-flight work.
//!
//! Tasks are never interrupted once started. Cancellation only prevents
//! queued tasks from starting.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Bounded, observable task pool with its own cancellation scope.
#[derive(Clone)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new(16)
    }
}

impl TaskSupervisor {
    /// Pool running at most `max_concurrent` tasks at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Token cancelled when the pool shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tasks queued or running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Run `task` in the pool.
    ///
    /// `on_failure` receives a reason when the task panics or is dropped
    /// before it could start.
    pub fn spawn<F, P, PF>(&self, kind: &'static str, subject: String, task: F, on_failure: P)
    where
        F: Future<Output = ()> + Send + 'static,
        P: FnOnce(String) -> PF + Send + 'static,
        PF: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                warn!(kind, subject = %subject, "Task dropped before it started");
                on_failure("provisioner shut down before the operation started".to_string()).await;
                return;
            };

            if let Err(e) = tokio::spawn(task).await {
                let reason = if e.is_panic() {
                    "operation panicked"
                } else {
                    "operation was aborted"
                };
                error!(kind, subject = %subject, reason, "Supervised task failed");
                on_failure(reason.to_string()).await;
            }
        });
    }

    /// Stop accepting work, cancel queued tasks and wait up to `grace` for
    /// running ones. Returns whether everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        self.cancel.cancel();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending, grace_secs = grace.as_secs(), "Waiting for in-flight operations");
        }
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(pending = self.tracker.len(), "In-flight operations did not finish before shutdown");
                false
            }
        }
    }
}
