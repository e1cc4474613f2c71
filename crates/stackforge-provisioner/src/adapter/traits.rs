// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime adapter trait definitions.
//!
//! Defines the capability surface the orchestrator and backup engine use to
//! drive a container backend. Every resource is tagged with its project id so
//! that [`RuntimeAdapter::remove_project`] can remove everything a project owns.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::project::ResourceLimits;

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The backend could not be reached. Retryable.
    #[error("{0}")]
    Unavailable(String),

    /// Container does not exist.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Container exists but is not running.
    #[error("Container not running: {0}")]
    NotRunning(String),

    /// The backend rejected the operation.
    #[error("{operation} failed: {message}")]
    Command {
        /// Adapter operation.
        operation: String,
        /// Backend error output.
        message: String,
    },

    /// The backend did not answer in time.
    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        /// Adapter operation.
        operation: String,
        /// Deadline.
        timeout: Duration,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Build a [`RuntimeError::Command`].
    pub fn command(operation: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::Command {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Host port published for a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

/// Named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name.
    pub volume: String,
    /// Mount point inside the container.
    pub target: String,
}

/// How to decide whether a service is healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthProbe {
    /// A TCP connect to `port` inside the container succeeds.
    Tcp {
        /// Container port.
        port: u16,
    },
    /// An HTTP GET to `path` inside the container returns 2xx.
    Http {
        /// Container port.
        port: u16,
        /// Request path.
        path: String,
    },
    /// A command run inside the container exits with status 0.
    Command {
        /// Command line.
        command: Vec<String>,
    },
    /// The container is running.
    Running,
}

/// Declarative description of one service container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Logical service name (`db`, `auth`, ...). Also the network alias.
    pub name: String,
    /// Container name on the host.
    pub container_name: String,
    /// Image reference.
    pub image: String,
    /// Command override (empty = image default).
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment.
    pub env: BTreeMap<String, String>,
    /// Published ports.
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    /// Volume mounts.
    #[serde(default)]
    pub mounts: Vec<VolumeMount>,
    /// Services that must be created first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Health probe.
    pub probe: HealthProbe,
    /// Resource limits for this container.
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Captured output of a command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status of the command.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Exit status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
    /// Memory usage in bytes.
    pub memory_bytes: u64,
}

/// Trait for container runtime backends.
///
/// Adapters are pure infrastructure drivers: they know nothing about project
/// status or the registry. Calls against an unreachable backend return
/// [`RuntimeError::Unavailable`].
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Adapter type identifier (e.g. "docker", "mock").
    fn adapter_type(&self) -> &'static str;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    /// Create a network owned by `project_id`. Existing networks are reused.
    async fn create_network(&self, project_id: &str, name: &str) -> Result<()>;

    /// Create a volume owned by `project_id`. Existing volumes are reused.
    async fn create_volume(&self, project_id: &str, name: &str) -> Result<()>;

    /// Create and start a container attached to `network`. Returns its id.
    async fn create_container(
        &self,
        project_id: &str,
        network: &str,
        spec: &ServiceSpec,
    ) -> Result<String>;

    /// Start a stopped container.
    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a running container. Stopping a stopped container succeeds.
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// The last `tail` lines of a container's output.
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;

    /// Run a command inside a running container.
    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput>;

    /// Evaluate a health probe against a container.
    async fn probe(&self, container_id: &str, probe: &HealthProbe) -> Result<bool>;

    /// Current resource usage of a container.
    async fn stats(&self, container_id: &str) -> Result<ContainerStats>;

    /// Size in bytes of a volume's contents.
    async fn volume_size(&self, project_id: &str, volume: &str) -> Result<u64>;

    /// Remove every container, volume and network tagged with `project_id`.
    async fn remove_project(&self, project_id: &str) -> Result<()>;

    /// Project ids that own at least one runtime resource.
    async fn list_project_ids(&self) -> Result<Vec<String>>;
}
