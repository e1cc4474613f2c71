// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stackforge-provisioner.
//!
//! Every domain failure carries the identifiers a caller needs to act on it
//! (project, backup or restore id, operation, resource). Only
//! [`Error::RuntimeUnavailable`] is retryable.

use std::time::Duration;

use thiserror::Error;

use crate::adapter::RuntimeError;
use crate::backup::{BackupType, StorageError, artifact::ArtifactError};
use crate::lifecycle::{ProjectStatus, TransitionError};
use crate::persistence::PersistenceError;
use crate::quota::QuotaResource;

/// Kind of object a [`Error::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    /// A registered project.
    Project,
    /// A backup record.
    Backup,
    /// A restore record.
    Restore,
    /// A backup schedule.
    Schedule,
}

/// Provisioner errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// The project id (or one of its ports) is already taken.
    #[error("Project {project_id} conflicts with an existing project: {reason}")]
    Conflict {
        /// Project being created or updated.
        project_id: String,
        /// What collided.
        reason: String,
    },

    /// Unknown project, backup, restore or schedule.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of object.
        kind: ResourceKind,
        /// Identifier that was looked up.
        id: String,
    },

    /// A quota would be exceeded by the operation.
    #[error(
        "Quota exceeded for project {project_id}: {resource} would reach {requested} (current {current}, limit {limit})"
    )]
    QuotaExceeded {
        /// Project whose quota was checked.
        project_id: String,
        /// Quota dimension that blocked the operation.
        resource: QuotaResource,
        /// Usage before the operation.
        current: u64,
        /// Usage the operation would produce.
        requested: u64,
        /// Hard limit for the dimension.
        limit: u64,
    },

    /// An update attempted to change a field that is fixed at creation.
    #[error("Field {field} of project {project_id} cannot be changed")]
    ImmutableField {
        /// Project being updated.
        project_id: String,
        /// Offending field.
        field: &'static str,
    },

    /// The container runtime could not be reached.
    #[error("Runtime unavailable: {reason}")]
    RuntimeUnavailable {
        /// Description from the adapter.
        reason: String,
    },

    /// Provisioning infrastructure failed for a project.
    #[error("Provisioning of project {project_id} failed during {operation}: {source}")]
    Provisioning {
        /// Affected project.
        project_id: String,
        /// Operation that failed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A restore asked for content the backup does not hold.
    #[error("Backup {backup_id} of type {backup_type} cannot be restored as {restore_type}")]
    TypeMismatch {
        /// Backup being restored.
        backup_id: String,
        /// What the backup contains.
        backup_type: BackupType,
        /// What the restore requested.
        restore_type: BackupType,
    },

    /// An incremental backup has no completed base to diff against.
    #[error("Project {project_id} has no completed backup to base an incremental backup on")]
    NoBaseBackup {
        /// Project being backed up.
        project_id: String,
    },

    /// The named service has no running container.
    #[error("Service {service} of project {project_id} has no running container")]
    ServiceNotFound {
        /// Project addressed.
        project_id: String,
        /// Logical service name.
        service: String,
    },

    /// A lifecycle event is not allowed from the project's current state.
    #[error("Project {project_id}: {source}")]
    IllegalTransition {
        /// Project addressed.
        project_id: String,
        /// Rejected transition.
        #[source]
        source: TransitionError,
    },

    /// The operation needs the project in a different state.
    #[error("Project {project_id} is {status}; {operation} is not possible")]
    InvalidState {
        /// Project addressed.
        project_id: String,
        /// Status at the time of the call.
        status: ProjectStatus,
        /// Requested operation.
        operation: &'static str,
    },

    /// A backup cannot be removed while another backup depends on it.
    #[error("Backup {backup_id} is the base of backup {dependent_id}")]
    BackupInUse {
        /// Backup the caller tried to delete.
        backup_id: String,
        /// Incremental backup depending on it.
        dependent_id: String,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {}s", .elapsed.as_secs())]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline that was exceeded.
        elapsed: Duration,
    },

    /// Runtime adapter operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[source] RuntimeError),

    /// Project record persistence failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Backup artifact storage failed.
    #[error("Backup storage error: {0}")]
    Storage(#[from] StorageError),

    /// Backup artifact could not be built or opened.
    #[error("Backup artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RuntimeError> for Error {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => Error::RuntimeUnavailable { reason },
            other => Error::Runtime(other),
        }
    }
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: ResourceKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Wrap an error with project and operation context.
    ///
    /// Errors that already carry a kind the caller must see unchanged
    /// (quota, conflict, not found) are returned as-is.
    pub fn provisioning(project_id: impl Into<String>, operation: &'static str, err: Error) -> Self {
        match err {
            Error::Provisioning { .. }
            | Error::QuotaExceeded { .. }
            | Error::Conflict { .. }
            | Error::NotFound { .. } => err,
            other => Error::Provisioning {
                project_id: project_id.into(),
                operation,
                source: Box::new(other),
            },
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RuntimeUnavailable { .. } => true,
            Error::Provisioning { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Result type using the provisioner [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_runtime_error_maps_to_retryable() {
        let err: Error = RuntimeError::Unavailable("daemon down".into()).into();
        assert!(matches!(err, Error::RuntimeUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_runtime_errors_are_terminal() {
        let err: Error = RuntimeError::ContainerNotFound("abc".into()).into();
        assert!(matches!(err, Error::Runtime(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provisioning_keeps_quota_errors_unwrapped() {
        let quota = Error::QuotaExceeded {
            project_id: "p1".into(),
            resource: QuotaResource::StorageSize,
            current: 10,
            requested: 20,
            limit: 15,
        };
        let err = Error::provisioning("p1", "create", quota);
        assert!(matches!(err, Error::QuotaExceeded { .. }));
    }

    #[test]
    fn test_provisioning_wraps_with_context() {
        let err = Error::provisioning("p1", "create_network", Error::InvalidRequest("x".into()));
        let text = err.to_string();
        assert!(text.contains("p1"));
        assert!(text.contains("create_network"));
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found(ResourceKind::Backup, "b-1");
        assert_eq!(err.to_string(), "backup not found: b-1");
    }
}
