// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup and restore.
//!
//! - [`types`]: requests, records and schedules
//! - [`artifact`]: the sealed archive format and incremental deltas
//! - [`BackupStorage`]: where artifacts live (local filesystem, S3)
//! - [`BackupCatalog`]: durable record of backups, restores and schedules
//! - [`BackupEngine`]: capture, restore, export and import
//! - [`BackupScheduler`] and [`RetentionWorker`]: periodic drivers

pub mod artifact;
mod catalog;
mod engine;
mod retention;
#[cfg(feature = "s3")]
mod s3;
pub mod schedule;
mod scheduler;
mod storage;
pub mod types;

pub use catalog::{BackupCatalog, BackupEntry, Interrupted};
pub use engine::{BackupEngine, BackupEngineConfig, ImportOptions};
pub use retention::{RetentionWorker, RetentionWorkerConfig};
#[cfg(feature = "s3")]
pub use s3::S3BackupStorage;
pub use scheduler::{BackupScheduler, BackupSchedulerConfig};
pub use storage::{BackupStorage, LocalBackupStorage, StorageError};
pub use types::*;
