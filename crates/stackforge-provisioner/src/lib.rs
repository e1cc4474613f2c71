// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stackforge Provisioner - Project Lifecycle Management
//!
//! This crate provisions isolated multi-service projects (database, auth,
//! REST, realtime, storage, functions, gateway and dashboard) on a container
//! runtime and keeps them running: it drives each project through its
//! lifecycle, renders its service specifications, takes and restores
//! backups, and tracks resource usage against plan quotas.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        ProvisionerRuntime                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐                 │
//! │  │ Orchestrator │◄─│ BackupEngine │  │ QuotaManager │                 │
//! │  └──────────────┘  └──────────────┘  └──────────────┘                 │
//! │    │   ▲  ▲             ▲   ▲              ▲                          │
//! │    │   │  └─ HealthMonitor  └─ Scheduler   └─ QuotaWorker             │
//! │    │   │                   └─ RetentionWorker                         │
//! └────┼───┼─────────────────────────────────────────────────────────────┘
//!      │   │ ProjectRegistry (per-project state + operation lock)
//!      ▼
//! ┌─────────────────────┐      ┌─────────────────────┐
//! │   RuntimeAdapter    │      │    ProjectStore     │
//! │ (Docker CLI, mock)  │      │ (PostgreSQL, memory)│
//! └─────────────────────┘      └─────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `create_project` | Render, create and start services; `CREATING` until probes pass |
//! | `update_project` | Recreate only the services whose specification changed |
//! | `pause_project` / `resume_project` | Stop or start every service |
//! | `delete_project` | Tear down services, network and volumes |
//! | `get_logs` / `execute_command` | Inspect a single service |
//!
//! # Backups
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `create_backup` | FULL, INCREMENTAL, DATABASE_ONLY or FILES_ONLY capture |
//! | `restore_backup` | Replay a backup chain into a project |
//! | `export_project` / `import_project` | Move a project between hosts |
//! | `set_backup_schedule` | Periodic backups with retention |

#![warn(missing_docs)]

pub mod adapter;
pub mod backup;
pub mod config;
pub mod error;
pub mod health_monitor;
pub mod lifecycle;
pub mod orchestrator;
pub mod persistence;
pub mod project;
pub mod quota;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod tasks;
pub mod template;

pub use error::{Error, Result};
pub use lifecycle::ProjectStatus;
pub use orchestrator::Orchestrator;
pub use runtime::ProvisionerRuntime;
