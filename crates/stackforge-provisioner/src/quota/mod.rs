// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota management.
//!
//! - [`types`]: plans, limits, usage and derived status
//! - [`QuotaManager`]: enforcement gate and usage bookkeeping
//! - [`UsageSource`]: where measurements come from
//! - [`QuotaWorker`]: periodic recomputation and over-quota pausing

mod manager;
pub mod types;
mod usage;
mod worker;

pub use manager::QuotaManager;
pub use types::*;
pub use usage::{RuntimeUsageSource, StaticUsageSource, UsageSample, UsageSource};
pub use worker::{QuotaWorker, QuotaWorkerConfig};
