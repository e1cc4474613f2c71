// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime adapters for project containers.
//!
//! The adapter is the only component that talks to the container backend.
//! `DockerAdapter` drives the `docker` CLI; `MockAdapter` simulates container
//! lifecycles, databases and storage volumes in memory for tests.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerAdapter, DockerAdapterConfig};
pub use mock::MockAdapter;
pub use traits::*;
