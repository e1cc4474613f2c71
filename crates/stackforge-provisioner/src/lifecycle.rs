// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project status state machine.
//!
//! All status changes go through [`next_status`], a pure function over
//! `(current status, event)`. The orchestrator plans a transition with it,
//! performs the side effects, then commits the returned status.
//!
//! ```text
//!        create                 probes pass
//!   ──────────────► CREATING ─────────────────► ACTIVE_HEALTHY ◄──┐
//!                     │  │                          │    ▲        │ probes
//!   provisioning fail │  │ probes fail       probe  │    │ probes │ recover
//!                     ▼  ▼                   fails  ▼    │ pass   │
//!                 FAILED  ACTIVE_UNHEALTHY ◄──────────────────────┘
//!                                 │
//!               pause (active)    ▼            resume
//!                              PAUSED ──────────────────► CREATING
//!
//!   delete (any state) ──► DELETING ──► removed from the registry
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a project.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    /// Resources are being created (or restarted) and probed.
    Creating,
    /// Every service passed its last probe.
    ActiveHealthy,
    /// At least one service failed its last probe.
    ActiveUnhealthy,
    /// Containers stopped, volumes retained.
    Paused,
    /// Teardown in progress.
    Deleting,
    /// Provisioning failed and partial resources were removed.
    Failed,
}

impl ProjectStatus {
    /// `ACTIVE_HEALTHY` or `ACTIVE_UNHEALTHY`.
    pub fn is_active(self) -> bool {
        matches!(self, ProjectStatus::ActiveHealthy | ProjectStatus::ActiveUnhealthy)
    }

    /// Whether the health sweep should probe a project in this state.
    pub fn is_probed(self) -> bool {
        self.is_active()
    }
}

/// Events that drive [`ProjectStatus`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleEvent {
    /// `CreateProject` accepted.
    Create,
    /// Every service probe passed.
    ProbesPassed,
    /// At least one service probe failed.
    ProbesFailed,
    /// Provisioning could not complete; resources were rolled back.
    ProvisioningFailed,
    /// `PauseProject`.
    Pause,
    /// `ResumeProject`.
    Resume,
    /// `UpdateProject` applied in place.
    Update,
    /// `DeleteProject`.
    Delete,
    /// A restore into the project failed part way.
    RestoreFailed,
}

/// A transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event {event} is not allowed from {}", state_name(.from))]
pub struct TransitionError {
    /// State before the event (`None` for an unregistered project).
    pub from: Option<ProjectStatus>,
    /// Rejected event.
    pub event: LifecycleEvent,
}

fn state_name(state: &Option<ProjectStatus>) -> String {
    state.map_or_else(|| "unregistered".to_string(), |s| s.to_string())
}

/// Compute the status that follows `event` in state `current`.
pub fn next_status(
    current: Option<ProjectStatus>,
    event: LifecycleEvent,
) -> Result<ProjectStatus, TransitionError> {
    use LifecycleEvent as E;
    use ProjectStatus as S;

    let next = match (current, event) {
        (None | Some(S::Failed), E::Create) => S::Creating,

        (Some(S::Creating), E::ProbesPassed) => S::ActiveHealthy,
        (Some(S::Creating), E::ProbesFailed) => S::ActiveUnhealthy,
        (Some(S::Creating), E::ProvisioningFailed) => S::Failed,

        (Some(s), E::ProbesPassed) if s.is_active() => S::ActiveHealthy,
        (Some(s), E::ProbesFailed) if s.is_active() => S::ActiveUnhealthy,

        (Some(s), E::Pause) if s.is_active() => S::Paused,
        (Some(S::Paused), E::Pause) => S::Paused,

        (Some(S::Paused), E::Resume) => S::Creating,
        (Some(s), E::Resume) if s.is_active() => s,

        (Some(s), E::Update) if s.is_active() => s,

        (Some(S::Paused | S::Creating), E::RestoreFailed) => S::ActiveUnhealthy,
        (Some(s), E::RestoreFailed) if s.is_active() => S::ActiveUnhealthy,

        // A DELETING project is only still registered when its teardown
        // failed, so a repeated delete re-runs the teardown.
        (Some(_), E::Delete) => S::Deleting,

        (from, event) => return Err(TransitionError { from, event }),
    };
    Ok(next)
}
