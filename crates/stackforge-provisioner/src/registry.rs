// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory project registry.
//!
//! # Locking
//!
//! - `slots` (membership) is a `RwLock` held only to insert, remove or look
//!   up a slot. Registration checks id and port uniqueness under its write
//!   lock, so two creates cannot claim the same id or port.
//! - Each slot has an operation lock. Holding it yields a [`ProjectLease`],
//!   the only handle through which the project's state can be written, so
//!   two orchestration operations on one project never interleave.
//! - Each slot has a backup lock, held by backups and restores for their
//!   whole duration and by pause and delete before they touch containers.
//! - Slot state sits behind its own `RwLock`; readers never need a lease.
//!
//! Acquisition order is operation lock, backup lock, membership, state.
//! Membership is never held while waiting for a slot's operation or backup
//! lock, and a task holding the backup lock never waits for the operation
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::lifecycle::ProjectStatus;
use crate::project::{ProjectConfig, ProjectInfo};
use crate::template::ProjectManifest;

/// Everything the orchestrator knows about one project.
#[derive(Debug, Clone)]
pub struct ProjectEntry {
    /// Public fact sheet.
    pub info: ProjectInfo,
    /// Config the running stack was rendered from.
    pub config: ProjectConfig,
    /// Rendered manifest of the running stack.
    pub manifest: ProjectManifest,
    /// Last status the persistence collaborator acknowledged.
    pub persisted: Option<ProjectStatus>,
}

/// Registry slot of one project.
#[derive(Debug)]
pub struct ProjectSlot {
    project_id: String,
    ops: Arc<Mutex<()>>,
    backup: Arc<Mutex<()>>,
    state: RwLock<ProjectEntry>,
    removed: AtomicBool,
}

impl ProjectSlot {
    fn new(entry: ProjectEntry) -> Self {
        Self {
            project_id: entry.info.project_id.clone(),
            ops: Arc::new(Mutex::new(())),
            backup: Arc::new(Mutex::new(())),
            state: RwLock::new(entry),
            removed: AtomicBool::new(false),
        }
    }

    /// Project id.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Read access to the entry.
    pub async fn read(&self) -> RwLockReadGuard<'_, ProjectEntry> {
        self.state.read().await
    }

    /// Copy of the fact sheet.
    pub async fn info(&self) -> ProjectInfo {
        self.state.read().await.info.clone()
    }

    /// Current status.
    pub async fn status(&self) -> ProjectStatus {
        self.state.read().await.info.status
    }

    /// Whether the slot was removed from the registry.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Wait for the operation lock.
    pub async fn lease(self: &Arc<Self>) -> ProjectLease {
        let guard = self.ops.clone().lock_owned().await;
        ProjectLease {
            slot: self.clone(),
            _guard: guard,
        }
    }

    /// Take the operation lock if it is free.
    pub fn try_lease(self: &Arc<Self>) -> Option<ProjectLease> {
        let guard = self.ops.clone().try_lock_owned().ok()?;
        Some(ProjectLease {
            slot: self.clone(),
            _guard: guard,
        })
    }

    /// Wait for the backup lock.
    pub async fn backup_lock(&self) -> OwnedMutexGuard<()> {
        self.backup.clone().lock_owned().await
    }
}

/// Exclusive right to run an orchestration operation on one project.
pub struct ProjectLease {
    slot: Arc<ProjectSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for ProjectLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLease")
            .field("project_id", &self.slot.project_id)
            .finish()
    }
}

impl ProjectLease {
    /// The leased slot.
    pub fn slot(&self) -> &Arc<ProjectSlot> {
        &self.slot
    }

    /// Project id.
    pub fn project_id(&self) -> &str {
        &self.slot.project_id
    }

    /// Read access to the entry.
    pub async fn read(&self) -> RwLockReadGuard<'_, ProjectEntry> {
        self.slot.state.read().await
    }

    /// Write access to the entry.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ProjectEntry> {
        self.slot.state.write().await
    }
}

/// Registry of live projects.
#[derive(Debug, Default)]
pub struct ProjectRegistry {
    slots: RwLock<HashMap<String, Arc<ProjectSlot>>>,
}

fn port_conflicts(ports: &[u16], used: &HashSet<u16>) -> Option<u16> {
    ports.iter().copied().find(|p| used.contains(p))
}

impl ProjectRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    async fn ports_in_use(slots: &HashMap<String, Arc<ProjectSlot>>, except: &str) -> HashSet<u16> {
        let mut used = HashSet::new();
        for (id, slot) in slots {
            if id != except {
                used.extend(slot.state.read().await.config.host_ports());
            }
        }
        used
    }

    /// Insert a new project. Fails with `Conflict` when the id or one of
    /// its ports is taken.
    pub async fn register(&self, entry: ProjectEntry) -> Result<Arc<ProjectSlot>> {
        let mut slots = self.slots.write().await;
        let project_id = entry.info.project_id.clone();
        if slots.contains_key(&project_id) {
            return Err(Error::Conflict {
                project_id,
                reason: "project id is already registered".into(),
            });
        }
        let used = Self::ports_in_use(&slots, &project_id).await;
        if let Some(port) = port_conflicts(&entry.config.host_ports(), &used) {
            return Err(Error::Conflict {
                project_id,
                reason: format!("port {port} is already in use"),
            });
        }
        let slot = Arc::new(ProjectSlot::new(entry));
        slots.insert(project_id, slot.clone());
        Ok(slot)
    }

    /// Replace the config and manifest of a leased project after checking
    /// that its new ports are free.
    pub async fn replace_config(
        &self,
        lease: &ProjectLease,
        config: ProjectConfig,
        manifest: ProjectManifest,
    ) -> Result<()> {
        let slots = self.slots.write().await;
        let used = Self::ports_in_use(&slots, lease.project_id()).await;
        if let Some(port) = port_conflicts(&config.host_ports(), &used) {
            return Err(Error::Conflict {
                project_id: lease.project_id().to_string(),
                reason: format!("port {port} is already in use"),
            });
        }
        let mut entry = lease.write().await;
        entry.info.endpoint = manifest.endpoint.clone();
        entry.info.db_endpoint = manifest.db_endpoint.clone();
        entry.config = config;
        entry.manifest = manifest;
        Ok(())
    }

    /// Slot of a registered project.
    pub async fn get(&self, project_id: &str) -> Option<Arc<ProjectSlot>> {
        self.slots.read().await.get(project_id).cloned()
    }

    /// Remove a leased project. A slot re-registered under the same id is
    /// left alone.
    pub async fn remove(&self, lease: &ProjectLease) {
        let mut slots = self.slots.write().await;
        if slots
            .get(lease.project_id())
            .is_some_and(|s| Arc::ptr_eq(s, lease.slot()))
        {
            slots.remove(lease.project_id());
        }
        lease.slot.removed.store(true, Ordering::SeqCst);
    }

    /// Every registered slot, in id order.
    pub async fn list(&self) -> Vec<Arc<ProjectSlot>> {
        let slots = self.slots.read().await;
        let mut list: Vec<_> = slots.values().cloned().collect();
        list.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        list
    }

    /// Registered project ids.
    pub async fn ids(&self) -> HashSet<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    /// Host ports claimed by registered projects.
    pub async fn used_ports(&self) -> HashSet<u16> {
        let slots = self.slots.read().await;
        Self::ports_in_use(&slots, "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::config;
    use crate::template::{self, TemplateContext};

    fn entry(id: &str, db_port: u16, api_port: u16) -> ProjectEntry {
        let config = config(id, db_port, api_port);
        let manifest = template::render(&config, &TemplateContext::default());
        ProjectEntry {
            info: ProjectInfo::new(id, manifest.endpoint.clone(), manifest.db_endpoint.clone()),
            config,
            manifest,
            persisted: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_and_port_conflicts() {
        let registry = ProjectRegistry::new();
        registry.register(entry("p1", 5433, 54321)).await.unwrap();
        assert!(matches!(
            registry.register(entry("p1", 6000, 6001)).await,
            Err(Error::Conflict { .. })
        ));
        assert!(matches!(
            registry.register(entry("p2", 5433, 6001)).await,
            Err(Error::Conflict { .. })
        ));
        registry.register(entry("p2", 5434, 54323)).await.unwrap();
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let registry = ProjectRegistry::new();
        let slot = registry.register(entry("p1", 5433, 54321)).await.unwrap();
        let lease = slot.lease().await;
        assert!(slot.try_lease().is_none());
        drop(lease);
        assert!(slot.try_lease().is_some());
    }

    #[tokio::test]
    async fn test_remove_marks_slot() {
        let registry = ProjectRegistry::new();
        let slot = registry.register(entry("p1", 5433, 54321)).await.unwrap();
        let lease = slot.lease().await;
        registry.remove(&lease).await;
        assert!(slot.is_removed());
        assert!(registry.get("p1").await.is_none());
        assert!(registry.used_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_replace_config_checks_ports() {
        let registry = ProjectRegistry::new();
        registry.register(entry("p1", 5433, 54321)).await.unwrap();
        let slot = registry.register(entry("p2", 5434, 54323)).await.unwrap();
        let lease = slot.lease().await;

        let taken = config("p2", 5434, 54321);
        let manifest = template::render(&taken, &TemplateContext::default());
        assert!(registry.replace_config(&lease, taken, manifest).await.is_err());

        let free = config("p2", 5434, 54400);
        let manifest = template::render(&free, &TemplateContext::default());
        registry.replace_config(&lease, free, manifest).await.unwrap();
        assert_eq!(lease.read().await.config.api_port, 54400);
        assert!(lease.read().await.info.endpoint.ends_with(":54400"));
    }
}
