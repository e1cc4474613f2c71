// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime adapter for testing.
//!
//! Simulates containers, networks and volumes in memory. The `db` and
//! `storage` volumes of each project hold a simulated database dump and file
//! tree, and [`RuntimeAdapter::exec`] understands the dump, restore, query and
//! tar command lines the provisioner sends, so backups and restores can be
//! exercised end to end without a container runtime.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::backup::artifact::{read_tree, write_tree};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct MockContainer {
    project_id: String,
    service: String,
    name: String,
    running: bool,
}

#[derive(Debug, Default)]
struct MockProjectData {
    database: Vec<u8>,
    files: BTreeMap<String, Vec<u8>>,
    users: u64,
    tables: u64,
    connections: u64,
}

#[derive(Debug)]
struct MockState {
    next_id: u64,
    networks: HashMap<String, String>,
    volumes: HashMap<String, String>,
    containers: HashMap<String, MockContainer>,
    data: HashMap<String, MockProjectData>,
    unhealthy: HashSet<(String, String)>,
    failing: HashMap<String, Option<String>>,
    available: bool,
    unavailable_calls: u32,
    calls: Vec<String>,
}

impl MockState {
    /// Record a call and apply injected faults.
    fn enter(&mut self, operation: &str, detail: &str) -> Result<()> {
        self.calls.push(format!("{operation}:{detail}"));
        if !self.available {
            return Err(RuntimeError::Unavailable("mock runtime is down".into()));
        }
        if self.unavailable_calls > 0 {
            self.unavailable_calls -= 1;
            return Err(RuntimeError::Unavailable("mock runtime hiccup".into()));
        }
        if let Some(filter) = self.failing.get(operation)
            && filter.as_deref().is_none_or(|f| f == detail)
        {
            return Err(RuntimeError::command(operation, "injected failure"));
        }
        Ok(())
    }

    fn container(&self, id: &str) -> Result<&MockContainer> {
        self.containers
            .get(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    fn running(&self, id: &str) -> Result<&MockContainer> {
        let container = self.container(id)?;
        if !container.running {
            return Err(RuntimeError::NotRunning(id.to_string()));
        }
        Ok(container)
    }
}

/// Mock adapter for testing.
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a reachable mock runtime with no resources.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_id: 0,
                networks: HashMap::new(),
                volumes: HashMap::new(),
                containers: HashMap::new(),
                data: HashMap::new(),
                unhealthy: HashSet::new(),
                failing: HashMap::new(),
                available: true,
                unavailable_calls: 0,
                calls: Vec::new(),
            })),
        }
    }

    /// Create a mock runtime that answers every call with `Unavailable`.
    pub fn unavailable() -> Self {
        let adapter = Self::new();
        if let Ok(mut state) = adapter.state.try_lock() {
            state.available = false;
        }
        adapter
    }

    /// Make the runtime reachable or unreachable.
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
    }

    /// Fail the next `calls` operations with `Unavailable`.
    pub async fn fail_next_calls_unavailable(&self, calls: u32) {
        self.state.lock().await.unavailable_calls = calls;
    }

    /// Fail every `operation` call (optionally only for one service or
    /// resource name) until [`clear_failures`](Self::clear_failures).
    pub async fn fail_operation(&self, operation: &str, detail: Option<&str>) {
        self.state
            .lock()
            .await
            .failing
            .insert(operation.to_string(), detail.map(str::to_string));
    }

    /// Remove injected operation failures.
    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    /// Make a service's probe fail (or pass again).
    pub async fn set_unhealthy(&self, project_id: &str, service: &str, unhealthy: bool) {
        let key = (project_id.to_string(), service.to_string());
        let mut state = self.state.lock().await;
        if unhealthy {
            state.unhealthy.insert(key);
        } else {
            state.unhealthy.remove(&key);
        }
    }

    /// Replace the simulated database contents of a project.
    pub async fn seed_database(&self, project_id: &str, sql: &str) {
        let mut state = self.state.lock().await;
        state.data.entry(project_id.to_string()).or_default().database = sql.as_bytes().to_vec();
    }

    /// Simulated database contents of a project.
    pub async fn database(&self, project_id: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .data
            .get(project_id)
            .map(|d| String::from_utf8_lossy(&d.database).into_owned())
    }

    /// Write a file into a project's storage volume.
    pub async fn put_file(&self, project_id: &str, path: &str, contents: &[u8]) {
        let mut state = self.state.lock().await;
        state
            .data
            .entry(project_id.to_string())
            .or_default()
            .files
            .insert(path.to_string(), contents.to_vec());
    }

    /// Remove a file from a project's storage volume.
    pub async fn remove_file(&self, project_id: &str, path: &str) {
        let mut state = self.state.lock().await;
        if let Some(data) = state.data.get_mut(project_id) {
            data.files.remove(path);
        }
    }

    /// Files in a project's storage volume.
    pub async fn files(&self, project_id: &str) -> BTreeMap<String, Vec<u8>> {
        let state = self.state.lock().await;
        state
            .data
            .get(project_id)
            .map(|d| d.files.clone())
            .unwrap_or_default()
    }

    /// Set the values returned by user, table and connection count queries.
    pub async fn set_db_metrics(&self, project_id: &str, users: u64, tables: u64, connections: u64) {
        let mut state = self.state.lock().await;
        let data = state.data.entry(project_id.to_string()).or_default();
        data.users = users;
        data.tables = tables;
        data.connections = connections;
    }

    /// Every call made so far as `operation:detail`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls made so far.
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    /// Logical names of a project's running services.
    pub async fn running_services(&self, project_id: &str) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state
            .containers
            .values()
            .filter(|c| c.project_id == project_id && c.running)
            .map(|c| c.service.clone())
            .collect()
    }

    /// Containers, networks and volumes tagged with a project.
    pub async fn resource_count(&self, project_id: &str) -> usize {
        let state = self.state.lock().await;
        state.containers.values().filter(|c| c.project_id == project_id).count()
            + state.networks.values().filter(|p| *p == project_id).count()
            + state.volumes.values().filter(|p| *p == project_id).count()
    }
}

#[async_trait]
impl RuntimeAdapter for MockAdapter {
    fn adapter_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        self.state.lock().await.enter("ping", "")
    }

    async fn create_network(&self, project_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("create_network", name)?;
        state.networks.insert(name.to_string(), project_id.to_string());
        Ok(())
    }

    async fn create_volume(&self, project_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("create_volume", name)?;
        state.volumes.insert(name.to_string(), project_id.to_string());
        state.data.entry(project_id.to_string()).or_default();
        Ok(())
    }

    async fn create_container(
        &self,
        project_id: &str,
        network: &str,
        spec: &ServiceSpec,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        state.enter("create_container", &spec.name)?;
        if !state.networks.contains_key(network) {
            return Err(RuntimeError::command(
                "create_container",
                format!("network {network} not found"),
            ));
        }
        if state.containers.values().any(|c| c.name == spec.container_name) {
            return Err(RuntimeError::command(
                "create_container",
                format!("name {} is already in use", spec.container_name),
            ));
        }
        state.next_id += 1;
        let id = format!("mock-{:06}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                project_id: project_id.to_string(),
                service: spec.name.clone(),
                name: spec.container_name.clone(),
                running: true,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("start_container", container_id)?;
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("stop_container", container_id)?;
        match state.containers.get_mut(container_id) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("remove_container", container_id)?;
        state.containers.remove(container_id);
        Ok(())
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let mut state = self.state.lock().await;
        state.enter("logs", container_id)?;
        let container = state.container(container_id)?;
        let lines: Vec<String> = (1..=3)
            .map(|i| format!("{} log line {i}", container.name))
            .collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].join("\n"))
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput> {
        let mut state = self.state.lock().await;
        state.enter("exec", container_id)?;
        let project_id = state.running(container_id)?.project_id.clone();
        let data = state.data.entry(project_id).or_default();

        let program = command.first().map(String::as_str).unwrap_or_default();
        let mut output = ExecOutput::default();
        match program {
            "pg_dump" => output.stdout = data.database.clone(),
            "psql" => match command.iter().position(|a| a == "-c") {
                Some(i) => {
                    let sql = command.get(i + 1).map(String::as_str).unwrap_or_default();
                    let value = if sql.contains("pg_database_size") {
                        data.database.len() as u64
                    } else if sql.contains("auth.users") {
                        data.users
                    } else if sql.contains("information_schema.tables") {
                        data.tables
                    } else if sql.contains("pg_stat_activity") {
                        data.connections
                    } else {
                        0
                    };
                    output.stdout = format!("{value}\n").into_bytes();
                }
                None => data.database = stdin.unwrap_or_default(),
            },
            "tar" if command.get(1).is_some_and(|a| a == "-cf") => {
                output.stdout = write_tree(&data.files)
                    .map_err(|e| RuntimeError::command("exec", e.to_string()))?;
            }
            "tar" => {
                let tree = read_tree(&stdin.unwrap_or_default())
                    .map_err(|e| RuntimeError::command("exec", e.to_string()))?;
                data.files.extend(tree);
            }
            "find" => data.files.clear(),
            "false" => {
                output.exit_code = 1;
                output.stderr = b"command failed\n".to_vec();
            }
            _ => output.stdout = format!("{}\n", command.join(" ")).into_bytes(),
        }
        Ok(output)
    }

    async fn probe(&self, container_id: &str, _probe: &HealthProbe) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.enter("probe", container_id)?;
        let container = state.container(container_id)?;
        let key = (container.project_id.clone(), container.service.clone());
        Ok(container.running && !state.unhealthy.contains(&key))
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let mut state = self.state.lock().await;
        state.enter("stats", container_id)?;
        let container = state.container(container_id)?;
        if !container.running {
            return Ok(ContainerStats::default());
        }
        Ok(ContainerStats {
            cpu_percent: 1.5,
            memory_bytes: 64 * MIB,
        })
    }

    async fn volume_size(&self, project_id: &str, volume: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.enter("volume_size", volume)?;
        let Some(data) = state.data.get(project_id) else {
            return Ok(0);
        };
        if volume.ends_with("-db-data") {
            Ok(data.database.len() as u64)
        } else {
            Ok(data.files.values().map(|f| f.len() as u64).sum())
        }
    }

    async fn remove_project(&self, project_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.enter("remove_project", project_id)?;
        state.containers.retain(|_, c| c.project_id != project_id);
        state.networks.retain(|_, p| p != project_id);
        state.volumes.retain(|_, p| p != project_id);
        state.data.remove(project_id);
        state.unhealthy.retain(|(p, _)| p != project_id);
        Ok(())
    }

    async fn list_project_ids(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        state.enter("list_project_ids", "")?;
        let ids: BTreeSet<String> = state
            .containers
            .values()
            .map(|c| c.project_id.clone())
            .chain(state.networks.values().cloned())
            .chain(state.volumes.values().cloned())
            .collect();
        Ok(ids.into_iter().collect())
    }
}
