// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime adapter.
//!
//! Drives the `docker` CLI. Every resource is created with the labels
//! `stackforge.managed=true` and `stackforge.project={id}` so that project
//! teardown and the orphan sweep can find it by label. Containers also carry
//! `stackforge.service={name}` and join the project network under their
//! logical service name.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::traits::*;

const MANAGED_LABEL: &str = "stackforge.managed";
const PROJECT_LABEL: &str = "stackforge.project";
const SERVICE_LABEL: &str = "stackforge.service";

/// Configuration for the Docker adapter.
#[derive(Debug, Clone)]
pub struct DockerAdapterConfig {
    /// Path or name of the docker binary.
    pub docker_bin: String,
    /// Deadline for a single CLI invocation.
    pub command_timeout: Duration,
    /// Image used to measure volume sizes.
    pub helper_image: String,
}

impl Default for DockerAdapterConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            command_timeout: Duration::from_secs(120),
            helper_image: "busybox:1.36".to_string(),
        }
    }
}

impl DockerAdapterConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DOCKER_BIN`: docker binary (default: `docker`)
    /// - `DOCKER_COMMAND_TIMEOUT_SECS`: per-command deadline (default: 120)
    /// - `DOCKER_HELPER_IMAGE`: image used for volume inspection (default: `busybox:1.36`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            docker_bin: std::env::var("DOCKER_BIN").unwrap_or(defaults.docker_bin),
            command_timeout: std::env::var("DOCKER_COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
            helper_image: std::env::var("DOCKER_HELPER_IMAGE").unwrap_or(defaults.helper_image),
        }
    }
}

/// Runtime adapter backed by the Docker CLI.
pub struct DockerAdapter {
    config: DockerAdapterConfig,
}

impl DockerAdapter {
    /// Create an adapter with the given configuration.
    pub fn new(config: DockerAdapterConfig) -> Self {
        Self { config }
    }

    /// Create an adapter configured from the environment.
    pub fn from_env() -> Self {
        Self::new(DockerAdapterConfig::from_env())
    }

    /// Run one docker command and return its raw output.
    ///
    /// Spawn failures and daemon connection errors map to
    /// [`RuntimeError::Unavailable`]. A non-zero exit is returned as output;
    /// callers decide whether it is an error.
    async fn run(
        &self,
        operation: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<std::process::Output> {
        debug!(operation, args = ?redact(args), "docker");

        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::Unavailable(format!(
                "failed to run {}: {e}",
                self.config.docker_bin
            ))
        })?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(tokio::spawn(async move {
                let result = pipe.write_all(&data).await;
                drop(pipe);
                result
            })),
            _ => None,
        };

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: operation.to_string(),
                timeout: self.config.command_timeout,
            })??;

        if let Some(writer) = writer
            && let Ok(Err(e)) = writer.await
        {
            warn!(operation, error = %e, "Failed to write stdin to docker");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_daemon_unreachable(&stderr) {
                return Err(RuntimeError::Unavailable(stderr.trim().to_string()));
            }
        }
        Ok(output)
    }

    /// Run a docker command that must succeed; returns trimmed stdout.
    async fn run_ok(&self, operation: &str, args: &[String]) -> Result<String> {
        let output = self.run(operation, args, None).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(classify_failure(
            operation,
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn list_by_label(&self, kind: &[&str], project_id: &str) -> Result<Vec<String>> {
        let mut args = strings(kind);
        args.extend(strings(&["-q", "--filter"]));
        args.push(format!("label={PROJECT_LABEL}={project_id}"));
        let out = self.run_ok("list", &args).await?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    async fn exec_shell(&self, container_id: &str, script: String) -> Result<bool> {
        let command = vec!["sh".to_string(), "-c".to_string(), script];
        let output = self.exec(container_id, &command, None).await?;
        Ok(output.success())
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    fn adapter_type(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.run_ok("ping", &strings(&["version", "--format", "{{.Server.Version}}"]))
            .await
            .map(|version| debug!(version = %version, "Docker daemon reachable"))
    }

    async fn create_network(&self, project_id: &str, name: &str) -> Result<()> {
        let mut args = strings(&["network", "create"]);
        args.extend(labels(project_id, None));
        args.push(name.to_string());
        match self.run_ok("create_network", &args).await {
            Err(RuntimeError::Command { message, .. }) if message.contains("already exists") => {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    async fn create_volume(&self, project_id: &str, name: &str) -> Result<()> {
        let mut args = strings(&["volume", "create"]);
        args.extend(labels(project_id, None));
        args.push(name.to_string());
        self.run_ok("create_volume", &args).await.map(|_| ())
    }

    async fn create_container(
        &self,
        project_id: &str,
        network: &str,
        spec: &ServiceSpec,
    ) -> Result<String> {
        let args = run_args(project_id, network, spec);
        self.run_ok("create_container", &args).await
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.run_ok("start_container", &strings(&["start", container_id]))
            .await
            .map(|_| ())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.run_ok("stop_container", &strings(&["stop", "-t", "10", container_id]))
            .await
            .map(|_| ())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        match self
            .run_ok("remove_container", &strings(&["rm", "-f", "-v", container_id]))
            .await
        {
            Err(RuntimeError::ContainerNotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let args = vec![
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container_id.to_string(),
        ];
        let output = self.run("logs", &args, None).await?;
        if !output.status.success() {
            return Err(classify_failure(
                "logs",
                &String::from_utf8_lossy(&output.stderr),
            ));
        }
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("-i".to_string());
        }
        args.push(container_id.to_string());
        args.extend(command.iter().cloned());

        let output = self.run("exec", &args, stdin).await?;
        let code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Err(RuntimeError::ContainerNotFound(container_id.to_string()));
            }
            if stderr.contains("is not running") {
                return Err(RuntimeError::NotRunning(container_id.to_string()));
            }
        }
        Ok(ExecOutput {
            exit_code: code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn probe(&self, container_id: &str, probe: &HealthProbe) -> Result<bool> {
        let state = self
            .run_ok(
                "probe",
                &strings(&["inspect", "-f", "{{.State.Running}}", container_id]),
            )
            .await?;
        if state != "true" {
            return Ok(false);
        }
        match probe {
            HealthProbe::Running => Ok(true),
            HealthProbe::Tcp { port } => {
                self.exec_shell(
                    container_id,
                    format!(
                        "nc -z 127.0.0.1 {port} 2>/dev/null || (echo > /dev/tcp/127.0.0.1/{port}) 2>/dev/null"
                    ),
                )
                .await
            }
            HealthProbe::Http { port, path } => {
                let url = format!("http://127.0.0.1:{port}{path}");
                self.exec_shell(
                    container_id,
                    format!(
                        "wget -q -O /dev/null {url} 2>/dev/null || curl -fsS -o /dev/null {url}"
                    ),
                )
                .await
            }
            HealthProbe::Command { command } => {
                Ok(self.exec(container_id, command, None).await?.success())
            }
        }
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats> {
        let out = self
            .run_ok(
                "stats",
                &strings(&[
                    "stats",
                    "--no-stream",
                    "--format",
                    "{{.CPUPerc}}|{{.MemUsage}}",
                    container_id,
                ]),
            )
            .await?;
        parse_stats(&out).ok_or_else(|| RuntimeError::command("stats", format!("unparseable: {out}")))
    }

    async fn volume_size(&self, _project_id: &str, volume: &str) -> Result<u64> {
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{volume}:/data:ro"),
            self.config.helper_image.clone(),
            "du".to_string(),
            "-sk".to_string(),
            "/data".to_string(),
        ];
        let out = self.run_ok("volume_size", &args).await?;
        out.split_whitespace()
            .next()
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .ok_or_else(|| RuntimeError::command("volume_size", format!("unparseable: {out}")))
    }

    async fn remove_project(&self, project_id: &str) -> Result<()> {
        let containers = self.list_by_label(&["ps", "-a"], project_id).await?;
        if !containers.is_empty() {
            let mut args = strings(&["rm", "-f", "-v"]);
            args.extend(containers);
            self.run_ok("remove_project", &args).await?;
        }
        let volumes = self.list_by_label(&["volume", "ls"], project_id).await?;
        if !volumes.is_empty() {
            let mut args = strings(&["volume", "rm", "-f"]);
            args.extend(volumes);
            self.run_ok("remove_project", &args).await?;
        }
        let networks = self.list_by_label(&["network", "ls"], project_id).await?;
        if !networks.is_empty() {
            let mut args = strings(&["network", "rm"]);
            args.extend(networks);
            self.run_ok("remove_project", &args).await?;
        }
        Ok(())
    }

    async fn list_project_ids(&self) -> Result<Vec<String>> {
        let filter = format!("label={MANAGED_LABEL}=true");
        let format = format!("{{{{.Label \"{PROJECT_LABEL}\"}}}}");
        let mut ids = BTreeSet::new();
        for kind in [&["ps", "-a"][..], &["volume", "ls"][..], &["network", "ls"][..]] {
            let mut args = strings(kind);
            args.extend(["--filter".to_string(), filter.clone()]);
            args.extend(["--format".to_string(), format.clone()]);
            let out = self.run_ok("list_project_ids", &args).await?;
            ids.extend(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string));
        }
        Ok(ids.into_iter().collect())
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn labels(project_id: &str, service: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--label".to_string(),
        format!("{MANAGED_LABEL}=true"),
        "--label".to_string(),
        format!("{PROJECT_LABEL}={project_id}"),
    ];
    if let Some(service) = service {
        args.push("--label".to_string());
        args.push(format!("{SERVICE_LABEL}={service}"));
    }
    args
}

/// Arguments for `docker run` creating and starting a service container.
fn run_args(project_id: &str, network: &str, spec: &ServiceSpec) -> Vec<String> {
    let mut args = strings(&["run", "-d", "--restart", "unless-stopped"]);
    args.extend(["--name".to_string(), spec.container_name.clone()]);
    args.extend(["--network".to_string(), network.to_string()]);
    args.extend(["--network-alias".to_string(), spec.name.clone()]);
    args.extend(labels(project_id, Some(&spec.name)));
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host_port, port.container_port));
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{}", mount.volume, mount.target));
    }
    if spec.limits.cpu_millicores > 0 {
        args.push("--cpus".to_string());
        args.push(format!("{:.3}", spec.limits.cpu_millicores as f64 / 1000.0));
    }
    if spec.limits.memory_bytes > 0 {
        args.push("--memory".to_string());
        args.push(spec.limits.memory_bytes.to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Hide `-e KEY=VALUE` values from debug logs.
fn redact(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            let key = arg.split('=').next().unwrap_or_default();
            out.push(format!("{key}=***"));
            hide_next = false;
        } else {
            hide_next = arg == "-e";
            out.push(arg.clone());
        }
    }
    out
}

fn is_daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
        || stderr.contains("Is the docker daemon running")
}

fn classify_failure(operation: &str, stderr: &str) -> RuntimeError {
    let message = stderr.trim();
    if message.contains("No such container") {
        let id = message.rsplit(':').next().unwrap_or_default().trim();
        return RuntimeError::ContainerNotFound(id.to_string());
    }
    if message.contains("is not running") {
        return RuntimeError::NotRunning(message.to_string());
    }
    RuntimeError::command(operation, message)
}

/// Parse `"1.23%|45.6MiB / 1GiB"` from `docker stats`.
fn parse_stats(line: &str) -> Option<ContainerStats> {
    let (cpu, mem) = line.trim().split_once('|')?;
    let cpu_percent = cpu.trim().trim_end_matches('%').parse().ok()?;
    let used = mem.split('/').next()?.trim();
    Some(ContainerStats {
        cpu_percent,
        memory_bytes: parse_size(used)?,
    })
}

/// Parse a human-readable size such as `45.6MiB`, `1.2GB` or `512kB`.
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number.parse().ok()?;
    let factor: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1e12,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * factor).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::config;
    use crate::template::{self, TemplateContext};

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("100B"), Some(100));
        assert_eq!(parse_size("1.5KiB"), Some(1536));
        assert_eq!(parse_size("2MB"), Some(2_000_000));
        assert_eq!(parse_size("1GiB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("12 parsecs"), None);
    }

    #[test]
    fn test_parse_stats_line() {
        let stats = parse_stats("0.25%|64MiB / 1.944GiB").unwrap();
        assert_eq!(stats.cpu_percent, 0.25);
        assert_eq!(stats.memory_bytes, 64 * 1024 * 1024);
        assert!(parse_stats("garbage").is_none());
    }

    #[test]
    fn test_run_args_carry_labels_ports_and_alias() {
        let mut cfg = config("p1", 5433, 54321);
        cfg.limits.cpu_millicores = 7000;
        let manifest = template::render(&cfg, &TemplateContext::default());
        let db = manifest.service("db").unwrap();
        let args = run_args("p1", &manifest.network, db);

        let joined = args.join(" ");
        assert!(joined.starts_with("run -d"));
        assert!(joined.contains("--network stackforge-p1-net"));
        assert!(joined.contains("--network-alias db"));
        assert!(joined.contains("--label stackforge.project=p1"));
        assert!(joined.contains("--label stackforge.service=db"));
        assert!(joined.contains("-p 5433:5432"));
        assert!(joined.contains("--cpus 1.000"));
        assert!(joined.contains("-v stackforge-p1-db-data:/var/lib/postgresql/data"));
        let image_pos = args.iter().position(|a| a == &db.image).unwrap();
        assert_eq!(args[image_pos + 1], "postgres");
    }

    #[test]
    fn test_redact_hides_env_values() {
        let args = strings(&["run", "-e", "POSTGRES_PASSWORD=hunter2", "image"]);
        let redacted = redact(&args);
        assert_eq!(redacted[2], "POSTGRES_PASSWORD=***");
        assert_eq!(redacted[3], "image");
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("logs", "Error: No such container: abc123"),
            RuntimeError::ContainerNotFound(id) if id == "abc123"
        ));
        assert!(matches!(
            classify_failure("create_volume", "boom"),
            RuntimeError::Command { .. }
        ));
        assert!(is_daemon_unreachable(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock."
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let adapter = DockerAdapter::new(DockerAdapterConfig {
            docker_bin: "/nonexistent/docker-binary".to_string(),
            ..DockerAdapterConfig::default()
        });
        assert!(matches!(adapter.ping().await, Err(RuntimeError::Unavailable(_))));
    }
}
