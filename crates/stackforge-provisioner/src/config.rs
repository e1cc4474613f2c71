// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for stackforge-provisioner.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::adapter::DockerAdapterConfig;
use crate::quota::QuotaPlan;
use crate::template::TemplateContext;

/// Provisioner configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for project records (absent = in-memory store)
    pub database_url: Option<String>,
    /// Data directory for project files, backup artifacts and the catalog
    pub data_dir: PathBuf,
    /// Docker CLI settings
    pub docker: DockerAdapterConfig,
    /// Host and image settings used when rendering projects
    pub template: TemplateContext,
    /// First database host port handed out to new projects
    pub base_db_port: u16,
    /// First API gateway host port handed out to new projects
    pub base_api_port: u16,
    /// Plan for projects that do not name one
    pub default_plan: QuotaPlan,
    /// Pause projects that stay over quota past the grace period
    pub pause_over_quota: bool,
    /// How long a project may stay over quota
    pub quota_grace_period: Duration,
    /// Secret from which the artifact encryption key is derived
    pub backup_encryption_secret: Option<String>,
    /// Base URL for signed backup downloads
    pub backup_download_base_url: Option<String>,
    /// Key signing download URLs
    pub download_signing_secret: Option<String>,
    /// Health sweep interval
    pub health_check_interval: Duration,
    /// Quota usage recomputation interval
    pub quota_update_interval: Duration,
    /// Backup schedule check interval
    pub backup_schedule_interval: Duration,
    /// Expired backup cleanup interval
    pub backup_retention_interval: Duration,
    /// Probe deadline for starting projects
    pub probe_timeout: Duration,
    /// Maximum concurrently running long operations
    pub max_concurrent_operations: usize,
    /// How long shutdown waits for running operations
    pub shutdown_grace: Duration,
    /// Remote artifact storage (used with the `s3` feature)
    pub s3: Option<S3Settings>,
}

/// Object storage location for backup artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// Bucket name
    pub bucket: String,
    /// Region (default: from the AWS environment)
    pub region: Option<String>,
    /// Key prefix
    pub prefix: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok())?;
        config.docker = DockerAdapterConfig::from_env();
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("STACKFORGE_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .filter(|v| !v.is_empty());

        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let defaults = TemplateContext::default();
        let template = TemplateContext {
            public_host: lookup("PROVISIONING_PUBLIC_HOST").unwrap_or(defaults.public_host),
            domain_base: lookup("DOMAIN_BASE_URL").filter(|v| !v.is_empty()),
            postgres_image: lookup("POSTGRES_DOCKER_IMAGE").unwrap_or(defaults.postgres_image),
            postgres_version: lookup("POSTGRES_DEFAULT_VERSION")
                .unwrap_or(defaults.postgres_version),
        };

        let s3 = lookup("S3_BUCKET")
            .filter(|v| !v.is_empty())
            .map(|bucket| S3Settings {
                bucket,
                region: lookup("S3_REGION").filter(|v| !v.is_empty()),
                prefix: lookup("S3_PREFIX").unwrap_or_else(|| "backups".to_string()),
            });

        Ok(Self {
            database_url,
            data_dir,
            docker: DockerAdapterConfig::default(),
            template,
            base_db_port: parse(&lookup, "PROVISIONING_BASE_POSTGRES_PORT", 5433)?,
            base_api_port: parse(&lookup, "PROVISIONING_BASE_KONG_HTTP_PORT", 54321)?,
            default_plan: parse(&lookup, "QUOTA_DEFAULT_PLAN", QuotaPlan::Free)?,
            pause_over_quota: flag(&lookup, "QUOTA_PAUSE_OVER_LIMIT"),
            quota_grace_period: secs(&lookup, "QUOTA_GRACE_PERIOD_SECS", 24 * 3600)?,
            backup_encryption_secret: lookup("BACKUP_ENCRYPTION_SECRET").filter(|v| !v.is_empty()),
            backup_download_base_url: lookup("BACKUP_DOWNLOAD_BASE_URL")
                .filter(|v| !v.is_empty()),
            download_signing_secret: lookup("ENCRYPTION_SECRET").filter(|v| !v.is_empty()),
            health_check_interval: secs(&lookup, "HEALTH_CHECK_INTERVAL_SECS", 30)?,
            quota_update_interval: secs(&lookup, "QUOTA_UPDATE_INTERVAL_SECS", 300)?,
            backup_schedule_interval: secs(&lookup, "BACKUP_SCHEDULE_INTERVAL_SECS", 60)?,
            backup_retention_interval: secs(&lookup, "BACKUP_RETENTION_INTERVAL_SECS", 3600)?,
            probe_timeout: secs(&lookup, "PROVISIONING_PROBE_TIMEOUT_SECS", 180)?,
            max_concurrent_operations: parse(&lookup, "PROVISIONING_MAX_CONCURRENT", 16)?,
            shutdown_grace: secs(&lookup, "SHUTDOWN_GRACE_SECS", 30)?,
            s3,
        })
    }

    /// Directory holding one sub-directory per project.
    pub fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    /// Directory holding backup artifacts.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("backups").join("artifacts")
    }

    /// Scratch directory for artifacts in transit.
    pub fn backup_work_dir(&self) -> PathBuf {
        self.data_dir.join("backups").join("tmp")
    }

    /// Backup catalog file.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("backups").join("catalog.json")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse(lookup, name, default).map(Duration::from_secs)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> bool {
    lookup(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
}
