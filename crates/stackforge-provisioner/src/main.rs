// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stackforge Provisioner - Project Lifecycle Management Daemon
//!
//! Runs the provisioner against the local Docker daemon:
//! - Recovers projects and interrupted backups from the data directory
//! - Probes project health and reaps orphaned containers
//! - Recomputes quota usage
//! - Fires backup schedules and deletes expired backups

use std::sync::Arc;
use tracing::{info, warn};

use stackforge_provisioner::adapter::{DockerAdapter, RuntimeAdapter};
use stackforge_provisioner::config::Config;
use stackforge_provisioner::persistence::{MemoryProjectStore, PostgresProjectStore, ProjectStore};
use stackforge_provisioner::runtime::ProvisionerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stackforge_provisioner=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        public_host = %config.template.public_host,
        default_plan = %config.default_plan,
        "Starting Stackforge Provisioner"
    );

    // Project records
    let store: Arc<dyn ProjectStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresProjectStore::connect(url).await?;
            info!("Connected to database");
            Arc::new(store)
        }
        None => {
            warn!("No database configured; project records are kept in memory");
            Arc::new(MemoryProjectStore::new())
        }
    };

    // Container runtime
    let adapter = Arc::new(DockerAdapter::new(config.docker.clone()));
    info!(adapter_type = adapter.adapter_type(), "Runtime adapter initialized");

    let builder = ProvisionerRuntime::builder()
        .config(&config)
        .adapter(adapter)
        .store(store);

    #[cfg(feature = "s3")]
    let builder = match &config.s3 {
        Some(s3) => {
            let storage = stackforge_provisioner::backup::S3BackupStorage::new(
                s3.bucket.clone(),
                s3.region.clone(),
                s3.prefix.clone(),
            )
            .await;
            info!(bucket = %s3.bucket, prefix = %s3.prefix, "Remote backup storage enabled");
            builder.remote_storage(Arc::new(storage))
        }
        None => builder,
    };
    #[cfg(not(feature = "s3"))]
    if config.s3.is_some() {
        warn!("S3_BUCKET is set but this build has no s3 feature; artifacts stay local");
    }

    // Start the runtime
    let runtime = builder.build()?.start().await?;

    info!("Provisioner ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Stackforge Provisioner shut down");

    Ok(())
}
