// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup artifact transport.
//!
//! [`BackupStorage`] moves finished artifacts between a local path and a
//! storage key. [`LocalBackupStorage`] keeps artifacts under a directory and
//! hands out HMAC-signed download URLs; the `s3` feature adds an object
//! storage backend.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors from backup storage backends.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// No artifact under the key.
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// Key is empty, absolute or escapes the storage root.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    /// Remote backend call failed.
    #[error("{operation} failed: {message}")]
    Remote {
        /// Backend operation.
        operation: &'static str,
        /// Backend message.
        message: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Artifact transport, implementable over a filesystem or an object store.
#[async_trait]
pub trait BackupStorage: Send + Sync {
    /// Storage type identifier (e.g. "local", "s3").
    fn storage_type(&self) -> &'static str;

    /// Copy the file at `path` to `key`. Returns the stored size.
    async fn upload(&self, path: &Path, key: &str) -> Result<u64>;

    /// Copy the artifact at `key` to `path`.
    async fn download(&self, key: &str, path: &Path) -> Result<()>;

    /// Remove the artifact at `key`. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// URL from which the artifact can be fetched for `ttl`.
    async fn get_download_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Filesystem-backed artifact storage.
#[derive(Clone)]
pub struct LocalBackupStorage {
    root: PathBuf,
    base_url: Option<String>,
    signing_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for LocalBackupStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackupStorage")
            .field("root", &self.root)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LocalBackupStorage {
    /// Store artifacts under `root`; download URLs are `file://` paths.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base_url: None,
            signing_key: None,
        }
    }

    /// Serve download URLs from `base_url`, signed with `signing_key`.
    pub fn with_download_base(mut self, base_url: impl Into<String>, signing_key: &[u8]) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self.signing_key = Some(signing_key.to_vec());
        self
    }

    /// Storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a key.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn signature(&self, key: &str, expires: i64) -> Option<String> {
        let secret = self.signing_key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a signature produced by [`get_download_url`](BackupStorage::get_download_url).
    pub fn verify_download(&self, key: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let (Some(secret), Ok(given)) = (self.signing_key.as_ref(), hex::decode(signature)) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
            return false;
        };
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.verify_slice(&given).is_ok()
    }
}

fn not_found(key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl BackupStorage for LocalBackupStorage {
    fn storage_type(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, path: &Path, key: &str) -> Result<u64> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = tokio::fs::copy(path, &target).await?;
        Ok(size)
    }

    async fn download(&self, key: &str, path: &Path) -> Result<()> {
        let source = self.path_for(key)?;
        tokio::fs::copy(&source, path)
            .await
            .map_err(|e| not_found(key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_download_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        match (&self.base_url, self.signature(key, expires)) {
            (Some(base), Some(signature)) => Ok(format!(
                "{base}/{key}?expires={expires}&signature={signature}"
            )),
            _ => Ok(format!("file://{}", path.display())),
        }
    }
}
