// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3-compatible backup storage.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use super::storage::{BackupStorage, Result, StorageError};

/// Artifact storage in an S3 bucket.
#[derive(Clone)]
pub struct S3BackupStorage {
    client: Client,
    bucket: String,
    prefix: String,
}

fn remote(operation: &'static str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Remote {
        operation,
        message: err.to_string(),
    }
}

impl S3BackupStorage {
    /// Build a client from the default AWS configuration chain.
    pub async fn new(bucket: impl Into<String>, region: Option<String>, prefix: impl Into<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let conf = loader.load().await;
        Self {
            client: Client::new(&conf),
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }
}

#[async_trait]
impl BackupStorage for S3BackupStorage {
    fn storage_type(&self) -> &'static str {
        "s3"
    }

    async fn upload(&self, path: &Path, key: &str) -> Result<u64> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| remote("put_object", e))?;
        Ok(size)
    }

    async fn download(&self, key: &str, path: &Path) -> Result<()> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    remote("get_object", e)
                }
            })?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| remote("get_object", e))?
            .into_bytes();
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| remote("delete_object", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.object_key(prefix))
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| remote("list_objects_v2", e))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    let key = key
                        .strip_prefix(self.prefix.as_str())
                        .map(|k| k.trim_start_matches('/'))
                        .unwrap_or(key);
                    keys.push(key.to_string());
                }
            }
            token = page.next_continuation_token().map(str::to_string);
            if token.is_none() {
                break;
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get_download_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| remote("presign", e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .presigned(presigning)
            .await
            .map_err(|e| remote("presign", e))?;
        Ok(request.uri().to_string())
    }
}
