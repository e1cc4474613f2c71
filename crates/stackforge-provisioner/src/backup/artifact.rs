// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup artifact format.
//!
//! An artifact is a tar archive:
//!
//! ```text
//! manifest.json      ArtifactManifest
//! database.sql       logical dump (when the backup holds the database)
//! storage/<path>     one entry per storage file (changed files only for INCREMENTAL)
//! config.json        ProjectConfig snapshot (FULL, INCREMENTAL)
//! services.json      rendered ProjectManifest (FULL, INCREMENTAL)
//! ```
//!
//! The archive is optionally gzip-compressed and then optionally encrypted
//! with XChaCha20-Poly1305. Encrypted artifacts start with `SFENC1`, followed
//! by the backup id (used as associated data) and the 24-byte nonce.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::BackupType;
use crate::project::ProjectConfig;
use crate::template::ProjectManifest;

/// Current artifact layout version.
pub const FORMAT_VERSION: u32 = 1;

const ENCRYPTION_MAGIC: &[u8; 6] = b"SFENC1";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const NONCE_LEN: usize = 24;

const MANIFEST_ENTRY: &str = "manifest.json";
const DATABASE_ENTRY: &str = "database.sql";
const CONFIG_ENTRY: &str = "config.json";
const SERVICES_ENTRY: &str = "services.json";
const STORAGE_PREFIX: &str = "storage/";

/// Errors building or opening artifacts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArtifactError {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The artifact is encrypted and no key is configured.
    #[error("artifact is encrypted but no encryption key is configured")]
    MissingKey,

    /// Encryption failed.
    #[error("artifact encryption failed")]
    Encrypt,

    /// Wrong key or tampered artifact.
    #[error("artifact could not be decrypted")]
    Decrypt,

    /// The archive is not a valid artifact.
    #[error("corrupt artifact: {0}")]
    Corrupt(String),
}

type Result<T> = std::result::Result<T, ArtifactError>;

/// Symmetric key for artifact encryption, derived from an operator secret.
#[derive(Clone)]
pub struct ArtifactKey([u8; 32]);

impl ArtifactKey {
    /// Derive the key as SHA-256 of the secret.
    pub fn from_secret(secret: &str) -> Self {
        Self(Sha256::digest(secret.as_bytes()).into())
    }
}

impl std::fmt::Debug for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ArtifactKey(***)")
    }
}

/// Metadata stored as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Layout version.
    pub format_version: u32,
    /// Backup the artifact belongs to.
    pub backup_id: String,
    /// Project the content was captured from.
    pub project_id: String,
    /// Backup type.
    pub backup_type: BackupType,
    /// Base backup for incremental artifacts.
    #[serde(default)]
    pub base_backup_id: Option<String>,
    /// Capture time.
    pub created_at: DateTime<Utc>,
    /// Storage paths deleted since the base backup.
    #[serde(default)]
    pub removed_files: Vec<String>,
}

/// Decoded artifact content.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    /// Metadata.
    pub manifest: ArtifactManifest,
    /// Database dump, when captured (and, for incrementals, changed).
    pub database: Option<Vec<u8>>,
    /// Storage files (changed files only for incrementals).
    pub files: BTreeMap<String, Vec<u8>>,
    /// Project configuration snapshot.
    pub config: Option<ProjectConfig>,
    /// Rendered services at capture time.
    pub services: Option<ProjectManifest>,
}

/// Serialize an artifact to a tar archive.
pub fn pack(artifact: &Artifact) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, MANIFEST_ENTRY, &serde_json::to_vec_pretty(&artifact.manifest)?)?;
    if let Some(db) = &artifact.database {
        append(&mut builder, DATABASE_ENTRY, db)?;
    }
    for (path, data) in &artifact.files {
        append(&mut builder, &format!("{STORAGE_PREFIX}{path}"), data)?;
    }
    if let Some(config) = &artifact.config {
        append(&mut builder, CONFIG_ENTRY, &serde_json::to_vec_pretty(config)?)?;
    }
    if let Some(services) = &artifact.services {
        append(&mut builder, SERVICES_ENTRY, &serde_json::to_vec_pretty(services)?)?;
    }
    Ok(builder.into_inner()?)
}

/// Parse a tar archive produced by [`pack`].
pub fn unpack(bytes: &[u8]) -> Result<Artifact> {
    let mut entries = read_tree(bytes)?;
    let manifest_bytes = entries
        .remove(MANIFEST_ENTRY)
        .ok_or_else(|| ArtifactError::Corrupt("manifest.json missing".into()))?;
    let manifest: ArtifactManifest = serde_json::from_slice(&manifest_bytes)?;
    if manifest.format_version > FORMAT_VERSION {
        return Err(ArtifactError::Corrupt(format!(
            "unsupported format version {}",
            manifest.format_version
        )));
    }
    let database = entries.remove(DATABASE_ENTRY);
    let config = entries
        .remove(CONFIG_ENTRY)
        .map(|b| serde_json::from_slice(&b))
        .transpose()?;
    let services = entries
        .remove(SERVICES_ENTRY)
        .map(|b| serde_json::from_slice(&b))
        .transpose()?;
    let files = entries
        .into_iter()
        .filter_map(|(path, data)| {
            path.strip_prefix(STORAGE_PREFIX)
                .map(|p| (p.to_string(), data))
        })
        .collect();
    Ok(Artifact {
        manifest,
        database,
        files,
        config,
        services,
    })
}

/// Pack, then optionally compress, then optionally encrypt.
pub fn seal(artifact: &Artifact, compress: bool, key: Option<&ArtifactKey>) -> Result<Vec<u8>> {
    let mut bytes = pack(artifact)?;
    if compress {
        bytes = gzip(&bytes)?;
    }
    if let Some(key) = key {
        bytes = encrypt(&bytes, key, &artifact.manifest.backup_id)?;
    }
    Ok(bytes)
}

/// Reverse of [`seal`]; compression and encryption are detected.
pub fn open(bytes: &[u8], key: Option<&ArtifactKey>) -> Result<Artifact> {
    let mut bytes = bytes.to_vec();
    if is_encrypted(&bytes) {
        let key = key.ok_or(ArtifactError::MissingKey)?;
        bytes = decrypt(&bytes, key)?;
    }
    if bytes.starts_with(&GZIP_MAGIC) {
        bytes = gunzip(&bytes)?;
    }
    unpack(&bytes)
}

/// Whether the bytes start with the encryption header.
pub fn is_encrypted(bytes: &[u8]) -> bool {
    bytes.starts_with(ENCRYPTION_MAGIC)
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

fn encrypt(plaintext: &[u8], key: &ArtifactKey, backup_id: &str) -> Result<Vec<u8>> {
    let id = backup_id.as_bytes();
    let id_len = u16::try_from(id.len())
        .map_err(|_| ArtifactError::Corrupt("backup id too long".into()))?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad: id })
        .map_err(|_| ArtifactError::Encrypt)?;

    let mut out = Vec::with_capacity(ENCRYPTION_MAGIC.len() + 2 + id.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ENCRYPTION_MAGIC);
    out.extend_from_slice(&id_len.to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(bytes: &[u8], key: &ArtifactKey) -> Result<Vec<u8>> {
    let rest = &bytes[ENCRYPTION_MAGIC.len()..];
    if rest.len() < 2 {
        return Err(ArtifactError::Decrypt);
    }
    let id_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let rest = &rest[2..];
    if rest.len() < id_len + NONCE_LEN {
        return Err(ArtifactError::Decrypt);
    }
    let (id, rest) = rest.split_at(id_len);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: id })
        .map_err(|_| ArtifactError::Decrypt)
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Regular files of a tar archive by relative path (leading `./` removed).
pub fn read_tree(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    if bytes.is_empty() {
        return Ok(files);
    }
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let path = path.trim_start_matches("./").to_string();
        if path.is_empty() || path.split('/').any(|part| part == "..") {
            return Err(ArtifactError::Corrupt(format!("unsafe path {path:?}")));
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(path, data);
    }
    Ok(files)
}

/// Build a tar archive from relative paths.
pub fn write_tree(files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        append(&mut builder, path, data)?;
    }
    Ok(builder.into_inner()?)
}

/// Hex SHA-256 of some bytes.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content digests of a completed backup, used to compute incremental deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentIndex {
    /// Digest of the database dump.
    pub database: Option<String>,
    /// Digest per storage path.
    pub files: BTreeMap<String, String>,
}

impl ContentIndex {
    /// Index captured content.
    pub fn of(database: Option<&[u8]>, files: &BTreeMap<String, Vec<u8>>) -> Self {
        Self {
            database: database.map(digest),
            files: files
                .iter()
                .map(|(path, data)| (path.clone(), digest(data)))
                .collect(),
        }
    }
}

/// What an incremental backup must store relative to its base.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    /// Dump, only when it changed.
    pub database: Option<Vec<u8>>,
    /// New or changed files.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Paths present in the base but gone now.
    pub removed_files: Vec<String>,
}

/// Compute the delta of captured content against a base index.
pub fn delta(
    base: &ContentIndex,
    database: Vec<u8>,
    files: BTreeMap<String, Vec<u8>>,
) -> Delta {
    let database = (base.database.as_deref() != Some(digest(&database).as_str())).then_some(database);
    let removed_files = base
        .files
        .keys()
        .filter(|path| !files.contains_key(*path))
        .cloned()
        .collect();
    let files = files
        .into_iter()
        .filter(|(path, data)| base.files.get(path) != Some(&digest(data)))
        .collect();
    Delta {
        database,
        files,
        removed_files,
    }
}

/// Replay a chain of artifacts, oldest (the full base) first.
///
/// Returns the database dump and file tree as of the last artifact.
pub fn replay(chain: &[Artifact]) -> (Option<Vec<u8>>, BTreeMap<String, Vec<u8>>) {
    let mut database = None;
    let mut files = BTreeMap::new();
    for artifact in chain {
        if let Some(db) = &artifact.database {
            database = Some(db.clone());
        }
        for path in &artifact.manifest.removed_files {
            files.remove(path);
        }
        files.extend(artifact.files.iter().map(|(p, d)| (p.clone(), d.clone())));
    }
    (database, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::fixtures::config;

    fn artifact(backup_id: &str, backup_type: BackupType) -> Artifact {
        Artifact {
            manifest: ArtifactManifest {
                format_version: FORMAT_VERSION,
                backup_id: backup_id.to_string(),
                project_id: "p1".to_string(),
                backup_type,
                base_backup_id: None,
                created_at: Utc::now(),
                removed_files: vec![],
            },
            database: Some(b"CREATE TABLE t();".to_vec()),
            files: BTreeMap::from([("a/b.txt".to_string(), b"hello".to_vec())]),
            config: Some(config("p1", 5433, 54321)),
            services: None,
        }
    }

    #[test]
    fn test_seal_open_with_compression_and_encryption() {
        let key = ArtifactKey::from_secret("secret");
        let original = artifact("b1", BackupType::Full);
        let sealed = seal(&original, true, Some(&key)).unwrap();
        assert!(is_encrypted(&sealed));
        assert_eq!(open(&sealed, Some(&key)).unwrap(), original);
    }

    #[test]
    fn test_plain_artifact_is_a_tar() {
        let sealed = seal(&artifact("b1", BackupType::Full), false, None).unwrap();
        let tree = read_tree(&sealed).unwrap();
        assert!(tree.contains_key("manifest.json"));
        assert!(tree.contains_key("database.sql"));
        assert!(tree.contains_key("storage/a/b.txt"));
        assert!(tree.contains_key("config.json"));
    }

    #[test]
    fn test_wrong_key_or_missing_key_fails() {
        let sealed = seal(&artifact("b1", BackupType::Full), true, Some(&ArtifactKey::from_secret("a"))).unwrap();
        assert!(matches!(
            open(&sealed, Some(&ArtifactKey::from_secret("b"))),
            Err(ArtifactError::Decrypt)
        ));
        assert!(matches!(open(&sealed, None), Err(ArtifactError::MissingKey)));
    }

    #[test]
    fn test_tampered_backup_id_fails_authentication() {
        let key = ArtifactKey::from_secret("a");
        let mut sealed = seal(&artifact("b1", BackupType::Full), false, Some(&key)).unwrap();
        // Header: magic, u16 length, id bytes.
        sealed[8] = b'x';
        assert!(matches!(open(&sealed, Some(&key)), Err(ArtifactError::Decrypt)));
    }

    #[test]
    fn test_read_tree_strips_dot_prefix_and_skips_dirs() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "./avatars/", &b""[..]).unwrap();
        append(&mut builder, "./avatars/a.png", b"png").unwrap();
        let bytes = builder.into_inner().unwrap();

        let tree = read_tree(&bytes).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree["avatars/a.png"], b"png");
    }

    #[test]
    fn test_delta_and_replay() {
        let base_files = BTreeMap::from([
            ("keep.txt".to_string(), b"same".to_vec()),
            ("edit.txt".to_string(), b"v1".to_vec()),
            ("gone.txt".to_string(), b"bye".to_vec()),
        ]);
        let base_index = ContentIndex::of(Some(b"db-v1"), &base_files);

        let current = BTreeMap::from([
            ("keep.txt".to_string(), b"same".to_vec()),
            ("edit.txt".to_string(), b"v2".to_vec()),
            ("new.txt".to_string(), b"hi".to_vec()),
        ]);
        let d = delta(&base_index, b"db-v1".to_vec(), current.clone());
        assert_eq!(d.database, None);
        assert_eq!(d.files.keys().collect::<Vec<_>>(), ["edit.txt", "new.txt"]);
        assert_eq!(d.removed_files, vec!["gone.txt".to_string()]);

        let mut full = artifact("b1", BackupType::Full);
        full.database = Some(b"db-v1".to_vec());
        full.files = base_files;
        let mut inc = artifact("b2", BackupType::Incremental);
        inc.database = d.database;
        inc.files = d.files;
        inc.manifest.removed_files = d.removed_files;

        let (db, files) = replay(&[full, inc]);
        assert_eq!(db.unwrap(), b"db-v1");
        assert_eq!(files, current);
    }
}
