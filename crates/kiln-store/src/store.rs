//! Filesystem-backed artifact store.
//!
//! Features:
//! - Atomic publication via build-in-staging-then-rename
//! - Concurrent publishers of the same key handled safely (loser discards)
//! - Staging directories removed on drop, so an aborted producer never
//!   leaves a partial object behind
//! - Hit/miss/publish counters for observing cache reuse

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ArtifactKey;

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = ".tmp";
const STAGING_PREFIX: &str = ".stage.";
const META_FILENAME: &str = "meta.json";
const CONTENT_DIR: &str = "content";

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid artifact key: {0:?}")]
    InvalidKey(String),

    #[error("unreadable metadata for artifact {key}: {source}")]
    Metadata {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact metadata key mismatch: expected {expected}, found {found}")]
    KeyMismatch { expected: String, found: String },
}

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Compiled dependency closure
    Dependencies,
    /// Compiled package output
    Package,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dependencies => "dependencies",
            Self::Package => "package",
        }
    }
}

/// Metadata written next to every stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub key: ArtifactKey,
    pub kind: ArtifactKind,
    /// Human label, e.g. `deps-cypher_character_frontend-0.1.0`
    pub label: String,
    pub created_at: DateTime<Utc>,
}

/// A published artifact. `path` points at the read-only content directory.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub meta: ArtifactMeta,
    pub path: PathBuf,
}

/// Outcome of `publish_if_absent`.
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    /// This call produced and published the artifact
    Published(StoredArtifact),
    /// The key was already present (before or after producing)
    AlreadyPresent(StoredArtifact),
}

impl Publication {
    pub fn artifact(&self) -> &StoredArtifact {
        match self {
            Self::Published(a) | Self::AlreadyPresent(a) => a,
        }
    }

    pub fn into_artifact(self) -> StoredArtifact {
        match self {
            Self::Published(a) | Self::AlreadyPresent(a) => a,
        }
    }

    pub fn was_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }
}

/// Snapshot of the store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub publishes: u64,
    /// Publications that lost a race to a concurrent writer
    pub races: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    publishes: AtomicU64,
    races: AtomicU64,
    staging_seq: AtomicU64,
}

/// Content-addressed artifact store.
///
/// Safe to share between threads by reference.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    counters: Counters,
}

impl ArtifactStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        fs::create_dir_all(root.join(STAGING_DIR))?;

        Ok(Self {
            root,
            counters: Counters::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(OBJECTS_DIR)
            .join(key.prefix())
            .join(key.as_str())
    }

    /// Check for a key without touching the counters.
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.object_dir(key).join(META_FILENAME).is_file()
    }

    /// Look up an artifact by key, counting a hit or a miss.
    pub fn fetch(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError> {
        match self.read_object(key)? {
            Some(artifact) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.short(), kind = artifact.meta.kind.as_str(), "cache hit");
                Ok(Some(artifact))
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.short(), "cache miss");
                Ok(None)
            }
        }
    }

    fn read_object(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError> {
        let dir = self.object_dir(key);
        let meta_path = dir.join(META_FILENAME);
        let raw = match fs::read(&meta_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta: ArtifactMeta = serde_json::from_slice(&raw).map_err(|source| StoreError::Metadata {
            key: key.to_string(),
            source,
        })?;
        if &meta.key != key {
            return Err(StoreError::KeyMismatch {
                expected: key.to_string(),
                found: meta.key.to_string(),
            });
        }

        Ok(Some(StoredArtifact {
            meta,
            path: dir.join(CONTENT_DIR),
        }))
    }

    /// Publish an artifact under `key` unless it already exists.
    ///
    /// `produce` receives an empty staging directory to fill. Nothing becomes
    /// visible under `key` until `produce` returns `Ok` and the staging
    /// directory has been renamed into place. If `produce` fails, or the
    /// caller unwinds, the staging directory is removed.
    pub fn publish_if_absent<F, E>(
        &self,
        key: &ArtifactKey,
        kind: ArtifactKind,
        label: &str,
        produce: F,
    ) -> Result<Publication, E>
    where
        F: FnOnce(&Path) -> Result<(), E>,
        E: From<StoreError>,
    {
        if let Some(existing) = self.read_object(key)? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Publication::AlreadyPresent(existing));
        }

        let staging = self.stage()?;
        let content_dir = staging.path.join(CONTENT_DIR);
        fs::create_dir_all(&content_dir).map_err(StoreError::from)?;

        produce(&content_dir)?;

        let meta = ArtifactMeta {
            key: key.clone(),
            kind,
            label: label.to_string(),
            created_at: Utc::now(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|source| StoreError::Metadata {
            key: key.to_string(),
            source,
        })?;
        fs::write(staging.path.join(META_FILENAME), meta_json).map_err(StoreError::from)?;

        let final_dir = self.object_dir(key);
        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent).map_err(StoreError::from)?;
        }

        match fs::rename(&staging.path, &final_dir) {
            Ok(()) => {
                staging.persist();
                self.counters.publishes.fetch_add(1, Ordering::Relaxed);
                debug!(key = key.short(), kind = kind.as_str(), label, "published artifact");
                Ok(Publication::Published(StoredArtifact {
                    meta,
                    path: final_dir.join(CONTENT_DIR),
                }))
            }
            Err(e) => {
                // Lost the race: a concurrent writer published the same key.
                if let Some(existing) = self.read_object(key)? {
                    self.counters.races.fetch_add(1, Ordering::Relaxed);
                    debug!(key = key.short(), "concurrent publish won, discarding staging");
                    return Ok(Publication::AlreadyPresent(existing));
                }
                Err(StoreError::Io(e).into())
            }
        }
    }

    fn stage(&self) -> Result<Staging, StoreError> {
        let seq = self.counters.staging_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = format!("{}{}.{}.{}", STAGING_PREFIX, std::process::id(), nanos, seq);
        let path = self.root.join(STAGING_DIR).join(name);
        fs::create_dir_all(&path)?;
        Ok(Staging {
            path,
            persisted: false,
        })
    }

    /// Metadata of every stored artifact, sorted by key.
    pub fn list(&self) -> Result<Vec<ArtifactMeta>, StoreError> {
        let mut metas = Vec::new();
        let objects = self.root.join(OBJECTS_DIR);

        for prefix_entry in fs::read_dir(&objects)? {
            let prefix_entry = prefix_entry?;
            if !prefix_entry.file_type()?.is_dir() {
                continue;
            }
            for object_entry in fs::read_dir(prefix_entry.path())? {
                let object_entry = object_entry?;
                let name = object_entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Ok(key) = ArtifactKey::parse(name) else {
                    continue;
                };
                if let Some(artifact) = self.read_object(&key)? {
                    metas.push(artifact.meta);
                }
            }
        }

        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    /// Remove staging directories older than `older_than`.
    ///
    /// These are only left behind when a producer process was killed
    /// before its staging guard could run.
    pub fn cleanup_orphaned_staging(&self, older_than: Duration) -> Result<usize, StoreError> {
        let mut cleaned = 0;
        for entry in fs::read_dir(self.root.join(STAGING_DIR))? {
            let entry = entry?;
            let path = entry.path();
            let is_staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(STAGING_PREFIX))
                .unwrap_or(false);
            if !is_staging {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            if matches!(age, Some(age) if age >= older_than) && fs::remove_dir_all(&path).is_ok() {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            publishes: self.counters.publishes.load(Ordering::Relaxed),
            races: self.counters.races.load(Ordering::Relaxed),
        }
    }
}

/// Staging directory that removes itself unless persisted.
struct Staging {
    path: PathBuf,
    persisted: bool,
}

impl Staging {
    fn persist(mut self) {
        self.persisted = true;
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}
