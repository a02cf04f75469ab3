//! Dependency cache builder
//!
//! Compiles the third-party dependency closure of a package once per
//! (lock file, toolchain) pair. The build runs against the dependency
//! skeleton of the source tree, so edits to application source never
//! invalidate this artifact.

use std::fs;
use std::path::PathBuf;

use kiln_store::{ArtifactKey, ArtifactKind, ArtifactStore, KeyHasher, StoreError, StoredArtifact};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::source::{BuildInputSpec, ManifestError};
use crate::toolchain::{scratch_dir, Toolchain, ToolchainError, ToolchainIdentity};

/// Bumped whenever the artifact layout changes
const KEY_SCHEMA: &str = "kiln-deps-v1";

/// Closure listing written into every dependency artifact
const CLOSURE_FILE: &str = "closure.json";

#[derive(Debug, thiserror::Error)]
pub enum DependencyResolutionError {
    #[error("no Cargo.lock in the source tree")]
    MissingLockFile,

    #[error("invalid Cargo.lock ({lock_hash}): {message}")]
    InvalidLockFile { lock_hash: String, message: String },

    #[error(transparent)]
    InvalidManifest(#[from] ManifestError),

    #[error("dependency build failed for lock {lock_hash}:\n{diagnostics}")]
    Build { lock_hash: String, diagnostics: String },

    #[error("toolchain error: {0}")]
    Toolchain(#[from] ToolchainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One `[[package]]` entry of a lock file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LockedPackage {
    /// Registry and git packages; path and workspace members have no source
    pub fn is_external(&self) -> bool {
        self.source.is_some()
    }

    /// `name@version`, as listed in environment inputs
    pub fn spec(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[derive(Deserialize)]
struct LockFile {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

/// Parse a lock file into its sorted list of external packages
pub fn parse_lock_file(contents: &[u8]) -> Result<Vec<LockedPackage>, String> {
    let text = std::str::from_utf8(contents).map_err(|e| format!("invalid UTF-8: {e}"))?;
    let lock: LockFile = toml::from_str(text).map_err(|e| e.message().to_string())?;
    let mut closure: Vec<LockedPackage> = lock.package.into_iter().filter(LockedPackage::is_external).collect();
    closure.sort();
    closure.dedup();
    Ok(closure)
}

/// Lowercase hex SHA-256 of the lock file bytes
pub fn lock_hash(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

/// Key of the dependency artifact for a lock file and toolchain
pub fn dependency_key(lock_hash: &str, toolchain: &ToolchainIdentity) -> ArtifactKey {
    let mut hasher = KeyHasher::new();
    hasher
        .text(KEY_SCHEMA)
        .text(lock_hash)
        .text(&toolchain.fingerprint());
    hasher.finish()
}

/// Compiled dependency closure, as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyCacheArtifact {
    pub key: ArtifactKey,
    pub lock_hash: String,
    pub toolchain: ToolchainIdentity,
    /// External packages of the lock file, sorted
    pub closure: Vec<LockedPackage>,
    /// Read-only content directory in the store
    pub path: PathBuf,
    /// Whether this call found the artifact already built
    pub reused: bool,
}

impl DependencyCacheArtifact {
    fn from_stored(
        stored: StoredArtifact,
        lock_hash: String,
        toolchain: &ToolchainIdentity,
        closure: Vec<LockedPackage>,
        reused: bool,
    ) -> Self {
        Self {
            key: stored.meta.key,
            lock_hash,
            toolchain: toolchain.clone(),
            closure,
            path: stored.path,
            reused,
        }
    }
}

/// Builds or reuses dependency artifacts in a store
pub struct DependencyCacheBuilder<'a> {
    store: &'a ArtifactStore,
    toolchain: &'a dyn Toolchain,
}

impl<'a> DependencyCacheBuilder<'a> {
    pub fn new(store: &'a ArtifactStore, toolchain: &'a dyn Toolchain) -> Self {
        Self { store, toolchain }
    }

    /// Lock hash, key and closure for a spec, without building anything
    pub fn resolve(&self, spec: &BuildInputSpec) -> Result<(String, ArtifactKey, Vec<LockedPackage>), DependencyResolutionError> {
        let lock = spec.tree.lock_file().ok_or(DependencyResolutionError::MissingLockFile)?;
        let lock_hash = lock_hash(lock);
        let closure = parse_lock_file(lock).map_err(|message| DependencyResolutionError::InvalidLockFile {
            lock_hash: lock_hash.clone(),
            message,
        })?;
        let key = dependency_key(&lock_hash, self.toolchain.identity());
        Ok((lock_hash, key, closure))
    }

    /// Return the artifact for `spec`'s lock file, compiling it on a miss.
    ///
    /// The toolchain is invoked at most once per key; a failed or
    /// cancelled build publishes nothing.
    pub fn build(
        &self,
        spec: &BuildInputSpec,
        cancel: &CancellationToken,
    ) -> Result<DependencyCacheArtifact, DependencyResolutionError> {
        let (lock_hash, key, closure) = self.resolve(spec)?;
        let identity = self.toolchain.identity();

        if let Some(stored) = self.store.fetch(&key)? {
            info!(package = %spec.package, key = key.short(), "reusing dependency artifact");
            return Ok(DependencyCacheArtifact::from_stored(stored, lock_hash, identity, closure, true));
        }

        cancel.check().map_err(ToolchainError::from)?;
        let skeleton = spec.tree.dependency_skeleton()?;
        let label = format!("deps-{}", spec.package);
        info!(
            package = %spec.package,
            key = key.short(),
            packages = closure.len(),
            "building dependency closure"
        );

        let publication = self.store.publish_if_absent(&key, ArtifactKind::Dependencies, &label, |out| {
            let work = scratch_dir("kiln-deps-")?;
            skeleton.materialize(work.path())?;

            let output = self.toolchain.build_dependencies(work.path(), out, cancel)?;
            if !output.success {
                return Err(DependencyResolutionError::Build {
                    lock_hash: lock_hash.clone(),
                    diagnostics: output.diagnostics,
                });
            }
            // A run that was cancelled after the compiler exited still publishes nothing
            cancel.check().map_err(ToolchainError::from)?;

            let listing = serde_json::to_vec_pretty(&closure).map_err(std::io::Error::from)?;
            fs::write(out.join(CLOSURE_FILE), listing)?;
            Ok(())
        })?;

        let reused = !publication.was_published();
        debug!(key = key.short(), reused, "dependency artifact ready");
        Ok(DependencyCacheArtifact::from_stored(
            publication.into_artifact(),
            lock_hash,
            identity,
            closure,
            reused,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK: &str = r#"
version = 3

[[package]]
name = "askama"
version = "0.12.1"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "axum"
version = "0.7.5"
source = "registry+https://github.com/rust-lang/crates.io-index"
dependencies = ["tokio"]

[[package]]
name = "cypher_character_frontend"
version = "0.1.0"
dependencies = ["askama", "axum"]
"#;

    #[test]
    fn test_parse_lock_keeps_external_packages() {
        let closure = parse_lock_file(LOCK.as_bytes()).unwrap();
        let specs: Vec<String> = closure.iter().map(LockedPackage::spec).collect();
        assert_eq!(specs, vec!["askama@0.12.1", "axum@0.7.5"]);
    }

    #[test]
    fn test_parse_lock_without_packages() {
        assert!(parse_lock_file(b"version = 3\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_lock_rejects_garbage() {
        assert!(parse_lock_file(b"[[package]\nname = ").is_err());
        assert!(parse_lock_file(b"[[package]]\nname = \"x\"\n").is_err());
    }

    #[test]
    fn test_key_depends_on_lock_and_toolchain() {
        let stable = ToolchainIdentity::new("1.79.0", "x86_64-unknown-linux-gnu");
        let newer = ToolchainIdentity::new("1.80.0", "x86_64-unknown-linux-gnu");
        let hash = lock_hash(LOCK.as_bytes());

        assert_eq!(dependency_key(&hash, &stable), dependency_key(&hash, &stable));
        assert_ne!(dependency_key(&hash, &stable), dependency_key(&hash, &newer));
        assert_ne!(
            dependency_key(&hash, &stable),
            dependency_key(&lock_hash(b"version = 3\n"), &stable)
        );
    }

    #[test]
    fn test_lock_hash_is_hex_sha256() {
        let hash = lock_hash(b"");
        assert_eq!(hash, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }
}
