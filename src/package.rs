//! Package builder
//!
//! Compiles the full source tree against a dependency artifact. The
//! result is keyed by the tree digest and the dependency key, so an
//! unchanged tree is never recompiled and a source edit never touches the
//! dependency artifact.

use std::path::PathBuf;

use kiln_store::{ArtifactKey, ArtifactKind, ArtifactStore, KeyHasher, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::deps::DependencyCacheArtifact;
use crate::source::{BuildInputSpec, PackageId};
use crate::toolchain::{scratch_dir, Toolchain, ToolchainError};

const KEY_SCHEMA: &str = "kiln-package-v1";

/// The compiler rejected the package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{package} failed to compile")]
pub struct CompilationError {
    pub package: PackageId,
    pub exit_code: Option<i32>,
    pub diagnostics: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PackageBuildError {
    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("toolchain error: {0}")]
    Toolchain(#[from] ToolchainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key of the package artifact for a tree digest and dependency key
pub fn package_key(tree_digest: &ArtifactKey, deps_key: &ArtifactKey) -> ArtifactKey {
    let mut hasher = KeyHasher::new();
    hasher
        .text(KEY_SCHEMA)
        .text(tree_digest.as_str())
        .text(deps_key.as_str());
    hasher.finish()
}

/// Installed package output, as stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageArtifact {
    pub package: PackageId,
    pub key: ArtifactKey,
    pub tree_digest: ArtifactKey,
    pub deps_key: ArtifactKey,
    /// Install root (`bin/` lives below it)
    pub path: PathBuf,
    pub reused: bool,
}

/// Package stage result as recorded in a pipeline report.
///
/// A compile failure is an outcome, not an error: downstream checks still
/// run and report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PackageOutcome {
    Built(PackageArtifact),
    Failed(CompilationError),
}

impl PackageOutcome {
    /// Split a build result into an outcome and errors that abort the run
    pub fn from_build(result: Result<PackageArtifact, PackageBuildError>) -> Result<Self, PackageBuildError> {
        match result {
            Ok(artifact) => Ok(Self::Built(artifact)),
            Err(PackageBuildError::Compilation(e)) => Ok(Self::Failed(e)),
            Err(other) => Err(other),
        }
    }

    pub fn artifact(&self) -> Option<&PackageArtifact> {
        match self {
            Self::Built(artifact) => Some(artifact),
            Self::Failed(_) => None,
        }
    }
}

pub struct PackageBuilder<'a> {
    store: &'a ArtifactStore,
    toolchain: &'a dyn Toolchain,
}

impl<'a> PackageBuilder<'a> {
    pub fn new(store: &'a ArtifactStore, toolchain: &'a dyn Toolchain) -> Self {
        Self { store, toolchain }
    }

    pub fn build(
        &self,
        spec: &BuildInputSpec,
        deps: &DependencyCacheArtifact,
        cancel: &CancellationToken,
    ) -> Result<PackageArtifact, PackageBuildError> {
        let tree_digest = spec.tree.digest();
        let key = package_key(&tree_digest, &deps.key);
        let artifact = |path: PathBuf, reused: bool| PackageArtifact {
            package: spec.package.clone(),
            key: key.clone(),
            tree_digest: tree_digest.clone(),
            deps_key: deps.key.clone(),
            path,
            reused,
        };

        if let Some(stored) = self.store.fetch(&key)? {
            info!(package = %spec.package, key = key.short(), "reusing package artifact");
            return Ok(artifact(stored.path, true));
        }

        cancel.check().map_err(ToolchainError::from)?;
        info!(
            package = %spec.package,
            key = key.short(),
            deps = deps.key.short(),
            "compiling package"
        );

        let label = spec.package.to_string();
        let publication = self.store.publish_if_absent(&key, ArtifactKind::Package, &label, |out| {
            let work = scratch_dir("kiln-package-")?;
            spec.tree.materialize(work.path())?;

            let output = self.toolchain.build_package(work.path(), &deps.path, out, cancel)?;
            if !output.success {
                warn!(package = %spec.package, exit_code = ?output.exit_code, "compilation failed");
                return Err(PackageBuildError::Compilation(CompilationError {
                    package: spec.package.clone(),
                    exit_code: output.exit_code,
                    diagnostics: output.diagnostics,
                }));
            }
            cancel.check().map_err(ToolchainError::from)?;
            Ok(())
        })?;

        let reused = !publication.was_published();
        debug!(key = key.short(), reused, "package artifact ready");
        Ok(artifact(publication.into_artifact().path, reused))
    }
}
