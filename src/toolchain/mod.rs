//! Toolchain identity and the compiler seam
//!
//! Every compiler invocation the pipeline makes goes through the
//! `Toolchain` trait. `CargoToolchain` drives real `cargo` processes; the
//! `mock` module provides a scripted implementation for tests.
//!
//! The toolchain identity is part of every cache key, so artifacts built by
//! one compiler release are never reused by another.

mod cargo;

pub use cargo::CargoToolchain;

use std::io;
use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::cancel::{CancellationToken, Cancelled};

/// Errors from driving the toolchain (not compile failures, which are
/// reported through `ToolOutput`)
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot determine toolchain identity: {0}")]
    Probe(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Private scratch directory for one toolchain run, removed on drop
pub fn scratch_dir(prefix: &str) -> io::Result<tempfile::TempDir> {
    tempfile::Builder::new().prefix(prefix).tempdir()
}

/// Resolved compiler identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolchainIdentity {
    /// Compiler release (e.g., "1.79.0")
    pub release: String,
    /// Host triple (e.g., "x86_64-unknown-linux-gnu")
    pub host: String,
    /// Commit the compiler was built from, if reported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

impl ToolchainIdentity {
    pub fn new(release: &str, host: &str) -> Self {
        Self {
            release: release.to_string(),
            host: host.to_string(),
            commit_hash: None,
        }
    }

    /// Parse the output of `rustc -vV`
    pub fn parse_version_verbose(output: &str) -> Result<Self, ToolchainError> {
        let field = |name: &str| {
            output.lines().find_map(|line| {
                line.strip_prefix(name)
                    .and_then(|rest| rest.strip_prefix(':'))
                    .map(|v| v.trim().to_string())
            })
        };

        let release = field("release").ok_or_else(|| ToolchainError::Probe("missing release".into()))?;
        let host = field("host").ok_or_else(|| ToolchainError::Probe("missing host".into()))?;
        let commit_hash = field("commit-hash").filter(|c| c != "unknown");

        Ok(Self {
            release,
            host,
            commit_hash,
        })
    }

    /// Run `<rustc> -vV` and parse the result
    pub fn probe(rustc: &str) -> Result<Self, ToolchainError> {
        let output = Command::new(rustc)
            .arg("-vV")
            .output()
            .map_err(|source| ToolchainError::Spawn {
                program: rustc.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(ToolchainError::Probe(format!(
                "{} -vV exited with {}",
                rustc, output.status
            )));
        }
        Self::parse_version_verbose(&String::from_utf8_lossy(&output.stdout))
    }

    /// Stable string folded into cache keys
    pub fn fingerprint(&self) -> String {
        format!(
            "rustc-{}-{}-{}",
            self.release,
            self.host,
            self.commit_hash.as_deref().unwrap_or("unknown")
        )
    }

    /// Filesystem-safe name.
    ///
    /// Format: `rustc_<release>__<host>`
    pub fn to_dir_name(&self) -> String {
        format!("rustc_{}__{}", sanitize(&self.release), sanitize(&self.host))
    }
}

/// Replace anything but alphanumerics and hyphens with underscores
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// A tool a component needs on `PATH`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolRequirement {
    pub name: String,
    pub version: String,
}

impl ToolRequirement {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

/// Outcome of one toolchain process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Captured stdout and stderr
    pub diagnostics: String,
}

impl ToolOutput {
    pub fn success(diagnostics: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn failure(exit_code: i32, diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            diagnostics: diagnostics.into(),
        }
    }
}

/// The external compiler, as seen by the pipeline.
///
/// Directories passed as `deps` are shared, read-only artifacts: an
/// implementation must copy what it needs instead of writing into them.
pub trait Toolchain: Send + Sync {
    fn identity(&self) -> &ToolchainIdentity;

    /// Compile the dependency closure of the skeleton in `workdir` into `out`
    fn build_dependencies(
        &self,
        workdir: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError>;

    /// Compile the full package in `workdir` against `deps`, installing into `out`
    fn build_package(
        &self,
        workdir: &Path,
        deps: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError>;

    fn lint(&self, workdir: &Path, deps: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError>;

    fn document(&self, workdir: &Path, deps: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError>;

    /// Formatting needs sources only
    fn check_format(&self, workdir: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError>;

    /// Tools the toolchain itself puts on `PATH`
    fn tools(&self) -> Vec<ToolRequirement> {
        let release = &self.identity().release;
        vec![
            ToolRequirement::new("cargo", release),
            ToolRequirement::new("rustc", release),
        ]
    }
}
