//! Filtered source snapshots and package identity

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use kiln_store::{ArtifactKey, KeyHasher};
use serde::{Deserialize, Serialize};

/// Name of the lock file that keys the dependency cache
pub const LOCK_FILE: &str = "Cargo.lock";

/// Name of a package manifest
pub const MANIFEST_FILE: &str = "Cargo.toml";

/// Placeholder compiled in place of library targets in the dependency skeleton
const DUMMY_LIB: &str = "#![allow(clippy::all)]\n";

/// Placeholder compiled in place of binary targets and build scripts
const DUMMY_MAIN: &str = "#![allow(clippy::all)]\nfn main() {}\n";

/// A manifest that could not be read
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid manifest {path}: {message}")]
pub struct ManifestError {
    pub path: String,
    pub message: String,
}

impl ManifestError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// One file of a source snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceFile {
    pub contents: Vec<u8>,
    pub executable: bool,
}

impl SourceFile {
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: contents.into(),
            executable: false,
        }
    }
}

/// Ordered set of (relative path, content) pairs.
///
/// Paths use `/` separators regardless of platform so that the digest is
/// stable across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceTree {
    files: BTreeMap<String, SourceFile>,
}

impl SourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), SourceFile::new(contents));
    }

    pub fn insert_file(&mut self, path: impl Into<String>, file: SourceFile) {
        self.files.insert(path.into(), file);
    }

    pub fn get(&self, path: &str) -> Option<&SourceFile> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceFile)> {
        self.files.iter().map(|(p, f)| (p.as_str(), f))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Contents of the root lock file, if the tree has one
    pub fn lock_file(&self) -> Option<&[u8]> {
        self.get(LOCK_FILE).map(|f| f.contents.as_slice())
    }

    /// Content digest over every (path, mode, content) triple in order
    pub fn digest(&self) -> ArtifactKey {
        let mut hasher = KeyHasher::new();
        hasher.field(&(self.files.len() as u64).to_le_bytes());
        for (path, file) in &self.files {
            hasher
                .text(path)
                .field(&[u8::from(file.executable)])
                .field(&file.contents);
        }
        hasher.finish()
    }

    /// Write every file under `dir`
    pub fn materialize(&self, dir: &Path) -> io::Result<()> {
        for (path, file) in &self.files {
            let target = dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &file.contents)?;

            #[cfg(unix)]
            if file.executable {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
            }
        }
        Ok(())
    }

    /// Dependency-only view of the tree.
    ///
    /// Keeps every manifest, the lock file and toolchain configuration, and
    /// replaces each declared target with a placeholder so the dependency
    /// closure can be compiled without any application source.
    pub fn dependency_skeleton(&self) -> Result<SourceTree, ManifestError> {
        let mut skeleton = SourceTree::new();

        for (path, file) in &self.files {
            if is_dependency_input(path) {
                skeleton.insert_file(path.clone(), file.clone());
            }
        }

        let manifests: Vec<&str> = self
            .paths()
            .filter(|p| file_name(p) == MANIFEST_FILE)
            .collect();
        for manifest_path in manifests {
            for (target, dummy) in self.declared_targets(manifest_path)? {
                skeleton.insert(target, dummy);
            }
        }

        Ok(skeleton)
    }

    /// Target files a manifest declares or that Cargo would discover.
    fn declared_targets(&self, manifest_path: &str) -> Result<Vec<(String, &'static str)>, ManifestError> {
        let manifest = parse_manifest(manifest_path, &self.files[manifest_path].contents)?;
        let Some(package) = manifest.get("package") else {
            return Ok(Vec::new());
        };
        let dir = parent_dir(manifest_path);
        let mut targets = Vec::new();

        let explicit_lib = manifest
            .get("lib")
            .and_then(|lib| lib.get("path"))
            .and_then(|p| p.as_str());
        match explicit_lib {
            Some(path) => targets.push((join_rel(dir, path), DUMMY_LIB)),
            None => {
                let default = join_rel(dir, "src/lib.rs");
                if self.contains(&default) {
                    targets.push((default, DUMMY_LIB));
                }
            }
        }

        let default_main = join_rel(dir, "src/main.rs");
        if self.contains(&default_main) {
            targets.push((default_main, DUMMY_MAIN));
        }
        let bin_dir = join_rel(dir, "src/bin/");
        for path in self.paths().filter(|p| p.starts_with(&bin_dir) && p.ends_with(".rs")) {
            targets.push((path.to_string(), DUMMY_MAIN));
        }

        for section in ["bin", "example", "test", "bench"] {
            let entries = manifest
                .get(section)
                .and_then(|v| v.as_array())
                .map(Vec::as_slice)
                .unwrap_or_default();
            for entry in entries {
                if let Some(path) = entry.get("path").and_then(|p| p.as_str()) {
                    targets.push((join_rel(dir, path), DUMMY_MAIN));
                }
            }
        }

        match package.get("build") {
            Some(toml::Value::String(path)) => targets.push((join_rel(dir, path), DUMMY_MAIN)),
            Some(toml::Value::Boolean(false)) => {}
            _ => {
                let default = join_rel(dir, "build.rs");
                if self.contains(&default) {
                    targets.push((default, DUMMY_MAIN));
                }
            }
        }

        Ok(targets)
    }
}

fn is_dependency_input(path: &str) -> bool {
    let name = file_name(path);
    let in_cargo_dir = parent_dir(path).rsplit('/').next() == Some(".cargo");
    name == MANIFEST_FILE
        || name == LOCK_FILE
        || name == "rust-toolchain"
        || name == "rust-toolchain.toml"
        || (in_cargo_dir && (name == "config" || name == "config.toml"))
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn join_rel(dir: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches("./");
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

fn parse_manifest(path: &str, contents: &[u8]) -> Result<toml::Table, ManifestError> {
    let text = std::str::from_utf8(contents).map_err(|e| ManifestError::new(path, format!("invalid UTF-8: {e}")))?;
    toml::from_str(text).map_err(|e| ManifestError::new(path, e.message().to_string()))
}

/// Name and version a package's artifacts are tagged with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Read `[package]` from the root manifest.
    ///
    /// Overrides take precedence; a virtual workspace root needs a name
    /// override and falls back to `[workspace.package] version`.
    pub fn from_tree(
        tree: &SourceTree,
        name_override: Option<&str>,
        version_override: Option<&str>,
    ) -> Result<Self, ManifestError> {
        if let (Some(name), Some(version)) = (name_override, version_override) {
            return Ok(Self::new(name, version));
        }

        let file = tree
            .get(MANIFEST_FILE)
            .ok_or_else(|| ManifestError::new(MANIFEST_FILE, "missing root manifest"))?;
        let manifest = parse_manifest(MANIFEST_FILE, &file.contents)?;
        let package = manifest.get("package");
        let workspace_version = manifest
            .get("workspace")
            .and_then(|w| w.get("package"))
            .and_then(|p| p.get("version"))
            .and_then(|v| v.as_str());

        let name = match name_override {
            Some(name) => name.to_string(),
            None => package
                .and_then(|p| p.get("name"))
                .and_then(|n| n.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    ManifestError::new(MANIFEST_FILE, "no [package] name; set package.name in kiln.toml")
                })?,
        };

        let version = match version_override {
            Some(version) => version.to_string(),
            None => match package.and_then(|p| p.get("version")) {
                Some(toml::Value::String(v)) => v.clone(),
                // `version.workspace = true` or no package at all
                _ => workspace_version.unwrap_or("0.0.0").to_string(),
            },
        };

        Ok(Self { name, version })
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// A filtered tree tagged with the package it builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInputSpec {
    pub tree: SourceTree,
    pub package: PackageId,
}

impl BuildInputSpec {
    pub fn new(tree: SourceTree, package: PackageId) -> Self {
        Self { tree, package }
    }
}
