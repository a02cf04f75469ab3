//! Source filtering
//!
//! Selects the subset of a repository that is a valid build input and
//! captures it as an in-memory `SourceTree`. Traversal is sorted and the
//! tree is keyed by normalized relative path, so filtering an unchanged
//! repository twice yields identical trees (and identical digests).

mod rules;
mod tree;

pub use rules::{EntryKind, ExcludeRules, FilterRule, ManifestRule, PatternRule, RuleError};
pub use tree::{BuildInputSpec, ManifestError, PackageId, SourceFile, SourceTree, LOCK_FILE, MANIFEST_FILE};

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::config::FilterSettings;

/// Name of the per-repository ignore file
pub const IGNORE_FILE: &str = ".kilnignore";

/// Errors for source filtering
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("cannot read repository root {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read {path}: {source}")]
    UnreadableEntry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("symlink escapes repository root: {path}")]
    SymlinkEscapesRoot { path: PathBuf },

    #[error("filter rule error: {0}")]
    Rule(#[from] RuleError),

    #[error(transparent)]
    InvalidManifest(#[from] ManifestError),
}

/// Composes exclusion with OR-combined inclusion rules
#[derive(Debug)]
pub struct SourceFilter {
    rules: Vec<FilterRule>,
    extra_excludes: Vec<String>,
}

impl SourceFilter {
    /// Filter with explicit rules and no extra exclusions
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self {
            rules,
            extra_excludes: Vec::new(),
        }
    }

    /// Manifest-aware rule plus a pattern rule for the configured suffixes
    pub fn from_settings(settings: &FilterSettings) -> Result<Self, FilterError> {
        let mut rules = vec![FilterRule::Manifest(ManifestRule)];
        if !settings.include.is_empty() {
            rules.push(FilterRule::Pattern(PatternRule::new(&settings.include)?));
        }

        Ok(Self {
            rules,
            extra_excludes: settings.exclude.clone(),
        })
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Whether any rule accepts the path
    pub fn accepts(&self, path: &Path, kind: EntryKind) -> bool {
        self.rules.iter().any(|rule| rule.accepts(path, kind))
    }

    /// Snapshot the accepted files under `root`.
    ///
    /// Excluded and unaccepted entries are skipped silently; only an
    /// unreadable root or an unreadable accepted entry is an error.
    pub fn filter(&self, root: &Path) -> Result<SourceTree, FilterError> {
        let root = root.canonicalize().map_err(|source| FilterError::Unreadable {
            path: root.to_path_buf(),
            source,
        })?;
        fs::read_dir(&root).map_err(|source| FilterError::Unreadable {
            path: root.clone(),
            source,
        })?;

        let excludes = ExcludeRules::with_ignore_file(&self.extra_excludes, &root.join(IGNORE_FILE))?;
        let mut tree = SourceTree::new();

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(&root) {
                Ok(rel) => rel.as_os_str().is_empty() || !(excludes.is_excluded(rel) || is_crate_output(entry)),
                Err(_) => false,
            });

        for entry in walker {
            let entry = entry?;
            let path = entry.path();
            let rel = match path.strip_prefix(&root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel,
                _ => continue,
            };

            let file_type = entry.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };

            if kind == EntryKind::Directory || !self.accepts(rel, kind) {
                continue;
            }

            let source_path = if kind == EntryKind::Symlink {
                resolve_symlink(&root, path)?
            } else {
                path.to_path_buf()
            };
            if source_path.is_dir() {
                // Directory symlinks are not followed
                continue;
            }

            let contents = fs::read(&source_path).map_err(|source| FilterError::UnreadableEntry {
                path: path.to_path_buf(),
                source,
            })?;
            tree.insert_file(
                normalize(rel),
                SourceFile {
                    contents,
                    executable: is_executable(&source_path),
                },
            );
        }

        debug!(root = %root.display(), files = tree.len(), digest = tree.digest().short(), "filtered source tree");
        Ok(tree)
    }
}

/// Resolve a symlink, refusing targets outside `root`
fn resolve_symlink(root: &Path, link: &Path) -> Result<PathBuf, FilterError> {
    let target = fs::read_link(link).map_err(|source| FilterError::UnreadableEntry {
        path: link.to_path_buf(),
        source,
    })?;
    let resolved = if target.is_absolute() {
        target
    } else {
        link.parent().unwrap_or(root).join(target)
    };

    let canonical = resolved.canonicalize().map_err(|source| FilterError::UnreadableEntry {
        path: link.to_path_buf(),
        source,
    })?;
    if !canonical.starts_with(root) {
        return Err(FilterError::SymlinkEscapesRoot {
            path: link.to_path_buf(),
        });
    }
    Ok(canonical)
}

/// Relative path with `/` separators
fn normalize(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    false
}

/// A `target` directory beside a manifest: build output of a nested crate
fn is_crate_output(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.file_name() == "target"
        && entry
            .path()
            .parent()
            .map(|dir| dir.join("Cargo.toml").is_file())
            .unwrap_or(false)
}
