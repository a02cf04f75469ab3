//! Filter rules for source selection
//!
//! A path is excluded first (build outputs, VCS metadata, editor scratch,
//! `.kilnignore` patterns); what survives is included if any rule accepts it.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Patterns that never belong to a build input
const DEFAULT_EXCLUDES: &[&str] = &[
    "target",
    "target/**",
    ".git",
    ".git/**",
    "result",
    "result-*",
    ".direnv",
    ".direnv/**",
    "**/*.swp",
    "**/*~",
    "**/.DS_Store",
];

/// Errors for rule construction
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("cannot read ignore file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid glob: {0}")]
    Glob(#[from] globset::Error),
}

/// Kind of filesystem entry being considered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Accepts paths whose name matches one of a set of glob patterns
#[derive(Debug, Clone)]
pub struct PatternRule {
    patterns: Vec<String>,
    glob_set: GlobSet,
}

impl PatternRule {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, RuleError> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            builder.add(Glob::new(pattern)?);
            kept.push(pattern.to_string());
        }

        Ok(Self {
            patterns: kept,
            glob_set: builder.build()?,
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn accepts(&self, path: &Path) -> bool {
        self.glob_set.is_match(path)
    }
}

/// Accepts exactly the files Cargo reads when compiling a package.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestRule;

impl ManifestRule {
    fn accepts(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        if name == "Cargo.lock" || name == "rust-toolchain" {
            return true;
        }
        if name == "config" && parent_is_cargo_dir(path) {
            return true;
        }

        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("rs") | Some("toml")
        )
    }
}

fn parent_is_cargo_dir(path: &Path) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n == ".cargo")
        .unwrap_or(false)
}

/// A single inclusion rule
#[derive(Debug, Clone)]
pub enum FilterRule {
    Pattern(PatternRule),
    Manifest(ManifestRule),
}

impl FilterRule {
    /// Whether this rule accepts `path` (relative to the repository root).
    ///
    /// Directories are always accepted so that traversal can reach the
    /// files beneath them; exclusion happens before rules are consulted.
    pub fn accepts(&self, path: &Path, kind: EntryKind) -> bool {
        if kind == EntryKind::Directory {
            return true;
        }
        match self {
            FilterRule::Pattern(rule) => rule.accepts(path),
            FilterRule::Manifest(rule) => rule.accepts(path),
        }
    }
}

/// Exclusion rules applied before any inclusion rule
#[derive(Debug)]
pub struct ExcludeRules {
    glob_set: GlobSet,
}

impl ExcludeRules {
    /// Create exclusion rules with defaults
    pub fn new() -> Result<Self, RuleError> {
        Self::with_patterns(&[] as &[&str])
    }

    /// Defaults plus extra patterns
    pub fn with_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, RuleError> {
        let mut builder = GlobSetBuilder::new();

        for pattern in DEFAULT_EXCLUDES {
            builder.add(Glob::new(pattern)?);
        }
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if !pattern.is_empty() {
                builder.add(Glob::new(pattern)?);
            }
        }

        Ok(Self {
            glob_set: builder.build()?,
        })
    }

    /// Defaults, extra patterns, and the patterns of an ignore file if it exists
    pub fn with_ignore_file<S: AsRef<str>>(patterns: &[S], ignore_file: &Path) -> Result<Self, RuleError> {
        let mut all: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();

        if ignore_file.is_file() {
            let contents = fs::read_to_string(ignore_file)?;
            all.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(|l| l.trim_end_matches('/').to_string()),
            );
        }

        Self::with_patterns(&all)
    }

    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.glob_set.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> FilterRule {
        FilterRule::Manifest(ManifestRule)
    }

    #[test]
    fn test_manifest_rule_accepts_cargo_inputs() {
        let rule = manifest();
        for path in [
            "Cargo.toml",
            "Cargo.lock",
            "src/main.rs",
            "crates/model/src/lib.rs",
            "build.rs",
            ".cargo/config",
            ".cargo/config.toml",
            "rust-toolchain",
            "rustfmt.toml",
        ] {
            assert!(rule.accepts(Path::new(path), EntryKind::File), "{path}");
        }
    }

    #[test]
    fn test_manifest_rule_rejects_unrelated_files() {
        let rule = manifest();
        for path in ["README.md", "flake.nix", "templates/sheet.html", "notes/config", "static/app.css"] {
            assert!(!rule.accepts(Path::new(path), EntryKind::File), "{path}");
        }
    }

    #[test]
    fn test_pattern_rule_matches_suffix() {
        let rule = FilterRule::Pattern(PatternRule::new(&["**/*.html"]).unwrap());

        assert!(rule.accepts(Path::new("templates/character.html"), EntryKind::File));
        assert!(rule.accepts(Path::new("index.html"), EntryKind::Symlink));
        assert!(!rule.accepts(Path::new("src/main.rs"), EntryKind::File));
    }

    #[test]
    fn test_pattern_rule_skips_blank_patterns() {
        let rule = PatternRule::new(&["", "  ", "*.html"]).unwrap();
        assert_eq!(rule.patterns(), &["*.html".to_string()]);
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        assert!(matches!(PatternRule::new(&["a[b"]), Err(RuleError::Glob(_))));
    }

    #[test]
    fn test_directories_are_always_traversable() {
        let rule = FilterRule::Pattern(PatternRule::new(&["*.html"]).unwrap());
        assert!(rule.accepts(Path::new("templates"), EntryKind::Directory));
    }

    #[test]
    fn test_default_excludes() {
        let rules = ExcludeRules::new().unwrap();

        assert!(rules.is_excluded(Path::new("target")));
        assert!(rules.is_excluded(Path::new("target/release/app")));
        assert!(rules.is_excluded(Path::new(".git/config")));
        assert!(rules.is_excluded(Path::new("result")));
        assert!(rules.is_excluded(Path::new("src/.main.rs.swp")));
        assert!(!rules.is_excluded(Path::new("src/main.rs")));
        assert!(!rules.is_excluded(Path::new("crates/target_model/src/lib.rs")));
    }

    #[test]
    fn test_ignore_file_parsing() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# Comment").unwrap();
        writeln!(file, "*.tmp").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  scratch/  ").unwrap();

        let rules = ExcludeRules::with_ignore_file(&["docs"], file.path()).unwrap();

        assert!(rules.is_excluded(Path::new("test.tmp")));
        assert!(rules.is_excluded(Path::new("scratch")));
        assert!(rules.is_excluded(Path::new("docs")));
        assert!(rules.is_excluded(Path::new(".git")));
    }

    #[test]
    fn test_missing_ignore_file_is_fine() {
        let rules = ExcludeRules::with_ignore_file(&[] as &[&str], Path::new("/nonexistent/.kilnignore")).unwrap();
        assert!(!rules.is_excluded(Path::new("src/lib.rs")));
    }
}
