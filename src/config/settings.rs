//! Typed pipeline settings
//!
//! Every section defaults independently, so a config file only needs the
//! keys it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::toolchain::ToolRequirement;

/// Merged settings for one pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    pub package: PackageSettings,
    pub filter: FilterSettings,
    pub store: StoreSettings,
    pub toolchain: ToolchainSettings,
    pub checks: CheckSettings,
    pub dev_env: DevEnvSettings,
}

/// Overrides for the package identity read from `Cargo.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageSettings {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterSettings {
    /// Glob patterns accepted in addition to Cargo inputs
    pub include: Vec<String>,
    /// Glob patterns excluded on top of the built-in exclusions
    pub exclude: Vec<String>,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            include: vec!["**/*.html".to_string()],
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Store root; `None` resolves to the user cache directory
    pub root: Option<PathBuf>,
}

impl StoreSettings {
    /// Configured root, else `$XDG_CACHE_HOME/kiln`, else `~/.cache/kiln`
    pub fn resolve_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.root {
            return Some(root.clone());
        }
        if let Some(cache) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(cache).join("kiln"));
        }
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache").join("kiln"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainSettings {
    pub cargo: String,
    pub rustc: String,
    /// Required compiler release; probing a different one is an error
    pub release: Option<String>,
    pub lint_args: Vec<String>,
    pub doc_args: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL on cancellation
    pub termination_grace_seconds: u64,
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            cargo: "cargo".to_string(),
            rustc: "rustc".to_string(),
            release: None,
            lint_args: ["--all-targets", "--", "--deny", "warnings"]
                .into_iter()
                .map(String::from)
                .collect(),
            doc_args: Vec::new(),
            termination_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckSettings {
    /// Registered checks, by name
    pub enabled: Vec<String>,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            enabled: ["build", "lint", "doc", "format"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevEnvSettings {
    /// Auxiliary tools wanted in the shell (e.g. `cargo-watch`)
    pub extra_tools: Vec<ToolRequirement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.filter.include, vec!["**/*.html"]);
        assert_eq!(settings.checks.enabled, vec!["build", "lint", "doc", "format"]);
        assert_eq!(settings.toolchain.cargo, "cargo");
        assert!(settings.dev_env.extra_tools.is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let settings: PipelineSettings = toml::from_str(
            r#"
[toolchain]
release = "1.79.0"

[[dev_env.extra_tools]]
name = "cargo-watch"
version = "8.5.2"
"#,
        )
        .unwrap();

        assert_eq!(settings.toolchain.release.as_deref(), Some("1.79.0"));
        assert_eq!(settings.toolchain.rustc, "rustc");
        assert_eq!(settings.filter, FilterSettings::default());
        assert_eq!(
            settings.dev_env.extra_tools,
            vec![ToolRequirement::new("cargo-watch", "8.5.2")]
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<PipelineSettings>("[filter]\ninclude_globs = []\n").is_err());
    }

    #[test]
    fn test_explicit_store_root_wins() {
        let store = StoreSettings {
            root: Some(PathBuf::from("/srv/kiln")),
        };
        assert_eq!(store.resolve_root(), Some(PathBuf::from("/srv/kiln")));
    }
}
