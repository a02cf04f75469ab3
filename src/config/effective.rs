//! Merged configuration and where it came from
//!
//! Every file that contributed a layer is recorded with its SHA-256, so a
//! report can show exactly which `kiln.toml` produced a run.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::merge::merge_layers;
use super::settings::PipelineSettings;
use crate::checks::Check;

/// Repo config file name, relative to the repository root
pub const REPO_CONFIG_FILE: &str = "kiln.toml";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    Host,
    Repo,
    Cli,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/cli)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Effective configuration with full provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,

    /// The merged configuration object
    pub config: Value,

    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,
}

/// `$XDG_CONFIG_HOME/kiln/config.toml`, else `~/.config/kiln/config.toml`
pub fn default_host_config_path() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join("kiln").join("config.toml"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("kiln").join("config.toml"))
}

impl EffectiveConfig {
    /// Build effective config from layers.
    ///
    /// Missing files are skipped; unreadable or invalid ones are errors.
    pub fn build(
        host_config_path: Option<&Path>,
        repo_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        let builtin = serde_json::to_value(PipelineSettings::default())
            .map_err(|e| ConfigError::Invalid(format!("built-in defaults: {}", e)))?;
        layers.push(builtin);
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        for (origin, path) in [
            (ConfigOrigin::Host, host_config_path),
            (ConfigOrigin::Repo, repo_config_path),
        ] {
            let Some(path) = path.filter(|p| p.exists()) else {
                continue;
            };
            let (value, digest) = Self::load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let effective = Self {
            created_at: Utc::now(),
            config: merge_layers(layers),
            sources,
        };
        effective.settings()?;
        Ok(effective)
    }

    /// Parse one TOML layer, returning it as JSON with the file digest
    fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let digest = hex::encode(Sha256::digest(&bytes));

        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };
        let text = std::str::from_utf8(&bytes).map_err(|e| parse_error(format!("invalid UTF-8: {e}")))?;
        let table: toml::Table = toml::from_str(text).map_err(|e| parse_error(e.message().to_string()))?;

        Ok((toml_to_json(toml::Value::Table(table)), digest))
    }

    /// Typed, validated settings
    pub fn settings(&self) -> Result<PipelineSettings, ConfigError> {
        let settings: PipelineSettings = serde_json::from_value(self.config.clone())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::validate(&settings)?;
        Ok(settings)
    }

    fn validate(settings: &PipelineSettings) -> Result<(), ConfigError> {
        for name in &settings.checks.enabled {
            if Check::from_name(name).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "checks.enabled: unknown check {:?}",
                    name
                )));
            }
        }

        let grace = settings.toolchain.termination_grace_seconds;
        if grace == 0 || grace > 600 {
            return Err(ConfigError::Invalid(
                "toolchain.termination_grace_seconds must be in (0, 600]".to_string(),
            ));
        }

        if settings.toolchain.cargo.trim().is_empty() || settings.toolchain.rustc.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.cargo and toolchain.rustc must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Get a config value by path (dot-separated)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.config;
        for part in path.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// Get a config value as string
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(|v| v.as_str())
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    use toml::Value as Toml;
    match value {
        Toml::String(s) => Value::String(s),
        Toml::Integer(i) => Value::from(i),
        Toml::Float(f) => Value::from(f),
        Toml::Boolean(b) => Value::Bool(b),
        Toml::Datetime(dt) => Value::String(dt.to_string()),
        Toml::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        Toml::Table(table) => Value::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
