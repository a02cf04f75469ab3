//! Layered configuration
//!
//! Four layers are deep-merged in order of increasing precedence:
//! 1. Built-in defaults
//! 2. Host config (`$XDG_CONFIG_HOME/kiln/config.toml`, else `~/.config/kiln/config.toml`)
//! 3. Repo config (`kiln.toml` at the repository root)
//! 4. CLI overrides
//!
//! The merged value keeps provenance for every contributing file and is
//! deserialized into typed `PipelineSettings`.

mod effective;
mod merge;
mod settings;

pub use effective::{default_host_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, REPO_CONFIG_FILE};
pub use merge::{merge_into, merge_layers};
pub use settings::{
    CheckSettings, DevEnvSettings, FilterSettings, PackageSettings, PipelineSettings, StoreSettings,
    ToolchainSettings,
};
