//! Development environment composition
//!
//! A development environment is the union of the tool requirements and
//! transitive inputs of every pipeline component, so a developer shell
//! has exactly what the pipeline itself uses. Composition is pure: no
//! process runs and nothing is written.

use std::collections::{BTreeMap, BTreeSet};

use kiln_store::{ArtifactKey, KeyHasher};
use serde::{Deserialize, Serialize};

use crate::toolchain::{ToolRequirement, ToolchainIdentity};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvironmentError {
    #[error("tool {tool} required at {first_version} by {first_component} and at {second_version} by {second_component}")]
    ToolConflict {
        tool: String,
        first_component: String,
        first_version: String,
        second_component: String,
        second_version: String,
    },
}

/// What one component needs in the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInputs {
    /// e.g. `package` or `check:lint`
    pub component: String,
    pub tools: Vec<ToolRequirement>,
    pub inputs: Vec<String>,
}

impl ComponentInputs {
    pub fn new(component: &str, tools: Vec<ToolRequirement>, inputs: Vec<String>) -> Self {
        Self {
            component: component.to_string(),
            tools,
            inputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub version: String,
    /// Components that asked for this tool
    pub required_by: BTreeSet<String>,
}

/// Composed development environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevEnvironmentSpec {
    pub toolchain: ToolchainIdentity,
    pub tools: BTreeMap<String, ToolEntry>,
    pub inputs: BTreeSet<String>,
}

impl DevEnvironmentSpec {
    /// Union of all components' tools and inputs.
    ///
    /// Order of `components` does not affect the result. Two components
    /// requiring the same tool at different versions is a conflict.
    pub fn compose(toolchain: &ToolchainIdentity, components: &[ComponentInputs]) -> Result<Self, EnvironmentError> {
        let mut tools: BTreeMap<String, ToolEntry> = BTreeMap::new();
        let mut inputs = BTreeSet::new();

        // Sorted so a conflict names the same pair regardless of input order
        let mut sorted: Vec<&ComponentInputs> = components.iter().collect();
        sorted.sort_by(|a, b| a.component.cmp(&b.component));

        for component in sorted {
            for tool in &component.tools {
                match tools.get_mut(&tool.name) {
                    Some(entry) if entry.version != tool.version => {
                        let first = entry.required_by.iter().next().cloned().unwrap_or_default();
                        return Err(EnvironmentError::ToolConflict {
                            tool: tool.name.clone(),
                            first_component: first,
                            first_version: entry.version.clone(),
                            second_component: component.component.clone(),
                            second_version: tool.version.clone(),
                        });
                    }
                    Some(entry) => {
                        entry.required_by.insert(component.component.clone());
                    }
                    None => {
                        tools.insert(
                            tool.name.clone(),
                            ToolEntry {
                                version: tool.version.clone(),
                                required_by: BTreeSet::from([component.component.clone()]),
                            },
                        );
                    }
                }
            }
            inputs.extend(component.inputs.iter().cloned());
        }

        Ok(Self {
            toolchain: toolchain.clone(),
            tools,
            inputs,
        })
    }

    pub fn tool_requirements(&self) -> Vec<ToolRequirement> {
        self.tools
            .iter()
            .map(|(name, entry)| ToolRequirement::new(name, &entry.version))
            .collect()
    }

    /// Stable identity of the environment contents
    pub fn digest(&self) -> ArtifactKey {
        let mut hasher = KeyHasher::new();
        hasher.text(&self.toolchain.fingerprint());
        for (name, entry) in &self.tools {
            hasher.text(name).text(&entry.version);
        }
        hasher.field(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.text(input);
        }
        hasher.finish()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// POSIX shell lines exporting the environment description
    pub fn shell_exports(&self) -> String {
        let tools = self
            .tools
            .iter()
            .map(|(name, entry)| format!("{}@{}", name, entry.version))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "export KILN_TOOLCHAIN={}\nexport KILN_TOOLS={}\nexport KILN_ENV_DIGEST={}\n",
            shell_quote(&self.toolchain.fingerprint()),
            shell_quote(&tools),
            self.digest()
        )
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ToolchainIdentity {
        ToolchainIdentity::new("1.79.0", "x86_64-unknown-linux-gnu")
    }

    fn components() -> Vec<ComponentInputs> {
        vec![
            ComponentInputs::new(
                "package",
                vec![ToolRequirement::new("cargo", "1.79.0"), ToolRequirement::new("rustc", "1.79.0")],
                vec!["askama@0.12.1".into(), "axum@0.7.5".into()],
            ),
            ComponentInputs::new(
                "check:lint",
                vec![ToolRequirement::new("cargo", "1.79.0"), ToolRequirement::new("clippy", "1.79.0")],
                vec!["axum@0.7.5".into()],
            ),
            ComponentInputs::new("check:format", vec![ToolRequirement::new("rustfmt", "1.79.0")], vec![]),
        ]
    }

    #[test]
    fn test_compose_is_union() {
        let env = DevEnvironmentSpec::compose(&identity(), &components()).unwrap();

        let names: Vec<&str> = env.tools.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["cargo", "clippy", "rustc", "rustfmt"]);
        assert_eq!(
            env.tools["cargo"].required_by,
            BTreeSet::from(["check:lint".to_string(), "package".to_string()])
        );
        assert_eq!(env.inputs.len(), 2);
    }

    #[test]
    fn test_compose_ignores_component_order() {
        let mut reversed = components();
        reversed.reverse();

        let a = DevEnvironmentSpec::compose(&identity(), &components()).unwrap();
        let b = DevEnvironmentSpec::compose(&identity(), &reversed).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_version_conflict_is_reported() {
        let mut inputs = components();
        inputs.push(ComponentInputs::new(
            "dev_env",
            vec![ToolRequirement::new("rustfmt", "1.80.0")],
            vec![],
        ));

        let err = DevEnvironmentSpec::compose(&identity(), &inputs).unwrap_err();
        let EnvironmentError::ToolConflict { tool, first_version, second_version, .. } = err;
        assert_eq!(tool, "rustfmt");
        assert_ne!(first_version, second_version);
    }

    #[test]
    fn test_empty_composition() {
        let env = DevEnvironmentSpec::compose(&identity(), &[]).unwrap();
        assert!(env.tools.is_empty());
        assert!(env.inputs.is_empty());
    }

    #[test]
    fn test_shell_exports() {
        let env = DevEnvironmentSpec::compose(&identity(), &components()).unwrap();
        let exports = env.shell_exports();
        assert!(exports.contains("export KILN_TOOLS='cargo@1.79.0 clippy@1.79.0 rustc@1.79.0 rustfmt@1.79.0'"));
        assert!(exports.contains("KILN_TOOLCHAIN='rustc-1.79.0-x86_64-unknown-linux-gnu-unknown'"));
    }

    #[test]
    fn test_shell_quote_escapes_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
