//! Check registry
//!
//! Checks are independent quality gates over one source tree. A failing
//! check is reported, never raised: every check in the registry produces
//! a `CheckResult` whatever its siblings do.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use kiln_store::ArtifactStore;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::CheckSettings;
use crate::deps::{DependencyCacheArtifact, LockedPackage};
use crate::devenv::ComponentInputs;
use crate::package::{PackageBuilder, PackageOutcome};
use crate::source::BuildInputSpec;
use crate::toolchain::{scratch_dir, ToolOutput, ToolRequirement, Toolchain, ToolchainError};

/// A registered check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Check {
    /// Full package compilation
    Build,
    /// Static analysis with warnings denied
    Lint,
    /// API documentation generation
    Doc,
    /// Source formatting conformance
    Format,
}

impl Check {
    pub const ALL: [Check; 4] = [Check::Build, Check::Lint, Check::Doc, Check::Format];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Lint => "lint",
            Self::Doc => "doc",
            Self::Format => "format",
        }
    }

    /// Format only reads sources; everything else compiles against the
    /// dependency artifact
    pub fn requires_dependencies(&self) -> bool {
        !matches!(self, Self::Format)
    }

    /// Tools the check invokes, versioned with the toolchain release
    pub fn tools(&self, toolchain: &dyn Toolchain) -> Vec<ToolRequirement> {
        let release = toolchain.identity().release.as_str();
        let mut tools = toolchain.tools();
        match self {
            Self::Build => {}
            Self::Lint => tools.push(ToolRequirement::new("clippy", release)),
            Self::Doc => tools.push(ToolRequirement::new("rustdoc", release)),
            Self::Format => tools.push(ToolRequirement::new("rustfmt", release)),
        }
        tools
    }

    /// Tools and inputs this check contributes to a development environment
    pub fn component_inputs(&self, toolchain: &dyn Toolchain, closure: &[LockedPackage]) -> ComponentInputs {
        let inputs = if self.requires_dependencies() {
            closure.iter().map(LockedPackage::spec).collect()
        } else {
            Vec::new()
        };
        ComponentInputs::new(&format!("check:{}", self.name()), self.tools(toolchain), inputs)
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    Pass,
    Fail,
    /// An upstream artifact the check needs is unavailable
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: Check,
    pub outcome: CheckOutcome,
    pub diagnostics: String,
    pub duration_ms: u64,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.outcome == CheckOutcome::Pass
    }

    fn from_output(check: Check, output: ToolOutput, started: Instant) -> Self {
        Self {
            check,
            outcome: if output.success {
                CheckOutcome::Pass
            } else {
                CheckOutcome::Fail
            },
            diagnostics: output.diagnostics,
            duration_ms: elapsed_ms(started),
        }
    }

    fn failed(check: Check, diagnostics: String, started: Instant) -> Self {
        Self {
            check,
            outcome: CheckOutcome::Fail,
            diagnostics,
            duration_ms: elapsed_ms(started),
        }
    }

    /// Result of a check that needs the dependency artifact when there is none
    pub fn blocked(check: Check, reason: impl Into<String>) -> Self {
        Self {
            check,
            outcome: CheckOutcome::Blocked,
            diagnostics: reason.into(),
            duration_ms: 0,
        }
    }

    /// Build check result mirroring an already finished package build
    pub fn from_package(outcome: &PackageOutcome) -> Self {
        match outcome {
            PackageOutcome::Built(artifact) => Self {
                check: Check::Build,
                outcome: CheckOutcome::Pass,
                diagnostics: format!("built {} ({})", artifact.package, artifact.key.short()),
                duration_ms: 0,
            },
            PackageOutcome::Failed(e) => Self {
                check: Check::Build,
                outcome: CheckOutcome::Fail,
                diagnostics: e.diagnostics.clone(),
                duration_ms: 0,
            },
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

/// Everything a check may read
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub spec: &'a BuildInputSpec,
    pub deps: Option<&'a DependencyCacheArtifact>,
    pub store: &'a ArtifactStore,
    pub toolchain: &'a dyn Toolchain,
    pub cancel: &'a CancellationToken,
}

/// Ordered set of enabled checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRegistry {
    checks: Vec<Check>,
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::new(Check::ALL.to_vec())
    }
}

impl CheckRegistry {
    pub fn new(mut checks: Vec<Check>) -> Self {
        let mut seen = Vec::with_capacity(checks.len());
        checks.retain(|c| {
            if seen.contains(c) {
                false
            } else {
                seen.push(*c);
                true
            }
        });
        Self { checks }
    }

    /// Enabled checks by name; unknown names are skipped (config
    /// validation rejects them earlier)
    pub fn from_settings(settings: &CheckSettings) -> Self {
        Self::new(settings.enabled.iter().filter_map(|n| Check::from_name(n)).collect())
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn get(&self, name: &str) -> Option<Check> {
        Check::from_name(name).filter(|c| self.checks.contains(c))
    }

    /// Run one check. Never fails: problems become a `Fail` or `Blocked` result.
    pub fn run(&self, check: Check, ctx: CheckContext<'_>) -> CheckResult {
        let started = Instant::now();
        let deps = match (check.requires_dependencies(), ctx.deps) {
            (true, None) => {
                warn!(check = %check, "dependency artifact unavailable");
                return CheckResult::blocked(check, "dependency artifact unavailable");
            }
            (_, deps) => deps,
        };

        let result = match (check, deps) {
            (Check::Build, Some(deps)) => {
                let built = PackageBuilder::new(ctx.store, ctx.toolchain).build(ctx.spec, deps, ctx.cancel);
                match PackageOutcome::from_build(built) {
                    Ok(outcome) => CheckResult {
                        duration_ms: elapsed_ms(started),
                        ..CheckResult::from_package(&outcome)
                    },
                    Err(e) => CheckResult::failed(check, e.to_string(), started),
                }
            }
            (Check::Format, _) => match run_in_scratch(check, ctx, |dir| ctx.toolchain.check_format(dir, ctx.cancel)) {
                Ok(output) => CheckResult::from_output(check, output, started),
                Err(e) => CheckResult::failed(check, e.to_string(), started),
            },
            (Check::Lint, Some(deps)) => {
                match run_in_scratch(check, ctx, |dir| ctx.toolchain.lint(dir, &deps.path, ctx.cancel)) {
                    Ok(output) => CheckResult::from_output(check, output, started),
                    Err(e) => CheckResult::failed(check, e.to_string(), started),
                }
            }
            (Check::Doc, Some(deps)) => {
                match run_in_scratch(check, ctx, |dir| ctx.toolchain.document(dir, &deps.path, ctx.cancel)) {
                    Ok(output) => CheckResult::from_output(check, output, started),
                    Err(e) => CheckResult::failed(check, e.to_string(), started),
                }
            }
            (_, None) => CheckResult::blocked(check, "dependency artifact unavailable"),
        };

        info!(
            check = %check,
            outcome = ?result.outcome,
            duration_ms = result.duration_ms,
            "check finished"
        );
        result
    }

    /// Run every registered check concurrently, results in registry order
    pub fn run_all(&self, ctx: CheckContext<'_>) -> Vec<CheckResult> {
        self.checks.par_iter().map(|check| self.run(*check, ctx)).collect()
    }
}

/// Materialize the tree into a private directory and run `f` there
fn run_in_scratch<F>(check: Check, ctx: CheckContext<'_>, f: F) -> Result<ToolOutput, ToolchainError>
where
    F: FnOnce(&Path) -> Result<ToolOutput, ToolchainError>,
{
    ctx.cancel.check()?;
    let work = scratch_dir(&format!("kiln-{}-", check.name()))?;
    ctx.spec.tree.materialize(work.path())?;
    f(work.path())
}
