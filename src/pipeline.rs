//! Pipeline orchestration
//!
//! `Pipeline` exposes each stage as an independent entry point (filter,
//! dependencies, package, one check, environment) and `run` executes the
//! whole stage graph wave by wave.
//!
//! Failure policy for `run`:
//! - filter and dependency errors abort the run (nothing downstream can
//!   be trusted without them)
//! - a compile failure is recorded in the report; checks still run
//! - check failures are recorded, never raised

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kiln_store::{ArtifactKey, ArtifactStore, CacheStats, StoreError};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::cancel::{CancellationToken, EXIT_CODE_CANCELLED};
use crate::checks::{Check, CheckContext, CheckRegistry, CheckResult};
use crate::config::{ConfigError, EffectiveConfig, PipelineSettings};
use crate::deps::{DependencyCacheArtifact, DependencyCacheBuilder, DependencyResolutionError, LockedPackage};
use crate::devenv::{ComponentInputs, DevEnvironmentSpec, EnvironmentError};
use crate::graph::{GraphError, PipelineGraph, Stage};
use crate::package::{PackageArtifact, PackageBuildError, PackageBuilder, PackageOutcome};
use crate::source::{BuildInputSpec, FilterError, PackageId, SourceFilter};
use crate::toolchain::{CargoToolchain, Toolchain, ToolchainError};

/// Exit code when the run completed but the package or a check failed
pub const EXIT_CODE_CHECKS_FAILED: i32 = 50;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("source filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("dependency resolution error: {0}")]
    Dependencies(#[from] DependencyResolutionError),

    #[error("package build error: {0}")]
    Package(#[from] PackageBuildError),

    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("toolchain error: {0}")]
    Toolchain(#[from] ToolchainError),

    #[error("stage graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("unknown check: {0}")]
    UnknownCheck(String),

    #[error("check {0} is disabled by checks.enabled")]
    CheckDisabled(String),

    #[error("stage {stage} ran without its {input} input")]
    MissingInput { stage: Stage, input: &'static str },

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 1,
            PipelineError::UnknownCheck(_) | PipelineError::CheckDisabled(_) => 2,
            PipelineError::Filter(_) => 10,
            PipelineError::Dependencies(_) => 20,
            PipelineError::Package(_) => 30,
            PipelineError::Environment(_) => 40,
            PipelineError::Store(_) => 70,
            PipelineError::Toolchain(_) => 91,
            PipelineError::Graph(_) | PipelineError::MissingInput { .. } => 1,
            PipelineError::Cancelled => EXIT_CODE_CANCELLED,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Everything a full run produced
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub package: PackageId,
    pub tree_digest: ArtifactKey,
    pub dependencies: DependencyCacheArtifact,
    pub build: PackageOutcome,
    /// In registry order
    pub checks: Vec<CheckResult>,
    pub environment: DevEnvironmentSpec,
    pub cache: CacheStats,
    pub duration_ms: u64,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.build.artifact().is_some() && self.checks.iter().all(CheckResult::passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            EXIT_CODE_CHECKS_FAILED
        }
    }
}

/// What one stage hands to the stages after it
enum StageOutput {
    Filter(BuildInputSpec),
    Dependencies(DependencyCacheArtifact),
    Package(PackageOutcome),
    Check(CheckResult),
    Environment(DevEnvironmentSpec),
}

#[derive(Default)]
struct RunState {
    spec: Option<BuildInputSpec>,
    deps: Option<DependencyCacheArtifact>,
    package: Option<PackageOutcome>,
    checks: Vec<CheckResult>,
    environment: Option<DevEnvironmentSpec>,
}

impl RunState {
    fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Filter(spec) => self.spec = Some(spec),
            StageOutput::Dependencies(deps) => self.deps = Some(deps),
            StageOutput::Package(outcome) => self.package = Some(outcome),
            StageOutput::Check(result) => self.checks.push(result),
            StageOutput::Environment(env) => self.environment = Some(env),
        }
    }

    fn spec(&self, stage: Stage) -> PipelineResult<&BuildInputSpec> {
        self.spec.as_ref().ok_or(PipelineError::MissingInput { stage, input: "source" })
    }

    fn deps(&self, stage: Stage) -> PipelineResult<&DependencyCacheArtifact> {
        self.deps.as_ref().ok_or(PipelineError::MissingInput {
            stage,
            input: "dependency artifact",
        })
    }
}

/// Pipeline execution context
pub struct Pipeline {
    repo_root: PathBuf,
    settings: PipelineSettings,
    filter: SourceFilter,
    registry: CheckRegistry,
    store: ArtifactStore,
    toolchain: Arc<dyn Toolchain>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        settings: PipelineSettings,
        store: ArtifactStore,
        toolchain: Arc<dyn Toolchain>,
    ) -> PipelineResult<Self> {
        let filter = SourceFilter::from_settings(&settings.filter)?;
        let registry = CheckRegistry::from_settings(&settings.checks);
        Ok(Self {
            repo_root: repo_root.into(),
            settings,
            filter,
            registry,
            store,
            toolchain,
            cancel: CancellationToken::new(),
        })
    }

    /// Open the configured store and probe the configured `cargo` toolchain
    pub fn from_config(repo_root: impl Into<PathBuf>, config: &EffectiveConfig) -> PipelineResult<Self> {
        let settings = config.settings()?;
        let store_root = settings.store.resolve_root().ok_or_else(|| {
            ConfigError::Invalid("cannot determine a store root; set store.root".to_string())
        })?;
        let store = ArtifactStore::open(&store_root)?;
        let toolchain = CargoToolchain::from_settings(&settings.toolchain)?;
        info!(
            store = %store_root.display(),
            toolchain = %toolchain.identity().fingerprint(),
            "pipeline configured"
        );
        Self::new(repo_root, settings, store, Arc::new(toolchain))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.registry
    }

    pub fn graph(&self) -> PipelineGraph {
        PipelineGraph::standard(&self.registry)
    }

    /// Report `Cancelled` for anything that failed after cancellation
    fn cancelled_or(&self, err: impl Into<PipelineError>) -> PipelineError {
        if self.cancel.is_cancelled() {
            PipelineError::Cancelled
        } else {
            err.into()
        }
    }

    fn check_cancelled(&self) -> PipelineResult<()> {
        self.cancel.check().map_err(|_| PipelineError::Cancelled)
    }

    /// Snapshot the repository and identify the package
    pub fn filter(&self) -> PipelineResult<BuildInputSpec> {
        self.check_cancelled()?;
        let tree = self.filter.filter(&self.repo_root)?;
        let package = PackageId::from_tree(
            &tree,
            self.settings.package.name.as_deref(),
            self.settings.package.version.as_deref(),
        )
        .map_err(FilterError::from)?;
        info!(package = %package, files = tree.len(), "source filtered");
        Ok(BuildInputSpec::new(tree, package))
    }

    pub fn build_dependencies(&self, spec: &BuildInputSpec) -> PipelineResult<DependencyCacheArtifact> {
        self.check_cancelled()?;
        DependencyCacheBuilder::new(&self.store, self.toolchain.as_ref())
            .build(spec, &self.cancel)
            .map_err(|e| self.cancelled_or(e))
    }

    /// Build the package. A compile failure is returned as
    /// `PipelineError::Package(PackageBuildError::Compilation(_))`.
    pub fn build_package(&self, spec: &BuildInputSpec, deps: &DependencyCacheArtifact) -> PipelineResult<PackageArtifact> {
        self.check_cancelled()?;
        PackageBuilder::new(&self.store, self.toolchain.as_ref())
            .build(spec, deps, &self.cancel)
            .map_err(|e| self.cancelled_or(e))
    }

    /// Look up an enabled check by name
    pub fn resolve_check(&self, name: &str) -> PipelineResult<Check> {
        match (Check::from_name(name), self.registry.get(name)) {
            (_, Some(check)) => Ok(check),
            (Some(_), None) => Err(PipelineError::CheckDisabled(name.to_string())),
            (None, None) => Err(PipelineError::UnknownCheck(name.to_string())),
        }
    }

    /// Run a single check by name.
    ///
    /// Checks that need the dependency artifact report `Blocked` when
    /// `deps` is `None`.
    pub fn run_check(
        &self,
        name: &str,
        spec: &BuildInputSpec,
        deps: Option<&DependencyCacheArtifact>,
    ) -> PipelineResult<CheckResult> {
        let check = self.resolve_check(name)?;
        self.check_cancelled()?;
        let result = self.registry.run(check, self.check_context(spec, deps));
        self.check_cancelled()?;
        Ok(result)
    }

    /// Compose the development environment for `spec` without building
    pub fn compose_environment(&self, spec: &BuildInputSpec) -> PipelineResult<DevEnvironmentSpec> {
        let (_, _, closure) = DependencyCacheBuilder::new(&self.store, self.toolchain.as_ref()).resolve(spec)?;
        self.environment_for(&closure)
    }

    fn environment_for(&self, closure: &[LockedPackage]) -> PipelineResult<DevEnvironmentSpec> {
        let toolchain = self.toolchain.as_ref();
        let mut components = vec![ComponentInputs::new(
            "package",
            toolchain.tools(),
            closure.iter().map(LockedPackage::spec).collect(),
        )];
        components.extend(
            self.registry
                .checks()
                .iter()
                .map(|check| check.component_inputs(toolchain, closure)),
        );
        if !self.settings.dev_env.extra_tools.is_empty() {
            components.push(ComponentInputs::new(
                "dev_env",
                self.settings.dev_env.extra_tools.clone(),
                Vec::new(),
            ));
        }
        Ok(DevEnvironmentSpec::compose(toolchain.identity(), &components)?)
    }

    fn check_context<'a>(
        &'a self,
        spec: &'a BuildInputSpec,
        deps: Option<&'a DependencyCacheArtifact>,
    ) -> CheckContext<'a> {
        CheckContext {
            spec,
            deps,
            store: &self.store,
            toolchain: self.toolchain.as_ref(),
            cancel: &self.cancel,
        }
    }

    /// Execute the full stage graph.
    ///
    /// Stages of one wave run concurrently; a fatal error is raised once
    /// the wave it occurred in has finished.
    pub fn run(&self) -> PipelineResult<PipelineReport> {
        let started = Instant::now();
        let waves = self.graph().waves()?;
        let mut state = RunState::default();

        for wave in waves {
            self.check_cancelled()?;
            debug!(stages = ?wave.iter().map(Stage::to_string).collect::<Vec<_>>(), "starting wave");

            let outputs: Vec<PipelineResult<StageOutput>> =
                wave.par_iter().map(|stage| self.execute_stage(*stage, &state)).collect();

            self.check_cancelled()?;
            for output in outputs {
                state.apply(output?);
            }
        }

        self.finish(state, started)
    }

    fn execute_stage(&self, stage: Stage, state: &RunState) -> PipelineResult<StageOutput> {
        let started = Instant::now();
        let output = match stage {
            Stage::Filter => StageOutput::Filter(self.filter()?),
            Stage::Dependencies => StageOutput::Dependencies(self.build_dependencies(state.spec(stage)?)?),
            Stage::Package => {
                let built = PackageBuilder::new(&self.store, self.toolchain.as_ref()).build(
                    state.spec(stage)?,
                    state.deps(stage)?,
                    &self.cancel,
                );
                StageOutput::Package(PackageOutcome::from_build(built).map_err(|e| self.cancelled_or(e))?)
            }
            Stage::Check(Check::Build) => match &state.package {
                Some(outcome) => StageOutput::Check(CheckResult::from_package(outcome)),
                None => return Err(PipelineError::MissingInput { stage, input: "package" }),
            },
            Stage::Check(check) => StageOutput::Check(
                self.registry
                    .run(check, self.check_context(state.spec(stage)?, state.deps.as_ref())),
            ),
            Stage::Environment => StageOutput::Environment(self.environment_for(&state.deps(stage)?.closure)?),
        };
        debug!(stage = %stage, elapsed_ms = started.elapsed().as_millis() as u64, "stage finished");
        Ok(output)
    }

    fn finish(&self, state: RunState, started: Instant) -> PipelineResult<PipelineReport> {
        let RunState {
            spec,
            deps,
            package,
            mut checks,
            environment,
        } = state;
        let spec = spec.ok_or(PipelineError::MissingInput {
            stage: Stage::Filter,
            input: "source",
        })?;
        let missing = |input| PipelineError::MissingInput {
            stage: Stage::Environment,
            input,
        };
        let dependencies = deps.ok_or_else(|| missing("dependency artifact"))?;
        let build = package.ok_or_else(|| missing("package"))?;
        let environment = environment.ok_or_else(|| missing("environment"))?;

        // Waves finish in arbitrary order; report in registry order
        let order = self.registry.checks();
        checks.sort_by_key(|r| order.iter().position(|c| *c == r.check));

        let report = PipelineReport {
            package: spec.package.clone(),
            tree_digest: spec.tree.digest(),
            dependencies,
            build,
            checks,
            environment,
            cache: self.store.stats(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            package = %report.package,
            success = report.is_success(),
            failed_checks = report.failed_checks().count(),
            cache_hits = report.cache.hits,
            duration_ms = report.duration_ms,
            "pipeline finished"
        );
        Ok(report)
    }
}
