//! kiln - cache-aware build pipeline for a single Cargo package
//!
//! The pipeline filters a repository down to its build inputs, compiles
//! the dependency closure once per lock file and toolchain, compiles the
//! package against it, and runs independent quality checks. Every
//! compiled artifact lives in a content-addressed store (`kiln-store`),
//! so unchanged inputs are never rebuilt.

pub mod cancel;
pub mod checks;
pub mod config;
pub mod deps;
pub mod devenv;
pub mod graph;
pub mod mock;
pub mod package;
pub mod pipeline;
pub mod source;
pub mod toolchain;

pub use cancel::CancellationToken;
pub use checks::{Check, CheckOutcome, CheckRegistry, CheckResult};
pub use config::{EffectiveConfig, PipelineSettings};
pub use deps::{DependencyCacheArtifact, DependencyResolutionError};
pub use devenv::{DevEnvironmentSpec, EnvironmentError};
pub use graph::{PipelineGraph, Stage};
pub use kiln_store::{ArtifactKey, ArtifactStore, CacheStats};
pub use package::{CompilationError, PackageArtifact, PackageBuildError, PackageOutcome};
pub use pipeline::{Pipeline, PipelineError, PipelineReport, PipelineResult};
pub use source::{BuildInputSpec, FilterError, SourceFilter, SourceTree};
pub use toolchain::{CargoToolchain, Toolchain, ToolchainIdentity};
