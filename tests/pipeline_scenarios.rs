//! End-to-end pipeline scenarios against the scripted toolchain

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiln::config::PipelineSettings;
use kiln::deps::DependencyResolutionError;
use kiln::mock::{FailureConfig, Operation, ScriptedToolchain};
use kiln::package::{PackageBuildError, PackageOutcome};
use kiln::toolchain::ToolRequirement;
use kiln::{ArtifactStore, CancellationToken, Check, CheckOutcome, Pipeline, PipelineError};
use kiln_store::ArtifactKind;
use tempfile::TempDir;

const MANIFEST: &str = r#"[package]
name = "cypher_character_frontend"
version = "0.1.0"
edition = "2021"

[dependencies]
askama = "0.12"
axum = "0.7"
"#;

const MAIN_RS: &str = r#"mod routes;

fn main() {
    let app = routes::router();
    println!("{}", app);
}
"#;

const ROUTES_RS: &str = r#"pub fn router() -> String {
    String::from("/character")
}
"#;

fn lock_file(askama_version: &str) -> String {
    format!(
        r#"version = 3

[[package]]
name = "askama"
version = "{askama_version}"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "axum"
version = "0.7.5"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "cypher_character_frontend"
version = "0.1.0"
dependencies = ["askama", "axum"]
"#
    )
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn sample_repo() -> TempDir {
    let repo = TempDir::new().unwrap();
    let root = repo.path();
    write(root, "Cargo.toml", MANIFEST);
    write(root, "Cargo.lock", &lock_file("0.12.1"));
    write(root, "src/main.rs", MAIN_RS);
    write(root, "src/routes.rs", ROUTES_RS);
    write(root, "templates/character.html", "<h1>{{ name }}</h1>\n");
    write(root, "README.md", "# Cypher character sheet\n");
    write(root, "target/release/stale", "old build output");
    repo
}

struct Harness {
    repo: TempDir,
    store: TempDir,
    toolchain: Arc<ScriptedToolchain>,
}

impl Harness {
    fn new() -> Self {
        Self::with_toolchain(ScriptedToolchain::new())
    }

    fn with_toolchain(toolchain: ScriptedToolchain) -> Self {
        Self {
            repo: sample_repo(),
            store: TempDir::new().unwrap(),
            toolchain: Arc::new(toolchain),
        }
    }

    fn pipeline(&self) -> Pipeline {
        self.pipeline_with(PipelineSettings::default())
    }

    fn pipeline_with(&self, settings: PipelineSettings) -> Pipeline {
        let store = ArtifactStore::open(self.store.path()).unwrap();
        Pipeline::new(self.repo.path(), settings, store, self.toolchain.clone()).unwrap()
    }

    fn edit(&self, rel: &str, contents: &str) {
        write(self.repo.path(), rel, contents);
    }
}

fn stored(store: &ArtifactStore, kind: ArtifactKind) -> usize {
    store.list().unwrap().iter().filter(|meta| meta.kind == kind).count()
}

fn staging_entries(store: &Path) -> usize {
    fs::read_dir(store.join(".tmp")).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn test_filter_is_idempotent() {
    let h = Harness::new();
    let pipeline = h.pipeline();

    let first = pipeline.filter().unwrap();
    let second = pipeline.filter().unwrap();

    assert_eq!(first, second);
    assert_eq!(first.tree.digest(), second.tree.digest());
    assert!(first.tree.contains("templates/character.html"));
    assert!(!first.tree.contains("README.md"));
    assert!(!first.tree.contains("target/release/stale"));
}

#[test]
fn test_unchanged_lock_reuses_dependency_artifact() {
    let h = Harness::new();
    let pipeline = h.pipeline();
    let spec = pipeline.filter().unwrap();

    let first = pipeline.build_dependencies(&spec).unwrap();
    let second = pipeline.build_dependencies(&spec).unwrap();

    assert_eq!(first.key, second.key);
    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(h.toolchain.invocations().dependency_builds, 1);
    assert_eq!(pipeline.store().stats().hits, 1);
}

#[test]
fn test_source_edit_reuses_dependencies_and_rebuilds_package() {
    let h = Harness::new();
    let pipeline = h.pipeline();

    let spec = pipeline.filter().unwrap();
    let deps = pipeline.build_dependencies(&spec).unwrap();
    let before = pipeline.build_package(&spec, &deps).unwrap();

    h.edit("src/routes.rs", "pub fn router() -> String {\n    String::from(\"/sheet\")\n}\n");
    let spec = pipeline.filter().unwrap();
    let deps_after = pipeline.build_dependencies(&spec).unwrap();
    let after = pipeline.build_package(&spec, &deps_after).unwrap();

    assert_eq!(deps_after.key, deps.key);
    assert!(deps_after.reused);
    assert_ne!(after.key, before.key);
    assert!(!after.reused);

    let calls = h.toolchain.invocations();
    assert_eq!(calls.dependency_builds, 1);
    assert_eq!(calls.package_builds, 2);
}

#[test]
fn test_unchanged_tree_is_not_recompiled() {
    let h = Harness::new();
    let pipeline = h.pipeline();
    let spec = pipeline.filter().unwrap();
    let deps = pipeline.build_dependencies(&spec).unwrap();

    let first = pipeline.build_package(&spec, &deps).unwrap();
    let second = pipeline.build_package(&spec, &deps).unwrap();

    assert_eq!(first.key, second.key);
    assert!(second.reused);
    assert_eq!(h.toolchain.invocations().package_builds, 1);
    assert!(first.path.join("bin/cypher_character_frontend").is_file());
}

#[test]
fn test_compilation_error_is_reported_and_publishes_nothing() {
    let h = Harness::new();
    h.edit("src/routes.rs", "pub fn router() -> String {\n    String::from(\"/character\"\n}\n");
    let pipeline = h.pipeline();
    let spec = pipeline.filter().unwrap();
    let deps = pipeline.build_dependencies(&spec).unwrap();

    let err = pipeline.build_package(&spec, &deps).unwrap_err();
    let PipelineError::Package(PackageBuildError::Compilation(failure)) = &err else {
        panic!("expected a compilation error, got {err:?}");
    };
    assert!(failure.diagnostics.contains("src/routes.rs"));
    assert_eq!(err.exit_code(), 30);

    assert_eq!(stored(pipeline.store(), ArtifactKind::Package), 0);
    assert_eq!(stored(pipeline.store(), ArtifactKind::Dependencies), 1);
    assert_eq!(staging_entries(h.store.path()), 0);

    // Fixing the source builds without touching the dependency artifact
    h.edit("src/routes.rs", ROUTES_RS);
    let spec = pipeline.filter().unwrap();
    let deps = pipeline.build_dependencies(&spec).unwrap();
    pipeline.build_package(&spec, &deps).unwrap();
    assert_eq!(h.toolchain.invocations().dependency_builds, 1);
}

#[test]
fn test_compilation_error_does_not_affect_format_check() {
    let h = Harness::new();
    h.edit("src/main.rs", "mod routes;\n\nfn main() {\n    println!(\"{}\", routes::router());\n");
    let report = h.pipeline().run().unwrap();

    let PackageOutcome::Failed(failure) = &report.build else {
        panic!("expected the package build to fail");
    };
    assert!(failure.diagnostics.contains("src/main.rs"));

    let outcome = |check: Check| report.checks.iter().find(|r| r.check == check).unwrap().outcome;
    assert_eq!(outcome(Check::Format), CheckOutcome::Pass);
    assert_eq!(outcome(Check::Build), CheckOutcome::Fail);
    assert_eq!(outcome(Check::Lint), CheckOutcome::Fail);
    assert!(!report.is_success());
    assert_eq!(report.exit_code(), 50);
}

#[test]
fn test_checks_run_independently() {
    let h = Harness::new();
    h.edit("src/routes.rs", "pub fn router() -> String {\n    todo!()\n}\n");
    h.edit("src/extra.rs", "pub fn helper() {}   \n");
    let report = h.pipeline().run().unwrap();

    let checks: Vec<Check> = report.checks.iter().map(|r| r.check).collect();
    assert_eq!(checks, vec![Check::Build, Check::Lint, Check::Doc, Check::Format]);

    let outcome = |check: Check| report.checks.iter().find(|r| r.check == check).unwrap().outcome;
    assert_eq!(outcome(Check::Build), CheckOutcome::Pass);
    assert_eq!(outcome(Check::Lint), CheckOutcome::Fail);
    assert_eq!(outcome(Check::Doc), CheckOutcome::Pass);
    assert_eq!(outcome(Check::Format), CheckOutcome::Fail);
    assert_eq!(report.failed_checks().count(), 2);
}

#[test]
fn test_second_run_hits_the_cache() {
    let h = Harness::new();
    let pipeline = h.pipeline();

    let first = pipeline.run().unwrap();
    assert!(first.is_success(), "{:#?}", first.checks);
    let hits_after_first = first.cache.hits;

    let second = pipeline.run().unwrap();
    assert!(second.dependencies.reused);
    assert!(second.build.artifact().unwrap().reused);
    assert!(second.cache.hits >= hits_after_first + 2);

    let calls = h.toolchain.invocations();
    assert_eq!(calls.dependency_builds, 1);
    assert_eq!(calls.package_builds, 1);
    // Check results are not cached
    assert_eq!(calls.lints, 2);
    assert_eq!(calls.format_checks, 2);
}

#[test]
fn test_lock_change_produces_new_key_and_keeps_old_artifact() {
    let h = Harness::new();
    let pipeline = h.pipeline();

    let spec = pipeline.filter().unwrap();
    let old = pipeline.build_dependencies(&spec).unwrap();

    h.edit("Cargo.lock", &lock_file("0.12.2"));
    let spec = pipeline.filter().unwrap();
    let new = pipeline.build_dependencies(&spec).unwrap();

    assert_ne!(old.key, new.key);
    assert!(!new.reused);
    assert!(new.closure.iter().any(|p| p.spec() == "askama@0.12.2"));
    assert_eq!(h.toolchain.invocations().dependency_builds, 2);

    let retained = pipeline.store().fetch(&old.key).unwrap().unwrap();
    assert_eq!(retained.path, old.path);
    assert!(old.path.join("target/release/deps/libaskama-0.12.1.rlib").is_file());
}

#[test]
fn test_unresolvable_dependency_aborts_run_but_format_still_runs() {
    let h = Harness::with_toolchain(ScriptedToolchain::new().with_unresolvable("axum"));
    let pipeline = h.pipeline();

    let err = pipeline.run().unwrap_err();
    let PipelineError::Dependencies(DependencyResolutionError::Build { diagnostics, .. }) = &err else {
        panic!("expected a dependency build error, got {err:?}");
    };
    assert!(diagnostics.contains("axum"));
    assert_eq!(err.exit_code(), 20);
    assert!(pipeline.store().list().unwrap().is_empty());

    let spec = pipeline.filter().unwrap();
    let format = pipeline.run_check("format", &spec, None).unwrap();
    assert_eq!(format.outcome, CheckOutcome::Pass);
    let lint = pipeline.run_check("lint", &spec, None).unwrap();
    assert_eq!(lint.outcome, CheckOutcome::Blocked);
}

#[test]
fn test_missing_lock_file_is_a_resolution_error() {
    let h = Harness::new();
    fs::remove_file(h.repo.path().join("Cargo.lock")).unwrap();
    let pipeline = h.pipeline();
    let spec = pipeline.filter().unwrap();

    let err = pipeline.build_dependencies(&spec).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Dependencies(DependencyResolutionError::MissingLockFile)
    ));
    assert_eq!(h.toolchain.invocations().dependency_builds, 0);
}

#[test]
fn test_unknown_check_is_rejected() {
    let h = Harness::new();
    let pipeline = h.pipeline();
    let spec = pipeline.filter().unwrap();

    let err = pipeline.run_check("coverage", &spec, None).unwrap_err();
    assert!(matches!(err, PipelineError::UnknownCheck(name) if name == "coverage"));
}

#[test]
fn test_disabled_check_is_rejected_without_running() {
    let h = Harness::new();
    let mut settings = PipelineSettings::default();
    settings.checks.enabled = vec!["format".to_string()];
    let pipeline = h.pipeline_with(settings);
    let spec = pipeline.filter().unwrap();
    let deps = pipeline.build_dependencies(&spec).unwrap();

    let err = pipeline.run_check("lint", &spec, Some(&deps)).unwrap_err();
    assert!(matches!(&err, PipelineError::CheckDisabled(name) if name == "lint"));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(h.toolchain.invocations().lints, 0);

    let format = pipeline.run_check("format", &spec, None).unwrap();
    assert_eq!(format.outcome, CheckOutcome::Pass);
}

#[test]
fn test_cancellation_publishes_nothing() {
    let h = Harness::new();
    h.toolchain
        .inject(Operation::Dependencies, FailureConfig::delay(Duration::from_secs(30)));
    let cancel = CancellationToken::new();
    let pipeline = h.pipeline().with_cancellation(cancel.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
    });
    let err = pipeline.run().unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(err.exit_code(), 80);
    assert!(pipeline.store().list().unwrap().is_empty());
    assert_eq!(staging_entries(h.store.path()), 0);
}

#[test]
fn test_concurrent_pipelines_share_one_artifact() {
    let h = Harness::new();
    let pipelines = [h.pipeline(), h.pipeline()];
    let spec = pipelines[0].filter().unwrap();
    let spec = &spec;

    let keys: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = pipelines
            .iter()
            .map(|p| s.spawn(move || p.build_dependencies(spec).unwrap().key))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert_eq!(keys[0], keys[1]);
    assert_eq!(stored(pipelines[0].store(), ArtifactKind::Dependencies), 1);
    assert_eq!(staging_entries(h.store.path()), 0);
}

#[test]
fn test_environment_is_union_of_components() {
    let h = Harness::new();
    let pipeline = h.pipeline();
    let spec = pipeline.filter().unwrap();

    let env = pipeline.compose_environment(&spec).unwrap();
    let tools: Vec<&str> = env.tools.keys().map(String::as_str).collect();
    assert_eq!(tools, vec!["cargo", "clippy", "rustc", "rustdoc", "rustfmt"]);
    assert!(env.inputs.contains("askama@0.12.1"));
    assert!(env.inputs.contains("axum@0.7.5"));
    assert!(env.tools["rustfmt"].required_by.contains("check:format"));

    // Composing never invokes the toolchain
    assert_eq!(h.toolchain.invocations().dependency_builds, 0);

    let report = pipeline.run().unwrap();
    assert_eq!(report.environment, env);
}

#[test]
fn test_environment_tool_conflict_is_an_error() {
    let h = Harness::new();
    let mut settings = PipelineSettings::default();
    settings.dev_env.extra_tools = vec![
        ToolRequirement::new("cargo-watch", "8.5.2"),
        ToolRequirement::new("rustfmt", "1.80.0"),
    ];
    let pipeline = h.pipeline_with(settings);
    let spec = pipeline.filter().unwrap();

    let err = pipeline.compose_environment(&spec).unwrap_err();
    assert!(matches!(err, PipelineError::Environment(_)));
    assert!(err.to_string().contains("rustfmt"));
    assert_eq!(err.exit_code(), 40);
}
