//! kiln CLI
//!
//! Entry point for the `kiln` command-line tool.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kiln::config::{default_host_config_path, REPO_CONFIG_FILE};
use kiln::pipeline::EXIT_CODE_CHECKS_FAILED;
use kiln::{
    ArtifactStore, CancellationToken, CheckResult, EffectiveConfig, Pipeline, PipelineError, PipelineResult,
};
use serde::Serialize;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Cache-aware build pipeline for a Cargo package", version)]
struct Cli {
    /// Repository root
    #[arg(long, short = 'C', global = true, default_value = ".")]
    repo: PathBuf,

    /// Repo config file (default: <repo>/kiln.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Artifact store root (overrides store.root)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging (KILN_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build (or reuse) the dependency artifact
    Deps,

    /// Build (or reuse) the package artifact
    Build,

    /// Run a single check
    Check {
        /// build, lint, doc or format
        name: String,
    },

    /// Compose the development environment
    Env {
        /// Print shell export lines instead of a description
        #[arg(long)]
        shell: bool,
    },

    /// Run the full pipeline
    Run,

    /// Artifact store maintenance
    Store {
        #[command(subcommand)]
        action: StoreCommands,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// List stored artifacts
    List,

    /// Remove staging directories left by killed producers
    Clean {
        /// Only remove staging older than this many hours
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let code = match execute(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "kiln failed");
            eprintln!("error: {}", e);
            e.exit_code()
        }
    };
    process::exit(code);
}

fn setup_logging(verbose: bool) {
    let filter = if verbose { "kiln=debug,kiln_store=debug" } else { "kiln=info,kiln_store=info" };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

fn load_config(cli: &Cli) -> PipelineResult<EffectiveConfig> {
    let overrides = cli
        .store
        .as_ref()
        .map(|root| serde_json::json!({ "store": { "root": root } }));
    let repo_config = cli.config.clone().unwrap_or_else(|| cli.repo.join(REPO_CONFIG_FILE));
    let host_config = default_host_config_path();

    Ok(EffectiveConfig::build(
        host_config.as_deref(),
        Some(repo_config.as_path()),
        overrides,
    )?)
}

fn open_pipeline(cli: &Cli, config: &EffectiveConfig) -> PipelineResult<Pipeline> {
    let cancel = CancellationToken::new();
    if let Err(e) = cancel.install_signal_handler() {
        warn!(error = %e, "cannot install signal handler; interrupts will not cancel cleanly");
    }
    Ok(Pipeline::from_config(&cli.repo, config)?.with_cancellation(cancel))
}

fn execute(cli: &Cli) -> PipelineResult<i32> {
    let config = load_config(cli)?;
    let open = || open_pipeline(cli, &config);

    match &cli.command {
        Commands::Deps => {
            let pipeline = open()?;
            let spec = pipeline.filter()?;
            let deps = pipeline.build_dependencies(&spec)?;
            emit(cli.json, &deps, || {
                format!(
                    "dependencies {} ({} packages, {})\n  {}",
                    deps.key.short(),
                    deps.closure.len(),
                    if deps.reused { "reused" } else { "built" },
                    deps.path.display()
                )
            });
            Ok(0)
        }
        Commands::Build => {
            let pipeline = open()?;
            let spec = pipeline.filter()?;
            let deps = pipeline.build_dependencies(&spec)?;
            let package = match pipeline.build_package(&spec, &deps) {
                Ok(package) => package,
                Err(PipelineError::Package(kiln::PackageBuildError::Compilation(e))) => {
                    eprintln!("{}", e.diagnostics);
                    return Err(PipelineError::Package(e.into()));
                }
                Err(e) => return Err(e),
            };
            emit(cli.json, &package, || {
                format!(
                    "{} {} ({})\n  {}",
                    package.package,
                    package.key.short(),
                    if package.reused { "reused" } else { "built" },
                    package.path.display()
                )
            });
            Ok(0)
        }
        Commands::Check { name } => {
            let pipeline = open()?;
            let check = pipeline.resolve_check(name)?;
            let spec = pipeline.filter()?;
            let deps = if check.requires_dependencies() {
                Some(pipeline.build_dependencies(&spec)?)
            } else {
                None
            };
            let result = pipeline.run_check(name, &spec, deps.as_ref())?;
            emit(cli.json, &result, || describe_check(&result));
            Ok(if result.passed() { 0 } else { EXIT_CODE_CHECKS_FAILED })
        }
        Commands::Env { shell } => {
            let pipeline = open()?;
            let spec = pipeline.filter()?;
            let env = pipeline.compose_environment(&spec)?;
            if *shell {
                print!("{}", env.shell_exports());
            } else {
                emit(cli.json, &env, || {
                    let mut lines = vec![format!("toolchain {}", env.toolchain.fingerprint())];
                    lines.extend(env.tools.iter().map(|(name, entry)| {
                        let by: Vec<&str> = entry.required_by.iter().map(String::as_str).collect();
                        format!("  {} {} ({})", name, entry.version, by.join(", "))
                    }));
                    lines.push(format!("{} inputs", env.inputs.len()));
                    lines.join("\n")
                });
            }
            Ok(0)
        }
        Commands::Run => {
            let report = open()?.run()?;
            emit(cli.json, &report, || {
                let build = match report.build.artifact() {
                    Some(artifact) => format!("built {}", artifact.key.short()),
                    None => "FAILED".to_string(),
                };
                let mut lines = vec![format!("{} {}", report.package, build)];
                lines.extend(report.checks.iter().map(describe_check));
                lines.push(format!(
                    "cache: {} hits, {} misses, {} published",
                    report.cache.hits, report.cache.misses, report.cache.publishes
                ));
                lines.join("\n")
            });
            Ok(report.exit_code())
        }
        Commands::Store { action } => run_store(cli, &config, action),
    }
}

fn run_store(cli: &Cli, config: &EffectiveConfig, action: &StoreCommands) -> PipelineResult<i32> {
    let settings = config.settings()?;
    let root = settings.store.resolve_root().ok_or_else(|| {
        kiln::config::ConfigError::Invalid("cannot determine a store root; set store.root".to_string())
    })?;
    let store = ArtifactStore::open(&root)?;

    match action {
        StoreCommands::List => {
            let artifacts = store.list()?;
            emit(cli.json, &artifacts, || {
                artifacts
                    .iter()
                    .map(|meta| format!("{} {:<12} {}", meta.key.short(), meta.kind.as_str(), meta.label))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        }
        StoreCommands::Clean { older_than_hours } => {
            let removed = store.cleanup_orphaned_staging(staging_age(*older_than_hours))?;
            emit(cli.json, &serde_json::json!({ "removed": removed }), || {
                format!("removed {} staging directories from {}", removed, root.display())
            });
        }
    }
    Ok(0)
}

/// Age threshold for `store clean`; huge values saturate to "never"
fn staging_age(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

fn describe_check(result: &CheckResult) -> String {
    let mut line = format!("  {:<8} {:?}", result.check.name(), result.outcome);
    if !result.passed() && !result.diagnostics.is_empty() {
        for diag in result.diagnostics.lines().take(20) {
            line.push_str("\n      ");
            line.push_str(diag);
        }
    }
    line
}

/// Print JSON or the human rendering
fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) {
    if !json {
        println!("{}", human());
        return;
    }
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("error: cannot serialize output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_age_in_hours() {
        assert_eq!(staging_age(24), Duration::from_secs(86_400));
        assert_eq!(staging_age(0), Duration::ZERO);
    }

    #[test]
    fn test_staging_age_saturates_instead_of_overflowing() {
        assert_eq!(staging_age(u64::MAX), Duration::from_secs(u64::MAX));
        assert_eq!(staging_age(u64::MAX / 3600 + 1), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_clean_accepts_huge_threshold() {
        let cli = Cli::try_parse_from(["kiln", "store", "clean", "--older-than-hours", "18446744073709551615"]).unwrap();
        match cli.command {
            Commands::Store {
                action: StoreCommands::Clean { older_than_hours },
            } => assert_eq!(staging_age(older_than_hours), Duration::from_secs(u64::MAX)),
            _ => panic!("expected store clean"),
        }
    }
}
