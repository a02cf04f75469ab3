//! `cargo`-backed toolchain
//!
//! Each operation runs `cargo` child processes with captured output.
//! Operations that consume the dependency artifact first copy its
//! `target/` directory into the private work directory, so the shared
//! artifact is never written to.
//!
//! A dependency artifact holds only third-party units: the placeholder
//! units of the package's own crates are cleaned out before publication,
//! otherwise their fingerprints would mark the real sources as fresh.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{ToolOutput, Toolchain, ToolchainError, ToolchainIdentity};
use crate::cancel::{CancellationToken, Cancelled};
use crate::config::ToolchainSettings;

/// Directory name of the compiled dependency closure inside an artifact
const TARGET_DIR: &str = "target";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Compilations that fill a dependency artifact: check-mode metadata for
/// clippy and rustdoc (dev-dependencies included), release objects for
/// install, and test harness dependencies.
const DEPENDENCY_STEPS: &[&[&str]] = &[
    &["check", "--release", "--locked", "--all-targets"],
    &["build", "--release", "--locked"],
    &["test", "--release", "--locked", "--no-run"],
];

/// Drives `cargo` subprocesses
#[derive(Debug, Clone)]
pub struct CargoToolchain {
    cargo: String,
    identity: ToolchainIdentity,
    lint_args: Vec<String>,
    doc_args: Vec<String>,
    termination_grace: Duration,
}

impl CargoToolchain {
    pub fn new(cargo: &str, identity: ToolchainIdentity) -> Self {
        Self {
            cargo: cargo.to_string(),
            identity,
            lint_args: vec!["--all-targets".into(), "--".into(), "--deny".into(), "warnings".into()],
            doc_args: Vec::new(),
            termination_grace: Duration::from_secs(10),
        }
    }

    /// Probe `rustc` and apply the configured arguments
    pub fn from_settings(settings: &ToolchainSettings) -> Result<Self, ToolchainError> {
        let identity = ToolchainIdentity::probe(&settings.rustc)?;
        if let Some(expected) = &settings.release {
            if expected != &identity.release {
                return Err(ToolchainError::Probe(format!(
                    "configured release {} but {} reports {}",
                    expected, settings.rustc, identity.release
                )));
            }
        }

        Ok(Self {
            cargo: settings.cargo.clone(),
            identity,
            lint_args: settings.lint_args.clone(),
            doc_args: settings.doc_args.clone(),
            termination_grace: Duration::from_secs(settings.termination_grace_seconds),
        })
    }

    /// Copy a dependency artifact's compiled closure into `workdir/target`
    fn inherit_dependencies(&self, deps: &Path, workdir: &Path) -> Result<PathBuf, ToolchainError> {
        let target = workdir.join(TARGET_DIR);
        let source = deps.join(TARGET_DIR);
        if source.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            fs::create_dir_all(&target)?;
        }
        Ok(target)
    }

    fn run_cargo(
        &self,
        args: &[&str],
        extra_args: &[String],
        workdir: &Path,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError> {
        cancel.check()?;
        debug!(cargo = %self.cargo, ?args, workdir = %workdir.display(), "running cargo");

        let mut child = Command::new(&self.cargo)
            .args(args)
            .args(extra_args)
            .current_dir(workdir)
            .env("CARGO_TARGET_DIR", target_dir)
            .env("CARGO_TERM_COLOR", "never")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolchainError::Spawn {
                program: self.cargo.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(capture);
        let stderr = child.stderr.take().map(capture);

        let status = loop {
            if cancel.is_cancelled() {
                self.terminate_child(&mut child)?;
                return Err(ToolchainError::Cancelled(Cancelled));
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let mut diagnostics = String::new();
        for handle in [stdout, stderr].into_iter().flatten() {
            if let Ok(text) = handle.join() {
                diagnostics.push_str(&text);
            }
        }

        Ok(ToolOutput {
            success: status.success(),
            exit_code: status.code(),
            diagnostics,
        })
    }

    /// Terminate a child process gracefully then forcefully.
    fn terminate_child(&self, child: &mut Child) -> Result<(), ToolchainError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < self.termination_grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(pid = child.id(), "cargo did not exit after SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }
}

fn capture<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        let _ = reader.read_to_end(&mut bytes);
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

impl Toolchain for CargoToolchain {
    fn identity(&self) -> &ToolchainIdentity {
        &self.identity
    }

    fn build_dependencies(
        &self,
        workdir: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError> {
        let target = out.join(TARGET_DIR);
        let mut diagnostics = String::new();
        for step in DEPENDENCY_STEPS {
            let output = self.run_cargo(step, &[], workdir, &target, cancel)?;
            diagnostics.push_str(&output.diagnostics);
            if !output.success {
                return Ok(ToolOutput { diagnostics, ..output });
            }
        }

        let members = workspace_members(workdir)?;
        if !members.is_empty() {
            let mut args = vec!["clean", "--release"];
            for member in &members {
                args.extend(["-p", member.as_str()]);
            }
            let output = self.run_cargo(&args, &[], workdir, &target, cancel)?;
            diagnostics.push_str(&output.diagnostics);
            if !output.success {
                return Ok(ToolOutput { diagnostics, ..output });
            }
            debug!(?members, "removed placeholder units from dependency artifact");
        }

        Ok(ToolOutput::success(diagnostics))
    }

    fn build_package(
        &self,
        workdir: &Path,
        deps: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError> {
        let target = self.inherit_dependencies(deps, workdir)?;
        let root = out.to_string_lossy().into_owned();
        self.run_cargo(
            &["install", "--locked", "--path", ".", "--root", &root],
            &[],
            workdir,
            &target,
            cancel,
        )
    }

    fn lint(&self, workdir: &Path, deps: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError> {
        let target = self.inherit_dependencies(deps, workdir)?;
        self.run_cargo(&["clippy", "--release", "--locked"], &self.lint_args, workdir, &target, cancel)
    }

    fn document(&self, workdir: &Path, deps: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError> {
        let target = self.inherit_dependencies(deps, workdir)?;
        self.run_cargo(&["doc", "--release", "--locked", "--no-deps"], &self.doc_args, workdir, &target, cancel)
    }

    fn check_format(&self, workdir: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError> {
        let target = workdir.join(TARGET_DIR);
        self.run_cargo(&["fmt", "--check"], &[], workdir, &target, cancel)
    }
}

/// Package names declared by the manifests under `workdir`, sorted
fn workspace_members(workdir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let walker = WalkDir::new(workdir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != OsStr::new(TARGET_DIR));

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_name() != OsStr::new("Cargo.toml") {
            continue;
        }
        let text = fs::read_to_string(entry.path())?;
        let manifest: toml::Table =
            toml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let name = manifest
            .get("package")
            .and_then(|package| package.get("name"))
            .and_then(|name| name.as_str());
        if let Some(name) = name {
            names.push(name.to_string());
        }
    }

    names.sort();
    names.dedup();
    Ok(names)
}

/// Recursively copy `from` into `to`, preserving permissions and
/// modification times (cargo compares fingerprint mtimes)
fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let dest = to.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &dest)?;
            #[cfg(not(unix))]
            fs::copy(entry.path().parent().unwrap_or(from).join(link), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
            let modified = entry.metadata().map_err(io::Error::from)?.modified()?;
            fs::File::options().write(true).open(&dest)?.set_modified(modified)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn toolchain(cargo: &str) -> CargoToolchain {
        CargoToolchain::new(cargo, ToolchainIdentity::new("1.79.0", "x86_64-unknown-linux-gnu"))
    }

    #[test]
    fn test_copy_dir_copies_tree() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        fs::create_dir_all(from.join("release/deps")).unwrap();
        fs::write(from.join("release/deps/libaskama.rlib"), b"rlib").unwrap();
        fs::write(from.join("CACHEDIR.TAG"), b"tag").unwrap();

        let to = temp.path().join("to");
        copy_dir(&from, &to).unwrap();

        assert_eq!(fs::read(to.join("release/deps/libaskama.rlib")).unwrap(), b"rlib");
        assert_eq!(fs::read(to.join("CACHEDIR.TAG")).unwrap(), b"tag");
    }

    #[test]
    fn test_copy_dir_preserves_mtime() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from");
        fs::create_dir_all(from.join(".fingerprint/itoa-1a2b")).unwrap();
        let fingerprint = from.join(".fingerprint/itoa-1a2b/lib-itoa");
        fs::write(&fingerprint, b"5f3c").unwrap();
        let old = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        fs::File::options()
            .write(true)
            .open(&fingerprint)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let to = temp.path().join("to");
        copy_dir(&from, &to).unwrap();

        let copied = fs::metadata(to.join(".fingerprint/itoa-1a2b/lib-itoa")).unwrap();
        assert_eq!(copied.modified().unwrap(), old);
    }

    #[test]
    fn test_workspace_members_reads_every_manifest() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::write(
            root.join("Cargo.toml"),
            "[package]\nname = \"cypher_character_frontend\"\nversion = \"0.1.0\"\n\n[workspace]\nmembers = [\"model\"]\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("model")).unwrap();
        fs::write(
            root.join("model/Cargo.toml"),
            "[package]\nname = \"cypher_character_model\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();
        fs::create_dir_all(root.join("target/package/vendored-0.1.0")).unwrap();
        fs::write(
            root.join("target/package/vendored-0.1.0/Cargo.toml"),
            "[package]\nname = \"vendored\"\nversion = \"0.1.0\"\n",
        )
        .unwrap();

        assert_eq!(
            workspace_members(root).unwrap(),
            vec!["cypher_character_frontend", "cypher_character_model"]
        );
    }

    #[test]
    fn test_virtual_manifest_has_no_member_name() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("Cargo.toml"), "[workspace]\nmembers = []\n").unwrap();
        assert!(workspace_members(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_dependency_steps_cover_every_consumer() {
        let step = |cmd: &str| DEPENDENCY_STEPS.iter().find(|s| s[0] == cmd).copied();

        let check = step("check").unwrap();
        assert!(check.contains(&"--all-targets"));
        assert!(check.contains(&"--release"));
        assert!(step("build").unwrap().contains(&"--release"));
        assert!(step("test").unwrap().contains(&"--no-run"));
        assert!(DEPENDENCY_STEPS.iter().all(|s| s.contains(&"--locked")));
    }

    #[test]
    fn test_inherit_dependencies_leaves_artifact_untouched() {
        let temp = TempDir::new().unwrap();
        let deps = temp.path().join("deps");
        fs::create_dir_all(deps.join("target/release")).unwrap();
        fs::write(deps.join("target/release/libserde.rlib"), b"serde").unwrap();

        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let target = toolchain("cargo").inherit_dependencies(&deps, &work).unwrap();
        fs::write(target.join("release/libserde.rlib"), b"overwritten").unwrap();

        assert_eq!(fs::read(deps.join("target/release/libserde.rlib")).unwrap(), b"serde");
    }

    #[test]
    fn test_inherit_without_target_creates_empty_dir() {
        let temp = TempDir::new().unwrap();
        let target = toolchain("cargo")
            .inherit_dependencies(&temp.path().join("empty"), temp.path())
            .unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_missing_cargo_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let err = toolchain("/nonexistent/cargo")
            .check_format(temp.path(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ToolchainError::Spawn { .. }));
    }

    #[test]
    fn test_cancelled_before_spawn() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = toolchain("cargo").check_format(temp.path(), &cancel).unwrap_err();
        assert!(matches!(err, ToolchainError::Cancelled(_)));
    }

    #[test]
    fn test_default_lint_args_deny_warnings() {
        let tc = toolchain("cargo");
        assert_eq!(tc.lint_args, vec!["--all-targets", "--", "--deny", "warnings"]);
    }
}
