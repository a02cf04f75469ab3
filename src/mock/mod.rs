//! Scripted toolchain for tests
//!
//! `ScriptedToolchain` implements `Toolchain` without running a compiler.
//! It inspects the materialized work directory and fails the way the real
//! tools would on a few recognizable problems:
//!
//! - dependencies: a locked package marked unresolvable
//! - build, lint, doc: unbalanced delimiters in a `.rs` file
//! - lint: `todo!()` left in a `.rs` file
//! - format: trailing whitespace or tab indentation in a `.rs` file
//!
//! Every operation is counted, and failures or delays can be injected per
//! operation.

mod failure;

pub use failure::{FailureConfig, FailureInjector, Operation};

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::deps::parse_lock_file;
use crate::source::{LOCK_FILE, MANIFEST_FILE};
use crate::toolchain::{ToolOutput, Toolchain, ToolchainError, ToolchainIdentity};

const EXIT_COMPILE_ERROR: i32 = 101;
const EXIT_FORMAT_DIFF: i32 = 1;

/// Snapshot of the invocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invocations {
    pub dependency_builds: usize,
    pub package_builds: usize,
    pub lints: usize,
    pub docs: usize,
    pub format_checks: usize,
}

#[derive(Debug, Default)]
struct Counters {
    dependency_builds: AtomicUsize,
    package_builds: AtomicUsize,
    lints: AtomicUsize,
    docs: AtomicUsize,
    format_checks: AtomicUsize,
}

impl Counters {
    fn bump(&self, op: Operation) {
        let counter = match op {
            Operation::Dependencies => &self.dependency_builds,
            Operation::Package => &self.package_builds,
            Operation::Lint => &self.lints,
            Operation::Doc => &self.docs,
            Operation::Format => &self.format_checks,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ScriptedToolchain {
    identity: ToolchainIdentity,
    unresolvable: BTreeSet<String>,
    failures: Mutex<FailureInjector>,
    counters: Counters,
}

impl Default for ScriptedToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedToolchain {
    pub fn new() -> Self {
        Self::with_identity(ToolchainIdentity::new("1.79.0", "x86_64-unknown-linux-gnu"))
    }

    pub fn with_identity(identity: ToolchainIdentity) -> Self {
        Self {
            identity,
            unresolvable: BTreeSet::new(),
            failures: Mutex::new(FailureInjector::new()),
            counters: Counters::default(),
        }
    }

    /// Fail dependency resolution whenever the lock file names `package`
    pub fn with_unresolvable(mut self, package: &str) -> Self {
        self.unresolvable.insert(package.to_string());
        self
    }

    pub fn inject(&self, op: Operation, config: FailureConfig) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.inject(op, config);
        }
    }

    pub fn invocations(&self) -> Invocations {
        let load = |c: &AtomicUsize| c.load(Ordering::SeqCst);
        Invocations {
            dependency_builds: load(&self.counters.dependency_builds),
            package_builds: load(&self.counters.package_builds),
            lints: load(&self.counters.lints),
            docs: load(&self.counters.docs),
            format_checks: load(&self.counters.format_checks),
        }
    }

    /// Count the call and apply any injected delay or failure
    fn begin(&self, op: Operation, cancel: &CancellationToken) -> Result<Option<ToolOutput>, ToolchainError> {
        self.counters.bump(op);
        cancel.check()?;

        let injected = self.failures.lock().ok().and_then(|mut f| f.check(op));
        let Some(config) = injected else {
            return Ok(None);
        };

        if let Some(delay) = config.delay {
            let start = Instant::now();
            while start.elapsed() < delay {
                cancel.check()?;
                thread::sleep(Duration::from_millis(5));
            }
        }
        Ok(config
            .exit_code
            .map(|code| ToolOutput::failure(code, config.message.unwrap_or_default())))
    }
}

/// Dependency artifact must carry the compiled closure
fn require_deps(deps: &Path) -> Option<ToolOutput> {
    if deps.join("target").is_dir() {
        None
    } else {
        Some(ToolOutput::failure(
            EXIT_COMPILE_ERROR,
            format!("error[E0463]: can't find crate: no compiled dependencies in {}", deps.display()),
        ))
    }
}

/// `.rs` files under `workdir` as (relative path, contents), sorted
fn rust_sources(workdir: &Path) -> Result<Vec<(String, String)>, ToolchainError> {
    let mut sources = Vec::new();
    let walker = WalkDir::new(workdir)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|e| e.file_name() != "target");
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || entry.path().extension().map_or(true, |ext| ext != "rs") {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(workdir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let contents = fs::read_to_string(entry.path())?;
        sources.push((rel, contents));
    }
    Ok(sources)
}

/// First unbalanced delimiter, as (line, message)
fn check_delimiters(source: &str) -> Option<(usize, String)> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => line += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    } else if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
            }
            '\'' => {
                // Char literal ('x' or '\n'); anything else is a lifetime
                if chars.get(i + 1) == Some(&'\\') {
                    let rest = chars.get(i + 3..).unwrap_or_default();
                    if let Some(end) = rest.iter().take(8).position(|&ch| ch == '\'') {
                        i += end + 3;
                    }
                } else if chars.get(i + 2) == Some(&'\'') {
                    i += 2;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Some((
                            line,
                            format!("mismatched closing delimiter: `{c}` (unclosed `{open}` on line {open_line})"),
                        ));
                    }
                    None => return Some((line, format!("unexpected closing delimiter: `{c}`"))),
                }
            }
            _ => {}
        }
        i += 1;
    }

    stack
        .pop()
        .map(|(open, open_line)| (open_line, format!("this file contains an unclosed delimiter `{open}`")))
}

fn compile_errors(sources: &[(String, String)]) -> Option<ToolOutput> {
    let errors: Vec<String> = sources
        .iter()
        .filter_map(|(path, contents)| {
            check_delimiters(contents).map(|(line, message)| format!("error: {message}\n --> {path}:{line}"))
        })
        .collect();
    if errors.is_empty() {
        None
    } else {
        Some(ToolOutput::failure(
            EXIT_COMPILE_ERROR,
            format!("{}\nerror: could not compile due to {} previous errors", errors.join("\n"), errors.len()),
        ))
    }
}

fn package_name(workdir: &Path) -> String {
    fs::read_to_string(workdir.join(MANIFEST_FILE))
        .ok()
        .and_then(|text| text.parse::<toml::Table>().ok())
        .and_then(|manifest| {
            manifest
                .get("package")
                .and_then(|p| p.get("name"))
                .and_then(|n| n.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "app".to_string())
}

impl Toolchain for ScriptedToolchain {
    fn identity(&self) -> &ToolchainIdentity {
        &self.identity
    }

    fn build_dependencies(
        &self,
        workdir: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError> {
        if let Some(output) = self.begin(Operation::Dependencies, cancel)? {
            return Ok(output);
        }

        let lock = match fs::read(workdir.join(LOCK_FILE)) {
            Ok(lock) => lock,
            Err(_) => {
                return Ok(ToolOutput::failure(
                    EXIT_COMPILE_ERROR,
                    "error: the lock file needs to be updated but --locked was passed",
                ))
            }
        };
        let closure = match parse_lock_file(&lock) {
            Ok(closure) => closure,
            Err(message) => return Ok(ToolOutput::failure(EXIT_COMPILE_ERROR, format!("error: {message}"))),
        };

        if let Some(missing) = closure.iter().find(|p| self.unresolvable.contains(&p.name)) {
            return Ok(ToolOutput::failure(
                EXIT_COMPILE_ERROR,
                format!(
                    "error: failed to select a version for the requirement `{} = \"={}\"`",
                    missing.name, missing.version
                ),
            ));
        }

        let deps_dir: PathBuf = out.join("target").join("release").join("deps");
        fs::create_dir_all(&deps_dir)?;
        for package in &closure {
            fs::write(
                deps_dir.join(format!("lib{}-{}.rlib", package.name, package.version)),
                package.spec(),
            )?;
        }
        Ok(ToolOutput::success(format!("Compiled {} packages", closure.len())))
    }

    fn build_package(
        &self,
        workdir: &Path,
        deps: &Path,
        out: &Path,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, ToolchainError> {
        if let Some(output) = self.begin(Operation::Package, cancel)? {
            return Ok(output);
        }
        if let Some(output) = require_deps(deps) {
            return Ok(output);
        }

        let sources = rust_sources(workdir)?;
        if let Some(output) = compile_errors(&sources) {
            return Ok(output);
        }

        let bin = out.join("bin");
        fs::create_dir_all(&bin)?;
        fs::write(bin.join(package_name(workdir)), format!("compiled {} files\n", sources.len()))?;
        Ok(ToolOutput::success(format!("Installed package from {} files", sources.len())))
    }

    fn lint(&self, workdir: &Path, deps: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError> {
        if let Some(output) = self.begin(Operation::Lint, cancel)? {
            return Ok(output);
        }
        if let Some(output) = require_deps(deps) {
            return Ok(output);
        }

        let sources = rust_sources(workdir)?;
        if let Some(output) = compile_errors(&sources) {
            return Ok(output);
        }

        let findings: Vec<String> = sources
            .iter()
            .flat_map(|(path, contents)| {
                contents
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| line.contains("todo!("))
                    .map(move |(n, _)| format!("error: `todo` should not be present\n --> {path}:{}", n + 1))
            })
            .collect();
        if findings.is_empty() {
            Ok(ToolOutput::success("no lint findings"))
        } else {
            Ok(ToolOutput::failure(EXIT_COMPILE_ERROR, findings.join("\n")))
        }
    }

    fn document(&self, workdir: &Path, deps: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError> {
        if let Some(output) = self.begin(Operation::Doc, cancel)? {
            return Ok(output);
        }
        if let Some(output) = require_deps(deps) {
            return Ok(output);
        }

        let sources = rust_sources(workdir)?;
        Ok(compile_errors(&sources).unwrap_or_else(|| ToolOutput::success("Generated documentation")))
    }

    fn check_format(&self, workdir: &Path, cancel: &CancellationToken) -> Result<ToolOutput, ToolchainError> {
        if let Some(output) = self.begin(Operation::Format, cancel)? {
            return Ok(output);
        }

        let diffs: Vec<String> = rust_sources(workdir)?
            .iter()
            .flat_map(|(path, contents)| {
                contents
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| line.ends_with(' ') || line.ends_with('\t') || line.starts_with('\t'))
                    .map(move |(n, _)| format!("Diff in {path} at line {}", n + 1))
            })
            .collect();
        if diffs.is_empty() {
            Ok(ToolOutput::success(""))
        } else {
            Ok(ToolOutput::failure(EXIT_FORMAT_DIFF, diffs.join("\n")))
        }
    }
}
