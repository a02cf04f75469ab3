//! Failure injection for the scripted toolchain

use std::collections::HashMap;
use std::time::Duration;

/// Toolchain operations that can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Dependencies,
    Package,
    Lint,
    Doc,
    Format,
}

/// Failure configuration for an operation
#[derive(Debug, Clone, Default)]
pub struct FailureConfig {
    /// Exit code to report (if any)
    pub exit_code: Option<i32>,
    /// Diagnostics to report with the exit code
    pub message: Option<String>,
    /// Delay before the operation runs; cancellation is honored while waiting
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    pub fn error(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn delay(duration: Duration) -> Self {
        Self {
            delay: Some(duration),
            ..Self::default()
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }
}

#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<Operation, FailureConfig>,
    call_counts: HashMap<Operation, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, op: Operation, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    pub fn inject_error(&mut self, op: Operation, exit_code: i32, message: impl Into<String>) {
        self.inject(op, FailureConfig::error(exit_code, message));
    }

    pub fn inject_delay(&mut self, op: Operation, delay: Duration) {
        self.inject(op, FailureConfig::delay(delay));
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    /// The failure to apply to this call of `op`, if any
    pub fn check(&mut self, op: Operation) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?;
        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;

        match config.fail_count {
            Some(limit) if *count > limit => None,
            _ => Some(config.clone()),
        }
    }
}
