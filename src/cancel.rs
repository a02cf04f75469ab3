//! Cooperative cancellation
//!
//! A `CancellationToken` is shared by every stage of a pipeline run. Stages
//! check it between steps and the process runner polls it while a compiler
//! child is alive. Cancelling never publishes anything: artifacts are only
//! renamed into the store after their producer returns successfully.
//!
//! On SIGINT/SIGTERM the first signal requests cancellation, the second
//! exits immediately.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Exit code for cancelled runs
pub const EXIT_CODE_CANCELLED: i32 = 80;

/// Returned by `CancellationToken::check` once cancellation was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

#[derive(Debug, Default)]
struct State {
    cancelled: AtomicBool,
    signal_count: AtomicU8,
}

/// Cloneable handle to a shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<State>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record a signal; returns true if this was a repeated signal.
    fn on_signal(&self) -> bool {
        let count = self.state.signal_count.fetch_add(1, Ordering::SeqCst);
        self.cancel();
        count > 0
    }

    /// Route SIGINT/SIGTERM to this token.
    ///
    /// Must be called at most once per process.
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            if token.on_signal() {
                warn!("received second interrupt, exiting immediately");
                std::process::exit(EXIT_CODE_CANCELLED);
            }
            warn!("received interrupt, cancelling in-flight stages");
        })
    }
}
