//! Operation logging for backup runs.
//!
//! Separate from process logging: these lines are what the initiating user
//! sees, either live on a console or collected for a notification.

pub mod console;
pub mod headless;

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use console::ConsoleLogger;
pub use headless::HeadlessLogger;

/// Progress is written to the log every this many increments.
pub const PROGRESS_LOG_INTERVAL: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Failed,
}

pub trait ProgressReporter: Send + Sync {
    fn start(&self, max: u64);
    fn increment(&self);
    /// Side-channel message that should not interrupt the progress display.
    fn log(&self, message: &str);
}

pub trait Logger: Send + Sync {
    fn log(&self, message: &str, level: LogLevel);

    /// Machine-readable marker for UI and log scrapers.
    fn log_event(&self, event: &str);

    fn step_started(&self, message: &str, with_progress: bool) -> Option<Arc<dyn ProgressReporter>>;

    fn step_finished(&self, message: &str, outcome: StepOutcome);

    /// Everything logged so far, in order.
    fn logs(&self) -> Vec<String>;

    fn info(&self, message: &str) {
        self.log(message, LogLevel::Info);
    }

    fn warn(&self, message: &str) {
        self.log(message, LogLevel::Warning);
    }

    fn error(&self, message: &str) {
        self.log(message, LogLevel::Error);
    }
}

/// Run `block` as a named step.
///
/// The block receives a progress reporter when `with_progress` is set and the
/// logger supports one. The step is marked failed when the block errors.
pub async fn log_step<T, E, F, Fut>(
    logger: &dyn Logger,
    message: &str,
    with_progress: bool,
    block: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(Option<Arc<dyn ProgressReporter>>) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let progress = logger.step_started(message, with_progress);
    let result = block(progress).await;

    let outcome = if result.is_ok() {
        StepOutcome::Done
    } else {
        StepOutcome::Failed
    };
    logger.step_finished(message, outcome);
    result
}

/// Shared counter behind both progress reporters.
#[derive(Debug, Default)]
pub(crate) struct ProgressCounter {
    max: AtomicU64,
    current: AtomicU64,
}

impl ProgressCounter {
    pub(crate) fn start(&self, max: u64) {
        self.max.store(max, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
    }

    /// Returns `(current, max)` after the increment.
    pub(crate) fn increment(&self) -> (u64, u64) {
        let current = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        (current, self.max.load(Ordering::Relaxed))
    }

    pub(crate) fn get(&self) -> (u64, u64) {
        (
            self.current.load(Ordering::Relaxed),
            self.max.load(Ordering::Relaxed),
        )
    }
}

/// Whether a progress line is due after reaching `current`.
pub(crate) fn progress_due(current: u64, max: u64) -> bool {
    current % PROGRESS_LOG_INTERVAL == 0 || current == max
}
