//! Logger for runs without a terminal: scheduled and remotely triggered
//! backups.

use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::{progress_due, LogLevel, Logger, ProgressCounter, ProgressReporter, StepOutcome};

const LIVE_CHANNEL_CAPACITY: usize = 256;

/// One line pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: String,
    pub operation: String,
    pub message: String,
}

struct Shared {
    site: String,
    operation: String,
    lines: Mutex<Vec<String>>,
    events: Mutex<Vec<String>>,
    warnings: AtomicUsize,
    errors: AtomicUsize,
    live: broadcast::Sender<LogLine>,
}

impl Shared {
    fn publish(&self, message: &str) -> String {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        // No subscribers is fine.
        let _ = self.live.send(LogLine {
            timestamp: timestamp.clone(),
            operation: self.operation.clone(),
            message: message.to_string(),
        });
        timestamp
    }

    fn record(&self, message: &str, level: LogLevel) {
        let timestamp = self.publish(message);
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("[{}] {}", timestamp, message));

        match level {
            LogLevel::Info => info!(site = %self.site, operation = %self.operation, "{}", message),
            LogLevel::Warning => {
                self.warnings.fetch_add(1, Ordering::Relaxed);
                warn!(site = %self.site, operation = %self.operation, "{}", message)
            }
            LogLevel::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(site = %self.site, operation = %self.operation, "{}", message)
            }
        }
    }
}

/// Collects timestamped lines for the end-of-run notification and mirrors
/// them to `tracing` and to live subscribers.
#[derive(Clone)]
pub struct HeadlessLogger {
    shared: Arc<Shared>,
}

impl HeadlessLogger {
    pub fn new(site: &str, operation: &str) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                site: site.to_string(),
                operation: operation.to_string(),
                lines: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                warnings: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                live,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.shared.live.subscribe()
    }

    pub fn events(&self) -> Vec<String> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn warning_count(&self) -> usize {
        self.shared.warnings.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.shared.errors.load(Ordering::Relaxed)
    }
}

impl Logger for HeadlessLogger {
    fn log(&self, message: &str, level: LogLevel) {
        self.shared.record(message, level);
    }

    fn log_event(&self, event: &str) {
        self.shared.publish(event);
        self.shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.to_string());
        info!(site = %self.shared.site, event, "Operation event");
    }

    fn step_started(&self, message: &str, with_progress: bool) -> Option<Arc<dyn ProgressReporter>> {
        self.shared.record(message, LogLevel::Info);
        if !with_progress {
            return None;
        }
        Some(Arc::new(HeadlessProgress {
            shared: Arc::clone(&self.shared),
            step: message.to_string(),
            counter: ProgressCounter::default(),
        }))
    }

    fn step_finished(&self, message: &str, outcome: StepOutcome) {
        if outcome == StepOutcome::Failed {
            self.shared
                .record(&format!("{} failed", message), LogLevel::Error);
        }
    }

    fn logs(&self) -> Vec<String> {
        self.shared
            .lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct HeadlessProgress {
    shared: Arc<Shared>,
    step: String,
    counter: ProgressCounter,
}

impl ProgressReporter for HeadlessProgress {
    fn start(&self, max: u64) {
        self.counter.start(max);
        self.shared
            .record(&format!("{} | 0 / {}", self.step, max), LogLevel::Info);
    }

    fn increment(&self) {
        let (current, max) = self.counter.increment();
        if progress_due(current, max) {
            self.shared.record(
                &format!("{} | {} / {}", self.step, current, max),
                LogLevel::Info,
            );
        }
    }

    fn log(&self, message: &str) {
        self.shared.record(message, LogLevel::Warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_timestamped_and_counted() {
        let logger = HeadlessLogger::new("default", "backup");
        logger.info("Starting backup...");
        logger.warn("2 uploads missing");
        logger.error("Backup failed!");

        let logs = logger.logs();
        assert_eq!(logs.len(), 3);
        assert!(logs[0].starts_with('['));
        assert!(logs[0].ends_with("] Starting backup..."));
        assert_eq!(logger.warning_count(), 1);
        assert_eq!(logger.error_count(), 1);
    }

    #[test]
    fn test_events_are_not_saved_as_lines() {
        let logger = HeadlessLogger::new("default", "backup");
        logger.log_event("[SUCCESS]");

        assert_eq!(logger.events(), vec!["[SUCCESS]"]);
        assert!(logger.logs().is_empty());
    }

    #[tokio::test]
    async fn test_live_subscribers_receive_lines() {
        let logger = HeadlessLogger::new("default", "backup");
        let mut rx = logger.subscribe();

        logger.info("Dumping database");
        logger.log_event("[STARTED]");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message, "Dumping database");
        assert_eq!(first.operation, "backup");
        assert_eq!(rx.recv().await.unwrap().message, "[STARTED]");
    }

    #[test]
    fn test_progress_is_logged_periodically() {
        let logger = HeadlessLogger::new("default", "backup");
        let progress = logger.step_started("Archiving uploads", true).unwrap();
        progress.start(120);
        for _ in 0..120 {
            progress.increment();
        }

        let progress_lines: Vec<_> = logger
            .logs()
            .into_iter()
            .filter(|line| line.contains("Archiving uploads |"))
            .collect();
        // 0, 50, 100, 120
        assert_eq!(progress_lines.len(), 4);
        assert!(progress_lines[3].ends_with("120 / 120"));
    }
}
