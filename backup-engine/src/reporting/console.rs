//! Logger for interactive runs from a terminal.

use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{progress_due, LogLevel, Logger, ProgressCounter, ProgressReporter, StepOutcome};

const PROGRESS_REDRAW_INTERVAL: Duration = Duration::from_millis(100);

type Sink = Box<dyn Write + Send>;

struct Outputs {
    stdout: Sink,
    logfile: File,
    lines: Vec<String>,
    progress_visible: bool,
}

impl Outputs {
    fn write_line(&mut self, message: &str, level: Option<LogLevel>) {
        self.clear_progress();
        let prefix = match level {
            Some(LogLevel::Info) => " INFO ",
            Some(LogLevel::Warning) => " WARN ",
            Some(LogLevel::Error) => " FAIL ",
            None => "",
        };
        // A broken stdout must not abort the backup.
        let _ = writeln!(self.stdout, "{} {}", prefix, message);
        self.write_logfile(message, level);

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        self.lines.push(format!("[{}] {}", timestamp, message));
    }

    fn write_logfile(&mut self, message: &str, level: Option<LogLevel>) {
        let prefix = match level {
            Some(LogLevel::Info) => "INFO: ",
            Some(LogLevel::Warning) => "WARN: ",
            Some(LogLevel::Error) => "ERROR: ",
            None => "",
        };
        let _ = writeln!(self.logfile, "{}{}", prefix, message);
    }

    fn clear_progress(&mut self) {
        if self.progress_visible {
            let mut stderr = io::stderr();
            let _ = stderr.write_all(b"\r\x1b[2K");
            let _ = stderr.flush();
            self.progress_visible = false;
        }
    }
}

/// Prefixed lines on stdout, a full copy in a logfile, and a redrawn
/// progress line on stderr.
pub struct ConsoleLogger {
    outputs: Arc<Mutex<Outputs>>,
    logfile_path: PathBuf,
}

impl ConsoleLogger {
    /// Open `<log_dir>/<site>/<name>-<timestamp>.log` and log to stdout.
    pub fn create(log_dir: &Path, site: &str, name: &str) -> io::Result<Self> {
        Self::with_output(log_dir, site, name, Box::new(io::stdout()))
    }

    pub fn with_output(log_dir: &Path, site: &str, name: &str, stdout: Sink) -> io::Result<Self> {
        let dir = log_dir.join(site);
        fs::create_dir_all(&dir)?;
        let timestamp = Utc::now().format("%Y-%m-%dT%H%M%SZ");
        let logfile_path = dir.join(format!("{}-{}.log", name, timestamp));
        let logfile = File::create(&logfile_path)?;

        let logger = Self {
            outputs: Arc::new(Mutex::new(Outputs {
                stdout,
                logfile,
                lines: Vec::new(),
                progress_visible: false,
            })),
            logfile_path,
        };

        let notice = format!("Logging to {}", logger.logfile_path.display());
        logger.with_outputs(|outputs| {
            let _ = writeln!(outputs.stdout, " INFO  {}", notice);
        });
        Ok(logger)
    }

    pub fn logfile_path(&self) -> &Path {
        &self.logfile_path
    }

    fn with_outputs<R>(&self, f: impl FnOnce(&mut Outputs) -> R) -> R {
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut outputs)
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, message: &str, level: LogLevel) {
        self.with_outputs(|outputs| outputs.write_line(message, Some(level)));
    }

    fn log_event(&self, event: &str) {
        self.with_outputs(|outputs| outputs.write_logfile(event, None));
    }

    fn step_started(&self, message: &str, with_progress: bool) -> Option<Arc<dyn ProgressReporter>> {
        self.with_outputs(|outputs| outputs.write_line(message, Some(LogLevel::Info)));
        if !with_progress {
            return None;
        }
        Some(Arc::new(ConsoleProgress {
            outputs: Arc::clone(&self.outputs),
            step: message.to_string(),
            counter: ProgressCounter::default(),
            last_draw: Mutex::new(None),
            interactive: io::stderr().is_terminal(),
        }))
    }

    fn step_finished(&self, message: &str, outcome: StepOutcome) {
        let prefix = match outcome {
            StepOutcome::Done => " DONE ",
            StepOutcome::Failed => " FAIL ",
        };
        self.with_outputs(|outputs| {
            outputs.clear_progress();
            let _ = writeln!(outputs.stdout, "{} {}", prefix, message);
            let level = match outcome {
                StepOutcome::Done => LogLevel::Info,
                StepOutcome::Failed => LogLevel::Error,
            };
            outputs.write_logfile(&format!("{} {}", prefix.trim(), message), Some(level));
        });
    }

    fn logs(&self) -> Vec<String> {
        self.with_outputs(|outputs| outputs.lines.clone())
    }
}

struct ConsoleProgress {
    outputs: Arc<Mutex<Outputs>>,
    step: String,
    counter: ProgressCounter,
    last_draw: Mutex<Option<Instant>>,
    interactive: bool,
}

impl ConsoleProgress {
    fn with_outputs<R>(&self, f: impl FnOnce(&mut Outputs) -> R) -> R {
        let mut outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut outputs)
    }

    fn draw(&self, force: bool) {
        if !self.interactive {
            return;
        }
        let mut last_draw = self.last_draw.lock().unwrap_or_else(|e| e.into_inner());
        let due = last_draw.map_or(true, |at| at.elapsed() >= PROGRESS_REDRAW_INTERVAL);
        if !force && !due {
            return;
        }
        *last_draw = Some(Instant::now());

        let (current, max) = self.counter.get();
        let percent = if max > 0 { current * 100 / max } else { 0 };
        self.with_outputs(|outputs| {
            let mut stderr = io::stderr();
            let _ = write!(
                stderr,
                "\r\x1b[2K {:>3}%  {} | {} / {}",
                percent, self.step, current, max
            );
            let _ = stderr.flush();
            outputs.progress_visible = true;
        });
    }
}

impl ProgressReporter for ConsoleProgress {
    fn start(&self, max: u64) {
        self.counter.start(max);
        let line = format!("{} | 0 / {}", self.step, max);
        self.with_outputs(|outputs| outputs.write_logfile(&line, None));
        self.draw(true);
    }

    fn increment(&self) {
        let (current, max) = self.counter.increment();
        if progress_due(current, max) {
            let line = format!("{} | {} / {}", self.step, current, max);
            self.with_outputs(|outputs| outputs.write_logfile(&line, None));
        }
        self.draw(current == max);
    }

    fn log(&self, message: &str) {
        self.with_outputs(|outputs| outputs.write_logfile(message, Some(LogLevel::Warning)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_prefixes_and_logfile() {
        let dir = TempDir::new().unwrap();
        let stdout = Captured::default();
        let logger =
            ConsoleLogger::with_output(dir.path(), "default", "backup", Box::new(stdout.clone()))
                .unwrap();

        logger.info("Dumping database");
        logger.warn("Skipping uploads");
        logger.error("Backup failed!");
        logger.step_finished("Creating archive", StepOutcome::Done);

        let printed = stdout.text();
        assert!(printed.contains(" INFO  Logging to "));
        assert!(printed.contains(" INFO  Dumping database"));
        assert!(printed.contains(" WARN  Skipping uploads"));
        assert!(printed.contains(" FAIL  Backup failed!"));
        assert!(printed.contains(" DONE  Creating archive"));

        let path = logger.logfile_path().to_path_buf();
        assert!(path.starts_with(dir.path().join("default")));
        let logfile = fs::read_to_string(path).unwrap();
        assert!(logfile.contains("INFO: Dumping database"));
        assert!(logfile.contains("WARN: Skipping uploads"));
        assert!(logfile.contains("ERROR: Backup failed!"));
    }

    #[test]
    fn test_events_and_progress_go_to_logfile_only() {
        let dir = TempDir::new().unwrap();
        let stdout = Captured::default();
        let logger =
            ConsoleLogger::with_output(dir.path(), "default", "backup", Box::new(stdout.clone()))
                .unwrap();

        logger.log_event("[SUCCESS]");
        let progress = logger.step_started("Archiving uploads", true).unwrap();
        progress.start(60);
        for _ in 0..60 {
            progress.increment();
        }
        progress.log("Failed to read 42.png");

        assert!(!stdout.text().contains("[SUCCESS]"));
        let logfile = fs::read_to_string(logger.logfile_path()).unwrap();
        assert!(logfile.contains("[SUCCESS]"));
        assert!(logfile.contains("Archiving uploads | 50 / 60"));
        assert!(logfile.contains("Archiving uploads | 60 / 60"));
        assert!(logfile.contains("WARN: Failed to read 42.png"));
        assert_eq!(logger.logs().len(), 1);
    }
}
