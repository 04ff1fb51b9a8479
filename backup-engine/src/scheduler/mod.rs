//! Deferred job scheduler.
//!
//! Fire-and-forget jobs are queued FIFO and executed by a single background
//! worker that is spawned lazily on first enqueue. A job that runs longer
//! than the configured timeout is reported but never interrupted: jobs may
//! hold external resources that must not be abandoned half way.

pub mod stats;

pub use stats::{JobStats, StatsTracker};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::config::SchedulerConfig;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_SITE: &str = "default";

type JobFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// One queued unit of work. Lives only in memory.
pub struct JobDescriptor {
    pub description: Option<String>,
    pub target_site: String,
    job: JobFn,
}

impl JobDescriptor {
    pub fn new<F, Fut>(description: Option<&str>, target_site: &str, job: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            description: description.map(str::to_string),
            target_site: target_site.to_string(),
            job: Box::new(move || job().boxed()),
        }
    }
}

/// A job that returned an error or panicked.
#[derive(Debug)]
pub struct JobFailure {
    pub description: Option<String>,
    pub target_site: String,
    pub error: anyhow::Error,
}

/// Central sink for job failures.
pub type ErrorHandler = Arc<dyn Fn(&JobFailure) + Send + Sync>;

fn log_failure(failure: &JobFailure) {
    error!(
        site = %failure.target_site,
        description = failure.description.as_deref().unwrap_or("-"),
        "Running deferred code failed: {:#}",
        failure.error
    );
}

struct Worker {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Control {
    paused: bool,
    run_async: bool,
    timeout: Duration,
    idle_shutdown: Option<Duration>,
    worker: Option<Worker>,
    /// Worker cancelled by `pause` that may still be running its last job.
    retiring: Option<JoinHandle<()>>,
    spawned: u64,
}

struct Inner {
    queue: Mutex<VecDeque<JobDescriptor>>,
    notify: Notify,
    stats: StatsTracker,
    control: Mutex<Control>,
    error_handler: ErrorHandler,
    default_site: String,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct DeferredScheduler {
    inner: Arc<Inner>,
}

impl Default for DeferredScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SITE)
    }
}

impl DeferredScheduler {
    pub fn new(default_site: impl Into<String>) -> Self {
        Self::with_error_handler(default_site, Arc::new(log_failure))
    }

    pub fn with_error_handler(default_site: impl Into<String>, error_handler: ErrorHandler) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                stats: StatsTracker::default(),
                control: Mutex::new(Control {
                    paused: false,
                    run_async: true,
                    timeout: DEFAULT_TIMEOUT,
                    idle_shutdown: None,
                    worker: None,
                    retiring: None,
                    spawned: 0,
                }),
                error_handler,
                default_site: default_site.into(),
            }),
        }
    }

    pub fn from_config(default_site: impl Into<String>, config: &SchedulerConfig) -> Self {
        let scheduler = Self::new(default_site);
        {
            let mut control = locked(&scheduler.inner.control);
            control.timeout = config.timeout();
            control.run_async = config.run_async;
            control.idle_shutdown = config.idle_shutdown();
        }
        scheduler
    }

    pub fn set_timeout(&self, timeout: Duration) {
        locked(&self.inner.control).timeout = timeout;
    }

    /// With `false`, `enqueue` runs the job inline and bypasses the queue.
    pub fn set_async(&self, run_async: bool) {
        locked(&self.inner.control).run_async = run_async;
    }

    pub fn set_idle_shutdown(&self, idle: Option<Duration>) {
        locked(&self.inner.control).idle_shutdown = idle;
    }

    /// Queue a job for the background worker.
    ///
    /// Only waits for the job itself in non-async mode.
    pub async fn enqueue<F, Fut>(&self, description: Option<&str>, target_site: Option<&str>, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let site = target_site.unwrap_or(&self.inner.default_site);
        let descriptor = JobDescriptor::new(description, site, job);
        self.inner.stats.record_queued(description);

        let run_async = locked(&self.inner.control).run_async;
        if !run_async {
            self.inner.execute(descriptor, false).await;
            return;
        }

        locked(&self.inner.queue).push_back(descriptor);
        self.inner.notify.notify_one();

        let mut control = locked(&self.inner.control);
        if !control.paused {
            Inner::ensure_worker(&self.inner, &mut control);
        }
    }

    /// Stop handing work to the worker. The worker exits after the job it
    /// is currently running; queued and newly enqueued jobs wait for `resume`.
    /// A worker started by `resume` does not pop until that job is done.
    pub fn pause(&self) {
        let mut control = locked(&self.inner.control);
        control.paused = true;
        if let Some(worker) = control.worker.take() {
            worker.token.cancel();
            control.retiring = Some(worker.handle);
        }
    }

    pub fn resume(&self) {
        let mut control = locked(&self.inner.control);
        control.paused = false;
        if !locked(&self.inner.queue).is_empty() {
            Inner::ensure_worker(&self.inner, &mut control);
        }
    }

    pub fn is_paused(&self) -> bool {
        locked(&self.inner.control).paused
    }

    /// Run every queued job on the calling task, without the worker.
    pub async fn drain_synchronously(&self) {
        while let Some(job) = self.inner.pop() {
            self.inner.execute(job, false).await;
        }
    }

    /// Cancel the worker and wait for its in-flight job.
    pub async fn shutdown(&self) {
        let (worker, retiring) = {
            let mut control = locked(&self.inner.control);
            (control.worker.take(), control.retiring.take())
        };
        if let Some(worker) = worker {
            worker.token.cancel();
            join_worker(worker.handle).await;
        }
        if let Some(handle) = retiring {
            join_worker(handle).await;
        }
    }

    pub fn stats(&self) -> Vec<JobStats> {
        self.inner.stats.snapshot()
    }

    pub fn stats_for(&self, description: Option<&str>) -> Option<JobStats> {
        self.inner.stats.get(description)
    }

    /// Number of jobs waiting in the queue.
    pub fn length(&self) -> usize {
        locked(&self.inner.queue).len()
    }

    pub fn is_stopped(&self) -> bool {
        let control = locked(&self.inner.control);
        let worker_done = control
            .worker
            .as_ref()
            .map_or(true, |worker| worker.handle.is_finished());
        let retiring_done = control
            .retiring
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        worker_done && retiring_done
    }
}

async fn join_worker(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!("Deferred worker ended abnormally: {}", e);
    }
}

impl Inner {
    fn pop(&self) -> Option<JobDescriptor> {
        locked(&self.queue).pop_front()
    }

    fn ensure_worker(inner: &Arc<Inner>, control: &mut Control) {
        let alive = control
            .worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished());
        if alive {
            return;
        }

        control.spawned += 1;
        let id = control.spawned;
        let token = CancellationToken::new();
        let predecessor = control.retiring.take();
        let handle = tokio::spawn(Inner::work(inner.clone(), id, token.clone(), predecessor));
        control.worker = Some(Worker { id, token, handle });
        debug!(worker = id, "Deferred worker started");
    }

    async fn work(
        inner: Arc<Inner>,
        id: u64,
        token: CancellationToken,
        predecessor: Option<JoinHandle<()>>,
    ) {
        // One job at a time, even across pause/resume.
        if let Some(previous) = predecessor {
            join_worker(previous).await;
        }

        loop {
            if token.is_cancelled() {
                break;
            }

            if let Some(job) = inner.pop() {
                inner.execute(job, true).await;
                continue;
            }

            let idle = locked(&inner.control).idle_shutdown;
            let idle_sleep = async {
                match idle {
                    Some(idle) => tokio::time::sleep(idle).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = inner.notify.notified() => {}
                _ = idle_sleep => {
                    if inner.retire_if_idle(id) {
                        break;
                    }
                }
            }
        }
        debug!(worker = id, "Deferred worker stopped");
    }

    /// Deregister the worker when nothing is queued. Holding the control
    /// lock across the emptiness check means a concurrent `enqueue` either
    /// sees the job picked up here or spawns a fresh worker.
    fn retire_if_idle(&self, id: u64) -> bool {
        let mut control = locked(&self.control);
        if !locked(&self.queue).is_empty() {
            return false;
        }
        if control.worker.as_ref().is_some_and(|worker| worker.id == id) {
            control.worker = None;
        }
        true
    }

    async fn execute(&self, job: JobDescriptor, watch_timeout: bool) {
        let JobDescriptor {
            description,
            target_site,
            job,
        } = job;
        let label = description.as_deref().unwrap_or("-");
        let span = info_span!("deferred", site = %target_site, description = label);
        let timeout = locked(&self.control).timeout;
        let started = Instant::now();

        let run = AssertUnwindSafe(async move { job().await }).catch_unwind();
        tokio::pin!(run);

        let outcome = async {
            if !watch_timeout {
                return run.await;
            }
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = tokio::time::sleep(timeout) => {
                    error!(
                        "'{}' is still running after {:?} on site {}, this process may need to be restarted!",
                        label, timeout, target_site
                    );
                }
            }
            run.await
        }
        .instrument(span)
        .await;

        let error = match outcome {
            Ok(Ok(())) => {
                self.stats
                    .record_finished(description.as_deref(), started.elapsed());
                return;
            }
            Ok(Err(e)) => e,
            Err(panic) => anyhow::anyhow!("job panicked: {}", panic_message(panic.as_ref())),
        };

        self.stats.record_error(description.as_deref());
        (self.error_handler)(&JobFailure {
            description,
            target_site,
            error,
        });
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
