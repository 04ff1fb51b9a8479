//! Exclusive per-site operation lock.
//!
//! At most one backup or restore may run per site. The running marker
//! lives in a shared [`LockStore`] so every worker process of the site sees
//! it. While an operation holds the lock two watchdog tasks run:
//!
//! - a heartbeat re-arming the marker's TTL, so a crashed holder's marker
//!   expires on its own;
//! - an abort watcher that terminates the process (after a grace period)
//!   once an abort has been requested through [`OperationLock::abort`].

pub mod memory;
pub mod store;

pub use memory::MemoryLockStore;
pub use store::{LockStore, LockStoreError};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LockConfig;
use crate::utils::{EngineError, Result};

pub const RUNNING_KEY: &str = "backup_restore_operation_is_running";
pub const ABORT_KEY: &str = "backup_restore_operation_should_shutdown";

/// Invoked by the abort watcher once the grace period has elapsed.
pub type Terminator = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub ttl: Duration,
    pub heartbeat_interval: Duration,
    pub abort_poll_interval: Duration,
    pub abort_grace: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        (&LockConfig::default()).into()
    }
}

impl From<&LockConfig> for LockSettings {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: config.ttl(),
            heartbeat_interval: config.heartbeat_interval(),
            abort_poll_interval: config.abort_poll_interval(),
            abort_grace: config.abort_grace(),
        }
    }
}

struct Watchdogs {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct LocalState {
    /// Holder token written into the running marker by our `start`
    holder: Option<String>,
    watchdogs: Option<Watchdogs>,
}

pub struct OperationLock {
    store: Arc<dyn LockStore>,
    site: String,
    settings: LockSettings,
    terminator: Terminator,
    local: Mutex<LocalState>,
}

impl OperationLock {
    pub fn new(store: Arc<dyn LockStore>, site: impl Into<String>, settings: LockSettings) -> Self {
        Self {
            store,
            site: site.into(),
            settings,
            terminator: Arc::new(|| std::process::exit(1)),
            local: Mutex::new(LocalState::default()),
        }
    }

    /// Replace the process-exit action of the abort watcher.
    pub fn with_terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    fn running_key(&self) -> String {
        format!("{}:{}", self.site, RUNNING_KEY)
    }

    fn abort_key(&self) -> String {
        format!("{}:{}", self.site, ABORT_KEY)
    }

    /// Mark the operation as running and spawn the heartbeat and abort
    /// watcher. Returns handles to both tasks.
    pub async fn start(&self) -> Result<Vec<AbortHandle>> {
        let mut local = self.local.lock().await;

        let holder = holder_token();
        let running_key = self.running_key();
        let acquired = self
            .store
            .set_if_absent(&running_key, &holder, Some(self.settings.ttl))
            .await?;

        if !acquired {
            return Err(EngineError::OperationAlreadyRunning {
                site: self.site.clone(),
            });
        }

        // Our previous marker expired without `finish`; its watchdogs are stale.
        if let Some(stale) = local.watchdogs.take() {
            warn!(site = %self.site, "Replacing watchdogs of an expired running marker");
            stop_watchdogs(&self.site, stale).await;
        }

        if let Err(e) = self.store.delete(&self.abort_key()).await {
            let _ = self.store.delete_if_eq(&running_key, &holder).await;
            return Err(e.into());
        }

        let token = CancellationToken::new();
        let handles = vec![
            tokio::spawn(heartbeat(
                self.store.clone(),
                running_key,
                self.settings.clone(),
                token.clone(),
            )),
            tokio::spawn(abort_watcher(
                self.store.clone(),
                self.abort_key(),
                self.site.clone(),
                self.settings.clone(),
                self.terminator.clone(),
                token.clone(),
            )),
        ];
        let abort_handles = handles.iter().map(JoinHandle::abort_handle).collect();

        info!(site = %self.site, holder = %holder, "Operation lock acquired");
        local.holder = Some(holder);
        local.watchdogs = Some(Watchdogs { token, handles });

        Ok(abort_handles)
    }

    /// Stop the watchdogs and clear the running marker and abort flag.
    /// Safe to call repeatedly and when `start` never succeeded.
    pub async fn finish(&self) -> Result<()> {
        let mut local = self.local.lock().await;

        if let Some(watchdogs) = local.watchdogs.take() {
            stop_watchdogs(&self.site, watchdogs).await;
        }

        if let Some(holder) = local.holder.clone() {
            let released = self
                .store
                .delete_if_eq(&self.running_key(), &holder)
                .await?;
            self.store.delete(&self.abort_key()).await?;
            local.holder = None;

            if released {
                info!(site = %self.site, "Operation lock released");
            } else {
                warn!(site = %self.site, "Running marker was no longer ours when finishing");
            }
        }

        Ok(())
    }

    /// Request the running operation to abort. No-op when nothing runs.
    pub async fn abort(&self) -> Result<()> {
        if !self.is_running().await? {
            debug!(site = %self.site, "Abort requested but no operation is running");
            return Ok(());
        }

        self.store.set(&self.abort_key(), "1", None).await?;
        warn!(site = %self.site, "Abort requested for running operation");
        Ok(())
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.store.get(&self.running_key()).await?.is_some())
    }

    pub async fn should_abort(&self) -> Result<bool> {
        Ok(self.store.get(&self.abort_key()).await?.is_some())
    }

    /// Holder token of the running operation, if any.
    pub async fn holder(&self) -> Result<Option<String>> {
        Ok(self.store.get(&self.running_key()).await?)
    }
}

async fn stop_watchdogs(site: &str, watchdogs: Watchdogs) {
    watchdogs.token.cancel();
    for handle in watchdogs.handles {
        if let Err(e) = handle.await {
            warn!(site = %site, "Lock watchdog ended abnormally: {}", e);
        }
    }
}

fn holder_token() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{}:{}:{}", host, std::process::id(), uuid::Uuid::new_v4())
}

async fn heartbeat(
    store: Arc<dyn LockStore>,
    key: String,
    settings: LockSettings,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(settings.heartbeat_interval);
    // The first tick completes immediately; the marker was just written.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                match store.expire(&key, settings.ttl).await {
                    Ok(true) => debug!(key = %key, "Running marker refreshed"),
                    Ok(false) => warn!(key = %key, "Running marker vanished while operation is still running"),
                    Err(e) => warn!(key = %key, "Failed to refresh running marker: {}", e),
                }
            }
        }
    }
}

async fn abort_watcher(
    store: Arc<dyn LockStore>,
    key: String,
    site: String,
    settings: LockSettings,
    terminator: Terminator,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(settings.abort_poll_interval) => {}
        }

        match store.get(&key).await {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(e) => debug!(key = %key, "Failed to poll abort flag: {}", e),
        }
    }

    warn!(
        site = %site,
        "Abort requested, terminating process in {:?}",
        settings.abort_grace
    );

    tokio::select! {
        _ = token.cancelled() => {
            info!(site = %site, "Operation finished during abort grace period");
            return;
        }
        _ = tokio::time::sleep(settings.abort_grace) => {}
    }

    error!(site = %site, "Terminating process after abort request");
    terminator();
}
