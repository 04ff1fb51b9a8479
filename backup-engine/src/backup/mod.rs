//! Backup orchestration.
//!
//! A run acquires the site's [`OperationLock`], streams the database dump,
//! both upload classes, and the metadata document into one tar archive, then
//! uploads it when the store is remote. Cleanup, user notification, and lock
//! release happen on every exit path, including cancellation.

pub mod collaborators;
pub mod metadata;
pub mod paths;
pub mod upload_stats;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::{ArchiveWriter, MemberAttributes};
use crate::config::{BackupConfig, Config, SiteConfig};
use crate::lock::OperationLock;
use crate::reporting::{log_step, Logger};
use crate::utils::logger::format_bytes;
use crate::utils::{EngineError, Result, Stage};

pub use collaborators::{
    BackupStore, DumpProducer, Initiator, MemberSink, Notifier, StageContext, UploadBackuper,
    SYSTEM_USER_ID,
};
pub use metadata::{MetadataWriter, SiteInfo};
pub use paths::{BackupPaths, PathOverride};
pub use upload_stats::{UploadStats, UploadSummary};

pub const DUMP_FILE: &str = "dump.sql.zst";
pub const UPLOADS_FILE: &str = "uploads.tar.zst";
pub const OPTIMIZED_IMAGES_FILE: &str = "optimized-images.tar.zst";
pub const METADATA_FILE: &str = "meta.json";

const ARCHIVE_CONTENT_TYPE: &str = "application/x-tar";
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Init,
    LockAcquired,
    Dumping,
    Uploading,
    Optimizing,
    Metadata,
    Uploaded,
    Finalized,
    Failed,
    CleanedUp,
    Notified,
    Done,
}

/// Published once a run has produced its archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    Created { site: String, archive_path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRunResult {
    pub success: bool,
    pub archive_path: Option<PathBuf>,
    pub warnings: bool,
}

/// Services a run delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub dumper: Arc<dyn DumpProducer>,
    pub uploads: Arc<dyn UploadBackuper>,
    pub store: Arc<dyn BackupStore>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Default)]
struct RunState {
    success: bool,
    warnings: bool,
    paths: Option<BackupPaths>,
    archive_created: bool,
    uploads: Option<UploadStats>,
    optimized_images: Option<UploadStats>,
    phases: Vec<BackupPhase>,
}

/// Which upload class an optional stage archives.
#[derive(Clone, Copy)]
enum UploadClass {
    Uploads,
    OptimizedImages,
}

impl UploadClass {
    fn member(self) -> &'static str {
        match self {
            UploadClass::Uploads => UPLOADS_FILE,
            UploadClass::OptimizedImages => OPTIMIZED_IMAGES_FILE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            UploadClass::Uploads => "uploads",
            UploadClass::OptimizedImages => "optimized images",
        }
    }

    fn stage(self) -> Stage {
        match self {
            UploadClass::Uploads => Stage::Uploads,
            UploadClass::OptimizedImages => Stage::OptimizedImages,
        }
    }
}

pub struct Backuper {
    site: SiteConfig,
    backup: BackupConfig,
    lock: Arc<OperationLock>,
    logger: Arc<dyn Logger>,
    collaborators: Collaborators,
    initiator: Initiator,
    path_override: Option<PathBuf>,
    cancel: CancellationToken,
    events: broadcast::Sender<BackupEvent>,
    state: RunState,
}

impl Backuper {
    pub fn new(
        config: &Config,
        lock: Arc<OperationLock>,
        logger: Arc<dyn Logger>,
        collaborators: Collaborators,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            site: config.site.clone(),
            backup: config.backup.clone(),
            lock,
            logger,
            collaborators,
            initiator: Initiator::system(),
            path_override: None,
            cancel: CancellationToken::new(),
            events,
            state: RunState::default(),
        }
    }

    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.initiator = initiator;
        self
    }

    pub fn with_path_override(mut self, path: Option<PathBuf>) -> Self {
        self.path_override = path;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<BackupEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    /// Phases the last run went through, in order.
    pub fn phases(&self) -> &[BackupPhase] {
        &self.state.phases
    }

    pub fn success(&self) -> bool {
        self.state.success
    }

    pub fn warnings(&self) -> bool {
        self.state.warnings
    }

    /// Run one backup. Never returns an error: failures are logged,
    /// reported to the initiator, and reflected in the result.
    pub async fn run(&mut self) -> BackupRunResult {
        self.state = RunState::default();
        self.enter(BackupPhase::Init);

        self.logger.log_event("[STARTED]");
        self.logger
            .info(&format!("User '{}' started backup", self.initiator.username));

        // Acquiring the lock is not raced against cancellation, so a marker
        // that reached the store is always recorded and released by `complete`.
        let cancel = self.cancel.clone();
        let outcome = match self.initialize_backup().await {
            Ok(()) => tokio::select! {
                outcome = self.perform() => outcome,
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => self.state.success = true,
            Err(e) if e.is_cancellation() => {
                self.enter(BackupPhase::Failed);
                self.logger.warn("Backup operation was canceled!");
            }
            Err(e) => {
                self.enter(BackupPhase::Failed);
                self.logger.error(&format!("Backup failed: {}", e));
            }
        }

        self.clean_up().await;
        self.notify_user().await;
        self.complete().await;
        self.enter(BackupPhase::Done);

        BackupRunResult {
            success: self.state.success,
            archive_path: self
                .state
                .paths
                .as_ref()
                .filter(|_| self.state.success)
                .map(|paths| paths.archive_path.clone()),
            warnings: self.state.warnings,
        }
    }

    fn enter(&mut self, phase: BackupPhase) {
        debug!(site = %self.site.name, ?phase, "Backup phase");
        self.state.phases.push(phase);
    }

    async fn perform(&mut self) -> Result<()> {
        self.create_backup().await?;
        self.upload_backup().await?;
        self.finalize_backup().await
    }

    /// Cooperative cancellation point between stages.
    async fn check_abort(&self) -> Result<()> {
        if self.cancel.is_cancelled() || self.lock.should_abort().await? {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    async fn initialize_backup(&mut self) -> Result<()> {
        let logger = Arc::clone(&self.logger);
        let lock = Arc::clone(&self.lock);
        let store_is_remote = self.collaborators.store.is_remote();
        let (backup, site) = (&self.backup, &self.site);
        let path_override = self.path_override.as_deref();

        let paths = log_step(self.logger.as_ref(), "Initializing backup", false, |_| async move {
            lock.start().await?;

            let overrides = match path_override {
                Some(raw) => {
                    let (overrides, ignored) = PathOverride::parse(raw, store_is_remote);
                    if ignored {
                        logger.warn("Only local backup storage supports overriding backup path.");
                    }
                    overrides
                }
                None => PathOverride::default(),
            };
            let paths = BackupPaths::resolve(backup, site, &overrides, Utc::now());

            tokio::fs::create_dir_all(&paths.archive_dir).await?;
            tokio::fs::create_dir_all(&paths.work_dir).await?;
            Ok::<_, EngineError>(paths)
        })
        .await?;

        self.enter(BackupPhase::LockAcquired);
        self.state.paths = Some(paths);
        Ok(())
    }

    async fn create_backup(&mut self) -> Result<()> {
        let paths = self
            .state
            .paths
            .clone()
            .ok_or_else(|| EngineError::Archive("backup was not initialized".into()))?;
        let attrs = MemberAttributes::current_process();

        self.check_abort().await?;
        let mut archive = ArchiveWriter::create(&paths.archive_path).await?;
        self.state.archive_created = true;

        self.enter(BackupPhase::Dumping);
        self.add_db_dump(&mut archive, &attrs).await?;

        self.check_abort().await?;
        self.enter(BackupPhase::Uploading);
        let (stats, warned) = self
            .add_upload_class(&mut archive, &attrs, &paths.work_dir, UploadClass::Uploads)
            .await?;
        self.state.uploads = stats;
        self.state.warnings |= warned;

        self.check_abort().await?;
        self.enter(BackupPhase::Optimizing);
        let (stats, warned) = self
            .add_upload_class(
                &mut archive,
                &attrs,
                &paths.work_dir,
                UploadClass::OptimizedImages,
            )
            .await?;
        self.state.optimized_images = stats;
        self.state.warnings |= warned;

        self.check_abort().await?;
        self.enter(BackupPhase::Metadata);
        self.add_metadata(&mut archive, &attrs).await?;

        archive.close().await?;
        Ok(())
    }

    async fn add_db_dump(&self, archive: &mut ArchiveWriter, attrs: &MemberAttributes) -> Result<()> {
        let dumper = Arc::clone(&self.collaborators.dumper);

        log_step(self.logger.as_ref(), "Creating database dump", false, |_| async move {
            let mut body = archive.begin_member(DUMP_FILE, attrs).await?;
            match dumper.dump_schema_into(&mut body).await {
                Ok(()) => {
                    body.finish().await?;
                    Ok(())
                }
                Err(e) => {
                    body.discard().await?;
                    Err(EngineError::stage(Stage::Dump, e))
                }
            }
        })
        .await
    }

    /// Optional stage. Returns the stats (none when skipped or failed) and
    /// whether the stage raised a warning.
    async fn add_upload_class(
        &self,
        archive: &mut ArchiveWriter,
        attrs: &MemberAttributes,
        work_dir: &Path,
        class: UploadClass,
    ) -> Result<(Option<UploadStats>, bool)> {
        let uploads = Arc::clone(&self.collaborators.uploads);
        let included = match class {
            UploadClass::Uploads => uploads.include_uploads(),
            UploadClass::OptimizedImages => uploads.include_optimized_images(),
        };
        if !included {
            self.logger.info(&format!("Skipping {}", class.label()));
            return Ok((None, false));
        }

        let message = format!("Adding {}", class.label());
        let result = log_step(self.logger.as_ref(), &message, true, |progress| async move {
            let ctx = StageContext {
                work_dir: work_dir.to_path_buf(),
                progress,
            };
            let mut body = archive.begin_member(class.member(), attrs).await?;
            let compressed = match class {
                UploadClass::Uploads => uploads.compress_uploads_into(&mut body, &ctx).await,
                UploadClass::OptimizedImages => {
                    uploads.compress_optimized_images_into(&mut body, &ctx).await
                }
            };
            match compressed {
                Ok(stats) => {
                    body.finish().await?;
                    Ok(stats)
                }
                Err(e) => {
                    body.discard().await?;
                    Err(EngineError::stage(class.stage(), e))
                }
            }
        })
        .await;

        match result {
            Ok(stats) => {
                let missing = stats.missing_count();
                if missing > 0 {
                    self.logger.warn(&format!(
                        "Failed to add {} {}. See logfile for details.",
                        missing,
                        class.label()
                    ));
                }
                Ok((Some(stats), missing > 0))
            }
            Err(e @ EngineError::Stage { .. }) => {
                self.logger
                    .warn(&format!("Skipping {}: {}", class.label(), e));
                Ok((None, true))
            }
            Err(e) => Err(e),
        }
    }

    async fn add_metadata(&self, archive: &mut ArchiveWriter, attrs: &MemberAttributes) -> Result<()> {
        let writer = MetadataWriter::new(
            SiteInfo::from(&self.site),
            self.state.uploads.as_ref(),
            self.state.optimized_images.as_ref(),
        );

        log_step(self.logger.as_ref(), "Adding metadata file", false, |_| async move {
            let estimate = writer.estimated_file_size()?;
            let placeholder = archive
                .add_file_placeholder(METADATA_FILE, attrs, estimate)
                .await?;
            let mut body = archive.fill_placeholder(placeholder).await?;
            match writer.write_into(&mut body).await {
                Ok(()) => {
                    body.finish().await?;
                    Ok(())
                }
                Err(e) => {
                    body.discard().await?;
                    Err(EngineError::stage(Stage::Metadata, e))
                }
            }
        })
        .await
    }

    async fn upload_backup(&mut self) -> Result<()> {
        let store = Arc::clone(&self.collaborators.store);
        if !store.is_remote() {
            return Ok(());
        }
        let paths = match &self.state.paths {
            Some(paths) => paths.clone(),
            None => return Ok(()),
        };

        let size = tokio::fs::metadata(&paths.archive_path).await?.len();
        let message = format!("Uploading backup ({})", format_bytes(size));
        log_step(self.logger.as_ref(), &message, false, |_| async move {
            store
                .upload_file(&paths.filename, &paths.archive_path, ARCHIVE_CONTENT_TYPE)
                .await
                .map_err(|e| EngineError::StoreUpload(format!("{:#}", e)))
        })
        .await?;

        self.enter(BackupPhase::Uploaded);
        Ok(())
    }

    async fn finalize_backup(&mut self) -> Result<()> {
        let event = self.state.paths.as_ref().map(|paths| BackupEvent::Created {
            site: self.site.name.clone(),
            archive_path: paths.archive_path.clone(),
        });
        let events = self.events.clone();

        log_step(self.logger.as_ref(), "Finalizing backup", false, |_| async move {
            if let Some(event) = event {
                // Nobody listening is fine.
                let _ = events.send(event);
            }
            Ok::<_, EngineError>(())
        })
        .await?;

        self.enter(BackupPhase::Finalized);
        Ok(())
    }

    /// Best effort; every failure is logged and the rest still runs.
    async fn clean_up(&mut self) {
        let logger = Arc::clone(&self.logger);
        let store = Arc::clone(&self.collaborators.store);
        let paths = self.state.paths.clone();
        // A remote store holds its own copy; a failed run's archive is junk.
        let remove_archive =
            self.state.archive_created && (store.is_remote() || !self.state.success);

        let _ = log_step(self.logger.as_ref(), "Cleaning up", false, |_| async move {
            if let Err(e) = store.delete_old().await {
                logger.warn(&format!("Failed to delete old backups: {:#}", e));
            }

            if let Some(paths) = &paths {
                if remove_archive {
                    remove_file_if_exists(logger.as_ref(), &paths.archive_path).await;
                }
                if let Err(e) = remove_dir_if_exists(&paths.work_dir).await {
                    logger.warn(&format!(
                        "Failed to remove {}: {}",
                        paths.work_dir.display(),
                        e
                    ));
                }
            }

            if let Err(e) = store.reset_cache().await {
                logger.warn(&format!("Failed to reset backup store cache: {:#}", e));
            }
            Ok::<_, EngineError>(())
        })
        .await;

        self.enter(BackupPhase::CleanedUp);
    }

    async fn notify_user(&mut self) {
        if self.state.success && self.initiator.is_system() {
            return;
        }

        let notifier = Arc::clone(&self.collaborators.notifier);
        let logs = self.logger.logs();
        let (initiator, success) = (&self.initiator, self.state.success);

        let result = log_step(self.logger.as_ref(), "Notifying user", false, |_| async move {
            notifier.notify(initiator, success, &logs).await
        })
        .await;
        if let Err(e) = result {
            self.logger
                .warn(&format!("Failed to notify {}: {:#}", initiator.username, e));
        }

        self.enter(BackupPhase::Notified);
    }

    async fn complete(&mut self) {
        if let Err(e) = self.lock.finish().await {
            self.logger
                .error(&format!("Failed to mark operation as finished: {}", e));
        }

        if !self.state.success {
            self.logger.error("Backup failed!");
            self.logger.log_event("[FAILED]");
            return;
        }

        if let Some(paths) = &self.state.paths {
            let store = &self.collaborators.store;
            if store.is_remote() {
                self.logger.info(&format!(
                    "Backup stored on {} as {}",
                    store.location_name(),
                    paths.filename
                ));
            } else {
                self.logger.info(&format!(
                    "Backup stored at: {}",
                    paths.archive_path.display()
                ));
            }
        }

        if self.state.warnings {
            self.logger.warn("Backup completed with warnings!");
        } else {
            self.logger.info("Backup completed successfully!");
        }
        self.logger.log_event("[SUCCESS]");
        info!(site = %self.site.name, warnings = self.state.warnings, "Backup finished");
    }
}

async fn remove_file_if_exists(logger: &dyn Logger, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => logger.warn(&format!("Failed to remove {}: {}", path.display(), e)),
    }
}

async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
