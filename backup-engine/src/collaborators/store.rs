//! Filesystem backup stores.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

use crate::backup::BackupStore;
use crate::config::{Config, StoreKind};
use crate::utils::{EngineError, Result};

/// A stored archive as shown in listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub filename: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Archives in one directory, newest first, with a resettable cache.
struct ArchiveDirectory {
    dir: PathBuf,
    max_backups: usize,
    cache: Mutex<Option<Vec<BackupFile>>>,
}

impl ArchiveDirectory {
    fn new(dir: PathBuf, max_backups: usize) -> Self {
        Self {
            dir,
            max_backups,
            cache: Mutex::new(None),
        }
    }

    async fn list(&self) -> std::io::Result<Vec<BackupFile>> {
        if let Some(files) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(files);
        }

        let dir = self.dir.clone();
        let files = tokio::task::spawn_blocking(move || scan_archives(&dir))
            .await
            .map_err(std::io::Error::other)??;

        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(files.clone());
        Ok(files)
    }

    fn reset(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Remove everything beyond the newest `max_backups` archives.
    async fn prune(&self) -> std::io::Result<()> {
        self.reset();
        let files = self.list().await?;

        for old in files.iter().skip(self.max_backups) {
            tokio::fs::remove_file(self.dir.join(&old.filename)).await?;
            info!("Removed old backup: {}", old.filename);
        }
        self.reset();
        Ok(())
    }
}

fn scan_archives(dir: &Path) -> std::io::Result<Vec<BackupFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files: Vec<BackupFile> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tar"))
        .filter_map(|e| {
            let metadata = e.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some(BackupFile {
                filename: e.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                last_modified: metadata.modified().ok()?.into(),
            })
        })
        .collect();

    files.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    Ok(files)
}

/// Archives stay where the run wrote them.
pub struct LocalBackupStore {
    archives: ArchiveDirectory,
}

impl LocalBackupStore {
    pub fn new(dir: PathBuf, max_backups: usize) -> Self {
        Self {
            archives: ArchiveDirectory::new(dir, max_backups),
        }
    }

    pub async fn list_backups(&self) -> std::io::Result<Vec<BackupFile>> {
        self.archives.list().await
    }
}

#[async_trait]
impl BackupStore for LocalBackupStore {
    fn is_remote(&self) -> bool {
        false
    }

    fn location_name(&self) -> String {
        self.archives.dir.display().to_string()
    }

    async fn upload_file(&self, _name: &str, _path: &Path, _content_type: &str) -> anyhow::Result<()> {
        anyhow::bail!("local backup store does not accept uploads")
    }

    async fn delete_old(&self) -> anyhow::Result<()> {
        self.archives
            .prune()
            .await
            .with_context(|| format!("failed to prune {}", self.archives.dir.display()))
    }

    async fn reset_cache(&self) -> anyhow::Result<()> {
        self.archives.reset();
        Ok(())
    }
}

/// Remote-style store: finished archives are copied to a second directory
/// (a mounted share, typically) and the local copy is dropped.
pub struct MirrorBackupStore {
    archives: ArchiveDirectory,
}

impl MirrorBackupStore {
    pub fn new(dir: PathBuf, max_backups: usize) -> Self {
        Self {
            archives: ArchiveDirectory::new(dir, max_backups),
        }
    }

    pub async fn list_backups(&self) -> std::io::Result<Vec<BackupFile>> {
        self.archives.list().await
    }
}

#[async_trait]
impl BackupStore for MirrorBackupStore {
    fn is_remote(&self) -> bool {
        true
    }

    fn location_name(&self) -> String {
        format!("mirror {}", self.archives.dir.display())
    }

    async fn upload_file(&self, name: &str, path: &Path, _content_type: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.archives.dir).await?;
        let target = self.archives.dir.join(name);
        if tokio::fs::try_exists(&target).await? {
            anyhow::bail!("{} already exists in the mirror", name);
        }

        // Copy under a temporary name so a partial file is never listed.
        let partial = self.archives.dir.join(format!(".{}.partial", name));
        tokio::fs::copy(path, &partial)
            .await
            .with_context(|| format!("failed to copy {} to the mirror", path.display()))?;
        tokio::fs::rename(&partial, &target).await?;

        self.archives.reset();
        info!("Uploaded {} to {}", name, self.archives.dir.display());
        Ok(())
    }

    async fn delete_old(&self) -> anyhow::Result<()> {
        self.archives
            .prune()
            .await
            .with_context(|| format!("failed to prune {}", self.archives.dir.display()))
    }

    async fn reset_cache(&self) -> anyhow::Result<()> {
        self.archives.reset();
        Ok(())
    }
}

/// Listing access shared by both store kinds.
pub enum ConfiguredStore {
    Local(LocalBackupStore),
    Mirror(MirrorBackupStore),
}

impl ConfiguredStore {
    /// Store described by `[store]`; archives are kept per site.
    pub fn from_config(config: &Config) -> Result<Self> {
        let site = &config.site.name;
        let max_backups = config.backup.max_backups;
        match config.store.kind {
            StoreKind::Local => Ok(ConfiguredStore::Local(LocalBackupStore::new(
                config.backup.archive_dir.join(site),
                max_backups,
            ))),
            StoreKind::Mirror => {
                let dir = config
                    .store
                    .mirror_dir
                    .as_ref()
                    .ok_or_else(|| EngineError::Config("store.mirror_dir is required".into()))?;
                Ok(ConfiguredStore::Mirror(MirrorBackupStore::new(
                    dir.join(site),
                    max_backups,
                )))
            }
        }
    }

    pub async fn list_backups(&self) -> std::io::Result<Vec<BackupFile>> {
        match self {
            ConfiguredStore::Local(store) => store.list_backups().await,
            ConfiguredStore::Mirror(store) => store.list_backups().await,
        }
    }

    pub fn into_store(self) -> std::sync::Arc<dyn BackupStore> {
        match self {
            ConfiguredStore::Local(store) => std::sync::Arc::new(store),
            ConfiguredStore::Mirror(store) => std::sync::Arc::new(store),
        }
    }
}
