//! Interfaces of the services a backup run drives.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWrite;

use super::upload_stats::UploadStats;
use crate::reporting::ProgressReporter;

/// Sink handed to stage collaborators; backed by an archive member.
pub type MemberSink<'a> = dyn AsyncWrite + Unpin + Send + 'a;

/// Per-run resources available to the upload stages.
pub struct StageContext {
    /// Scratch directory, removed during cleanup
    pub work_dir: PathBuf,
    pub progress: Option<Arc<dyn ProgressReporter>>,
}

/// Writes a complete, compressed database dump.
#[async_trait]
pub trait DumpProducer: Send + Sync {
    async fn dump_schema_into(&self, out: &mut MemberSink<'_>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UploadBackuper: Send + Sync {
    fn include_uploads(&self) -> bool;

    fn include_optimized_images(&self) -> bool;

    async fn compress_uploads_into(
        &self,
        out: &mut MemberSink<'_>,
        ctx: &StageContext,
    ) -> anyhow::Result<UploadStats>;

    async fn compress_optimized_images_into(
        &self,
        out: &mut MemberSink<'_>,
        ctx: &StageContext,
    ) -> anyhow::Result<UploadStats>;
}

/// Where finished archives live.
#[async_trait]
pub trait BackupStore: Send + Sync {
    fn is_remote(&self) -> bool;

    /// Human name of the storage location, for the completion message.
    fn location_name(&self) -> String;

    async fn upload_file(&self, name: &str, path: &Path, content_type: &str) -> anyhow::Result<()>;

    /// Apply the retention policy.
    async fn delete_old(&self) -> anyhow::Result<()>;

    async fn reset_cache(&self) -> anyhow::Result<()>;
}

pub const SYSTEM_USER_ID: i64 = -1;

/// The user a run reports back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Initiator {
    pub id: i64,
    pub username: String,
}

impl Initiator {
    pub fn system() -> Self {
        Self {
            id: SYSTEM_USER_ID,
            username: "system".to_string(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.id == SYSTEM_USER_ID
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, initiator: &Initiator, success: bool, logs: &[String]) -> anyhow::Result<()>;
}
