//! Uploads archived straight from local directories.

use async_compression::tokio::write::ZstdEncoder;
use async_compression::Level;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::archive::{MemberAttributes, TarStreamWriter};
use crate::backup::{MemberSink, StageContext, UploadBackuper, UploadStats};
use crate::config::BackupConfig;
use crate::fs::walker::{walk_directory, UploadFile, WalkOptions};

/// Writes each upload directory as a zstd-compressed tar stream.
pub struct DirectoryUploadBackuper {
    uploads_dir: PathBuf,
    optimized_images_dir: PathBuf,
    include_uploads: bool,
    include_optimized_images: bool,
    compression_level: i32,
    walk_options: WalkOptions,
}

impl DirectoryUploadBackuper {
    pub fn from_config(config: &BackupConfig) -> Self {
        let mut walk_options = WalkOptions::default();
        // Optimized images are archived separately even when nested inside
        // the uploads directory.
        if let Ok(nested) = config.optimized_images_dir.strip_prefix(&config.uploads_dir) {
            if let Some(first) = nested.components().next() {
                walk_options
                    .exclude_names
                    .push(first.as_os_str().to_string_lossy().into_owned());
            }
        }

        Self {
            uploads_dir: config.uploads_dir.clone(),
            optimized_images_dir: config.optimized_images_dir.clone(),
            include_uploads: config.include_uploads,
            include_optimized_images: config.include_optimized_images,
            compression_level: config.compression_level,
            walk_options,
        }
    }

    async fn archive_directory(
        &self,
        root: &Path,
        out: &mut MemberSink<'_>,
        ctx: &StageContext,
    ) -> anyhow::Result<UploadStats> {
        let root_owned = root.to_path_buf();
        let options = self.walk_options.clone();
        let walk = tokio::task::spawn_blocking(move || walk_directory(&root_owned, &options)).await?;

        let total = (walk.files.len() + walk.unreadable.len()) as u64;
        let mut stats = UploadStats::new(total);
        if let Some(progress) = &ctx.progress {
            progress.start(total);
        }

        for name in walk.unreadable {
            warn!(root = %root.display(), "Unreadable upload entry: {}", name);
            if let Some(progress) = &ctx.progress {
                progress.log(&format!("Failed to read {}", name));
                progress.increment();
            }
            stats.record_failure(name);
        }

        let encoder = ZstdEncoder::with_quality(&mut *out, Level::Precise(self.compression_level));
        let mut tar = TarStreamWriter::new(encoder);

        for file in &walk.files {
            match append_file(&mut tar, file).await {
                Ok(()) => stats.record_included(),
                Err(AppendError::Skipped(e)) | Err(AppendError::Truncated(e)) => {
                    if let Some(progress) = &ctx.progress {
                        progress.log(&format!("Failed to add {}: {}", file.relative_path, e));
                    }
                    stats.record_failure(file.relative_path.clone());
                }
                Err(AppendError::Sink(e)) => return Err(e.into()),
            }
            if let Some(progress) = &ctx.progress {
                progress.increment();
            }
        }

        let mut encoder = tar.finish().await?;
        encoder.shutdown().await?;

        debug!(
            root = %root.display(),
            included = stats.included_count,
            failed = stats.missing_count(),
            "Upload directory archived"
        );
        Ok(stats)
    }
}

enum AppendError {
    /// The file could not be opened or named in a header; nothing was written
    Skipped(std::io::Error),
    /// The file shrank mid-copy; the entry is zero-filled
    Truncated(std::io::Error),
    /// Writing to the archive failed
    Sink(std::io::Error),
}

async fn append_file<W>(tar: &mut TarStreamWriter<W>, file: &UploadFile) -> Result<(), AppendError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut source = File::open(&file.path).await.map_err(AppendError::Skipped)?;
    let attrs = MemberAttributes {
        mode: file.mode,
        mtime: file.mtime,
        ..MemberAttributes::current_process()
    };

    match tar
        .append(&file.relative_path, &attrs, file.size, &mut source)
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(AppendError::Truncated(e)),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Err(AppendError::Skipped(e)),
        Err(e) => Err(AppendError::Sink(e)),
    }
}

#[async_trait]
impl UploadBackuper for DirectoryUploadBackuper {
    fn include_uploads(&self) -> bool {
        self.include_uploads
    }

    fn include_optimized_images(&self) -> bool {
        self.include_optimized_images
    }

    async fn compress_uploads_into(
        &self,
        out: &mut MemberSink<'_>,
        ctx: &StageContext,
    ) -> anyhow::Result<UploadStats> {
        self.archive_directory(&self.uploads_dir, out, ctx).await
    }

    async fn compress_optimized_images_into(
        &self,
        out: &mut MemberSink<'_>,
        ctx: &StageContext,
    ) -> anyhow::Result<UploadStats> {
        self.archive_directory(&self.optimized_images_dir, out, ctx).await
    }
}
