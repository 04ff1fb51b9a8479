//! Archive naming and working directory layout.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::config::{BackupConfig, SiteConfig};

/// Extensions removed from an overridden filename before `.tar` is added.
const STRIPPED_EXTENSIONS: [&str; 4] = [".sql.gz", ".tar.gz", ".tgz", ".tar"];

const FALLBACK_TITLE: &str = "backup";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathOverride {
    pub directory: Option<PathBuf>,
    pub filename: Option<String>,
}

impl PathOverride {
    /// Split a user-supplied path. Returns the override and whether a
    /// directory was requested but dropped because the store is remote.
    pub fn parse(raw: &Path, store_is_remote: bool) -> (Self, bool) {
        let directory = raw
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty() && *dir != Path::new("."))
            .map(Path::to_path_buf);

        let (directory, ignored) = match directory {
            Some(_) if store_is_remote => (None, true),
            other => (other, false),
        };

        let filename = raw
            .file_name()
            .and_then(|name| name.to_str())
            .map(strip_archive_extension)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        (Self { directory, filename }, ignored)
    }
}

fn strip_archive_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    STRIPPED_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map_or(name, |ext| &name[..name.len() - ext.len()])
}

/// Lowercase ASCII slug with single dashes between words.
pub fn parameterize(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d-%H%M%S").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPaths {
    pub archive_dir: PathBuf,
    /// Archive file name including `.tar`
    pub filename: String,
    pub archive_path: PathBuf,
    pub work_dir: PathBuf,
}

impl BackupPaths {
    pub fn resolve(
        backup: &BackupConfig,
        site: &SiteConfig,
        overrides: &PathOverride,
        now: DateTime<Utc>,
    ) -> Self {
        let timestamp = timestamp(now);

        let archive_dir = overrides
            .directory
            .clone()
            .unwrap_or_else(|| backup.archive_dir.join(&site.name));

        let stem = overrides.filename.clone().unwrap_or_else(|| {
            let title = parameterize(&site.title);
            let title = if title.is_empty() {
                FALLBACK_TITLE.to_string()
            } else {
                title
            };
            format!("{}-{}", title, timestamp)
        });
        let filename = format!("{}.tar", stem);

        Self {
            archive_path: archive_dir.join(&filename),
            archive_dir,
            filename,
            work_dir: backup.tmp_dir.join("backups").join(&site.name).join(&timestamp),
        }
    }
}
