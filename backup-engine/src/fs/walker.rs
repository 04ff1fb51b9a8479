//! Enumeration of uploaded files for archiving.

use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Directory or file names skipped anywhere in the tree
    pub exclude_names: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_names: vec![
                // Deleted uploads awaiting purge
                "tombstone".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

/// A regular file found under an uploads root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub path: PathBuf,

    /// `/`-separated path below the root; the id used in failure reports
    pub relative_path: String,

    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

impl UploadFile {
    /// Symlinks resolve to their target. Returns None for directories and
    /// broken links.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) => resolved,
                Err(_) => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        Ok(Some(Self {
            relative_path: relative_name(&path, root),
            path,
            size: metadata.len(),
            mode: metadata.mode() & 0o7777,
            mtime: metadata.mtime(),
        }))
    }
}

/// Files found plus entries that could not be read.
#[derive(Debug, Default)]
pub struct Walk {
    pub files: Vec<UploadFile>,
    pub unreadable: Vec<String>,
}

/// Walk `root` and collect every regular file, sorted by relative path.
///
/// A missing root yields an empty walk. Unreadable entries below the root
/// are reported instead of aborting the walk.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Walk {
    let mut walk = Walk::default();
    if !root.exists() {
        return walk;
    }

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry, &options.exclude_names));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let name = e
                    .path()
                    .map(|path| relative_name(path, root))
                    .unwrap_or_else(|| root.display().to_string());
                walk.unreadable.push(name);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        match UploadFile::from_entry(&entry, root) {
            Ok(Some(file)) => walk.files.push(file),
            Ok(None) => {}
            Err(_) => walk.unreadable.push(relative_name(entry.path(), root)),
        }
    }

    walk
}

fn is_excluded(entry: &DirEntry, names: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    names.iter().any(|name| file_name == name.as_str())
}

fn relative_name(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_root_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let walk = walk_directory(&temp_dir.path().join("absent"), &WalkOptions::default());
        assert!(walk.files.is_empty());
        assert!(walk.unreadable.is_empty());
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("original/1X"))?;
        fs::write(temp_dir.path().join("original/1X/b.png"), b"bbbb")?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;

        let walk = walk_directory(temp_dir.path(), &WalkOptions::default());
        let names: Vec<_> = walk.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "original/1X/b.png"]);
        assert_eq!(walk.files[1].size, 4);

        Ok(())
    }

    #[test]
    fn test_excluded_names_are_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("tombstone/original"))?;
        fs::write(temp_dir.path().join("tombstone/original/gone.png"), b"x")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"x")?;
        fs::write(temp_dir.path().join("kept.png"), b"x")?;

        let walk = walk_directory(temp_dir.path(), &WalkOptions::default());
        assert_eq!(walk.files.len(), 1);
        assert_eq!(walk.files[0].relative_path, "kept.png");

        Ok(())
    }

    #[test]
    fn test_broken_symlink_is_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("real.png"), b"x")?;
        std::os::unix::fs::symlink(temp_dir.path().join("nowhere"), temp_dir.path().join("dangling.png"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("real.png"), temp_dir.path().join("link.png"))?;

        let walk = walk_directory(temp_dir.path(), &WalkOptions::default());
        let names: Vec<_> = walk.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["link.png", "real.png"]);

        Ok(())
    }
}
