//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every section has defaults so a
//! partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub site: SiteConfig,
    pub backup: BackupConfig,
    pub store: StoreConfig,
    pub lock: LockConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Logical site name; namespaces lock keys and working directories
    pub name: String,

    /// Human title, parameterized into archive filenames
    pub title: String,

    pub multisite: bool,
    pub base_url: String,
    pub cdn_url: Option<String>,
    pub s3_base_url: Option<String>,
    pub s3_cdn_url: Option<String>,

    /// Host application version recorded in the metadata document
    pub version: String,
    pub db_version: Option<u64>,
    pub git_version: Option<String>,
    pub git_branch: Option<String>,

    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Directory the finished archives are written to
    pub archive_dir: PathBuf,

    /// Root for per-run working directories
    pub tmp_dir: PathBuf,

    pub uploads_dir: PathBuf,
    pub optimized_images_dir: PathBuf,
    pub include_uploads: bool,
    pub include_optimized_images: bool,

    /// Command whose stdout is the database dump, e.g. `["pg_dump", "mydb"]`
    pub dump_command: Vec<String>,

    /// zstd level for the compressed members
    pub compression_level: i32,

    /// Archives kept by retention pruning
    pub max_backups: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Local,
    Mirror,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Target directory for the `mirror` store
    pub mirror_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lifetime of the running marker without a heartbeat
    pub ttl_secs: u64,
    pub heartbeat_secs: u64,
    pub abort_poll_ms: u64,
    /// Delay between noticing an abort request and terminating
    pub abort_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds before a running job is reported as stuck
    pub timeout_secs: u64,

    /// Run jobs inline on `enqueue` when false
    #[serde(rename = "async")]
    pub run_async: bool,

    pub idle_shutdown_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Directory for per-operation logfiles
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

// Default values
fn default_true() -> bool {
    true
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            title: String::new(),
            multisite: false,
            base_url: "http://localhost".to_string(),
            cdn_url: None,
            s3_base_url: None,
            s3_cdn_url: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_version: None,
            git_version: None,
            git_branch: None,
            plugins: Vec::new(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("/var/lib/site-backup/backups"),
            tmp_dir: PathBuf::from("/var/lib/site-backup/tmp"),
            uploads_dir: PathBuf::from("/var/lib/site-backup/uploads"),
            optimized_images_dir: PathBuf::from("/var/lib/site-backup/optimized"),
            include_uploads: true,
            include_optimized_images: true,
            dump_command: vec!["pg_dump".to_string(), "--no-owner".to_string()],
            compression_level: 3,
            max_backups: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Local,
            mirror_dir: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            heartbeat_secs: 30,
            abort_poll_ms: 100,
            abort_grace_secs: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 90,
            run_async: true,
            idle_shutdown_secs: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("/var/log/site-backup"),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_shutdown(&self) -> Option<Duration> {
        self.idle_shutdown_secs.map(Duration::from_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.site.name.trim().is_empty() {
            return Err(EngineError::Config("site.name must not be empty".into()));
        }
        if self.lock.heartbeat_secs == 0 || self.lock.heartbeat_secs >= self.lock.ttl_secs {
            return Err(EngineError::Config(
                "lock.heartbeat_secs must be positive and shorter than lock.ttl_secs".into(),
            ));
        }
        if self.store.kind == StoreKind::Mirror && self.store.mirror_dir.is_none() {
            return Err(EngineError::Config(
                "store.mirror_dir is required for the mirror store".into(),
            ));
        }
        if self.backup.dump_command.is_empty() {
            return Err(EngineError::Config("backup.dump_command must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.site.name, "default");
        assert_eq!(config.lock.ttl_secs, 60);
        assert_eq!(config.lock.heartbeat_secs, 30);
        assert_eq!(config.scheduler.timeout_secs, 90);
        assert!(config.scheduler.run_async);
        assert_eq!(config.store.kind, StoreKind::Local);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [site]
            name = "forum"
            title = "My Forum"

            [[site.plugins]]
            name = "chat"

            [[site.plugins]]
            name = "polls"
            enabled = false

            [scheduler]
            async = false
            timeout_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.site.name, "forum");
        assert_eq!(config.site.plugins.len(), 2);
        assert!(config.site.plugins[0].enabled);
        assert!(!config.site.plugins[1].enabled);
        assert!(!config.scheduler.run_async);
        assert_eq!(config.scheduler.timeout(), Duration::from_secs(5));
        assert_eq!(config.backup.max_backups, 5);
    }

    #[test]
    fn test_mirror_store_requires_directory() {
        let err = Config::from_toml("[store]\nkind = \"mirror\"\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_ttl() {
        let err = Config::from_toml("[lock]\nttl_secs = 10\nheartbeat_secs = 10\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
