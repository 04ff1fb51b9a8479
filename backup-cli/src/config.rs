use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/site-backup/config.toml";
const DEFAULT_LOCK_DB: &str = "/var/lib/site-backup/locks.db";

/// Process-level settings read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub lock_db_path: PathBuf,
    /// Overrides `[log] level` of the site configuration when set
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            config_path: PathBuf::from(
                std::env::var("SITE_BACKUP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into()),
            ),
            lock_db_path: PathBuf::from(
                std::env::var("SITE_BACKUP_LOCK_DB").unwrap_or_else(|_| DEFAULT_LOCK_DB.into()),
            ),
            log_level: std::env::var("LOG_LEVEL").ok(),
        }
    }
}
