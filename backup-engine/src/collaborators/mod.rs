//! Reference implementations of the services a backup run drives.

pub mod dump;
pub mod notify;
pub mod store;
pub mod uploads;

use std::sync::Arc;

pub use dump::CommandDumper;
pub use notify::{LogNotifier, WebhookNotifier};
pub use store::{BackupFile, ConfiguredStore, LocalBackupStore, MirrorBackupStore};
pub use uploads::DirectoryUploadBackuper;

use crate::backup::{Collaborators, Notifier};
use crate::config::Config;
use crate::utils::{EngineError, Result};

/// Collaborators described by the configuration file.
pub fn from_config(config: &Config) -> Result<Collaborators> {
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone(), config.site.name.clone())
                .map_err(|e| EngineError::Config(format!("{:#}", e)))?,
        ),
        None => Arc::new(LogNotifier),
    };

    Ok(Collaborators {
        dumper: Arc::new(CommandDumper::from_config(&config.backup)),
        uploads: Arc::new(DirectoryUploadBackuper::from_config(&config.backup)),
        store: ConfiguredStore::from_config(config)?.into_store(),
        notifier,
    })
}
