mod config;
mod db;
mod error;
mod services;

use crate::config::AppConfig;
use crate::db::connection::{close_pool, create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::error::CliError;
use crate::services::SqliteLockStore;
use backup_engine::backup::{BackupEvent, BackupStore};
use backup_engine::collaborators::{self, ConfiguredStore};
use backup_engine::daemon::ShutdownCoordinator;
use backup_engine::reporting::ConsoleLogger;
use backup_engine::utils::logger::{self as engine_logger, format_bytes};
use backup_engine::{
    Backuper, Config, DeferredScheduler, EngineError, Initiator, LockSettings, LockStore,
    OperationLock,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "site-backup", version, about = "Create and control site backups")]
struct Cli {
    /// Site configuration file, defaults to $SITE_BACKUP_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a backup now
    Create {
        /// Archive file or directory to write to (local store only)
        #[arg(long)]
        path: Option<PathBuf>,

        /// User the backup runs for; the system user when omitted
        #[arg(long)]
        user_id: Option<i64>,

        #[arg(long, requires = "user_id")]
        username: Option<String>,
    },
    /// Show whether a backup or restore is running
    Status,
    /// Ask the running backup or restore to stop
    Abort,
    /// List stored archives, newest first
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let app = AppConfig::from_env();

    match run(cli, app).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // A failed run has already been reported by its logger.
            if !matches!(e, CliError::BackupFailed) {
                eprintln!("Error: {}", e);
            }
            e.exit_code()
        }
    }
}

async fn run(cli: Cli, app: AppConfig) -> Result<(), CliError> {
    let config_path = cli.config.unwrap_or_else(|| app.config_path.clone());
    let (config, found) = load_config(&config_path)?;

    let level = app
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.level.clone());
    engine_logger::init(&level)?;
    if !found {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
    }

    let pool = open_lock_database(&app.lock_db_path)?;
    let store: Arc<dyn LockStore> = Arc::new(SqliteLockStore::new(pool.clone()));
    let lock = OperationLock::new(store, config.site.name.clone(), LockSettings::from(&config.lock));

    let result = match cli.command {
        Command::Create {
            path,
            user_id,
            username,
        } => {
            let initiator = match user_id {
                Some(id) => Initiator {
                    id,
                    username: username.unwrap_or_else(|| format!("user-{}", id)),
                },
                None => Initiator::system(),
            };
            create(&config, Arc::new(lock), initiator, path).await
        }
        Command::Status => status(&config, &lock).await,
        Command::Abort => abort(&config, &lock).await,
        Command::List => list(&config).await,
    };

    close_pool(&pool);
    result
}

fn load_config(path: &Path) -> Result<(Config, bool), CliError> {
    if !path.exists() {
        return Ok((Config::default(), false));
    }
    let config = Config::from_file(path)
        .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
    Ok((config, true))
}

fn open_lock_database(path: &Path) -> Result<DbPool, CliError> {
    let pool = create_pool(path)?;
    migrate(&pool)?;
    Ok(pool)
}

async fn create(
    config: &Config,
    lock: Arc<OperationLock>,
    initiator: Initiator,
    path: Option<PathBuf>,
) -> Result<(), CliError> {
    if lock.is_running().await? {
        return Err(CliError::Busy(config.site.name.clone()));
    }

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.listen();

    let logger = ConsoleLogger::create(&config.log.dir, &config.site.name, "backup")
        .map_err(EngineError::from)?;
    let collaborators = collaborators::from_config(config)?;
    let scheduler = DeferredScheduler::from_config(config.site.name.clone(), &config.scheduler);

    let mut backuper = Backuper::new(config, lock, Arc::new(logger), collaborators.clone())
        .with_initiator(initiator)
        .with_path_override(path)
        .with_cancellation(shutdown.token());
    let listener = tokio::spawn(on_backup_created(
        backuper.subscribe(),
        scheduler.clone(),
        Arc::clone(&collaborators.store),
    ));

    let result = backuper.run().await;

    // Closes the event channel so the listener returns.
    drop(backuper);
    if let Err(e) = listener.await {
        warn!("Backup event listener ended abnormally: {}", e);
    }
    scheduler.drain_synchronously().await;
    scheduler.shutdown().await;

    shutdown.trigger();
    let _ = signals.await;

    if result.success {
        Ok(())
    } else {
        Err(CliError::BackupFailed)
    }
}

/// Deferred follow-up work for every archive a run produced.
async fn on_backup_created(
    mut events: broadcast::Receiver<BackupEvent>,
    scheduler: DeferredScheduler,
    store: Arc<dyn BackupStore>,
) {
    loop {
        match events.recv().await {
            Ok(BackupEvent::Created { site, archive_path }) => {
                let store = Arc::clone(&store);
                scheduler
                    .enqueue(Some("refresh_backup_listing"), Some(&site), move || async move {
                        store.reset_cache().await?;
                        info!(archive = %archive_path.display(), "Backup listing refreshed");
                        Ok::<_, anyhow::Error>(())
                    })
                    .await;
            }
            Err(RecvError::Lagged(skipped)) => warn!("Missed {} backup events", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn status(config: &Config, lock: &OperationLock) -> Result<(), CliError> {
    match lock.holder().await? {
        Some(holder) => {
            println!("Site '{}': operation running ({})", config.site.name, holder);
            if lock.should_abort().await? {
                println!("Abort requested, waiting for the operation to stop");
            }
        }
        None => println!("Site '{}': idle", config.site.name),
    }
    Ok(())
}

async fn abort(config: &Config, lock: &OperationLock) -> Result<(), CliError> {
    if !lock.is_running().await? {
        println!("No backup or restore is running for site '{}'", config.site.name);
        return Ok(());
    }

    lock.abort().await?;
    println!("Abort requested for site '{}'", config.site.name);
    Ok(())
}

async fn list(config: &Config) -> Result<(), CliError> {
    let store = ConfiguredStore::from_config(config)?;
    let files = store.list_backups().await.map_err(EngineError::from)?;

    if files.is_empty() {
        println!("No backups found");
    }
    for file in files {
        println!(
            "{:<64} {:>12}  {}",
            file.filename,
            format_bytes(file.size),
            file.last_modified.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
