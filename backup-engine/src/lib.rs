//! Site Backup Engine
//!
//! Exclusive per-site operation lock, deferred job scheduler, and a
//! streaming tar archive builder, composed by [`backup::Backuper`].

pub mod archive;
pub mod backup;
pub mod collaborators;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod lock;
pub mod reporting;
pub mod scheduler;
pub mod utils;

// Re-export commonly used types
pub use backup::{BackupEvent, BackupRunResult, Backuper, Collaborators, Initiator};
pub use config::Config;
pub use lock::{LockSettings, LockStore, MemoryLockStore, OperationLock};
pub use scheduler::DeferredScheduler;
pub use utils::errors::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;
