pub mod sqlite_lock_store;

pub use sqlite_lock_store::SqliteLockStore;
