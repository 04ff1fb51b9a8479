use anyhow::Context;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Writers of other processes hold the database briefly; wait for them.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn create_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
    });
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .with_context(|| format!("failed to open lock database {}", db_path.display()))?;

    Ok(pool)
}

pub fn close_pool(pool: &DbPool) {
    // Connections close when the pool drops; fold the WAL back first.
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
    }
}
