use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS operation_locks (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_operation_locks_expires_at ON operation_locks(expires_at);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::debug!("[DB] Applying lock database schema");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Entries whose TTL ran out while no process was around to notice.
    let now = chrono::Utc::now().timestamp_millis();
    let purged = conn.execute(
        "DELETE FROM operation_locks WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        [now],
    )?;
    if purged > 0 {
        tracing::debug!("[DB] Purged {} expired lock entries", purged);
    }

    Ok(())
}
