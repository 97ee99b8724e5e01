use rusqlite::Connection;

use crate::error::Result;

/// Initialise the task schema in `conn`.
///
/// Creates the `tasks` table (idempotent) plus the indexes the claim query
/// leans on. Timestamps are fixed-width RFC 3339 UTC text with millisecond
/// precision, so string comparison is time comparison.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            task_id       TEXT    NOT NULL PRIMARY KEY,
            name          TEXT    NOT NULL,
            data          TEXT    NOT NULL,   -- opaque JSON payload
            task_group    TEXT,
            repeat_every  INTEGER NOT NULL DEFAULT 0,
            start_at      TEXT    NOT NULL,
            created_at    TEXT    NOT NULL,
            locked_at     TEXT    NOT NULL DEFAULT '1970-01-01T00:00:00.000Z',
            processed_at  TEXT,
            failed_at     TEXT,
            error_msg     TEXT,
            retries       INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- Claim scan: WHERE processed_at IS NULL AND start_at <= ? ORDER BY start_at
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (processed_at, start_at, created_at);
        -- Group rule: live locks within a group
        CREATE INDEX IF NOT EXISTS idx_tasks_group_lock ON tasks (task_group, locked_at);
        ",
    )?;
    Ok(())
}
