use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entries (
            channel_id  TEXT NOT NULL,
            key         TEXT NOT NULL,
            fields      TEXT NOT NULL,
            revision    INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (channel_id, key)
        ) WITHOUT ROWID;
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
