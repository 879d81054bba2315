use rusqlite::Connection;

use crate::error::Result;

/// Initialise the generic records table and its index.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            id          TEXT PRIMARY KEY,
            tbl         TEXT NOT NULL,
            body        TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_records_tbl
            ON records(tbl, created_at);",
    )?;
    Ok(())
}
