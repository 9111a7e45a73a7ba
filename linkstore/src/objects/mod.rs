use crate::error::Result;
use crate::query::{quote_ident, Query};
use crate::record::{self, Record};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

/// Table holding every persisted record.
pub const OBJECTS_TABLE: &str = "objects";

/// Newest-first creation order. `rowid` breaks timestamp ties.
pub const NEWEST_FIRST: &str = "\"timestamp\" DESC, rowid DESC";

/// Oldest-first creation order.
pub const OLDEST_FIRST: &str = "\"timestamp\" ASC, rowid ASC";

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS objects (
            id TEXT PRIMARY KEY NOT NULL,
            creator_id TEXT NOT NULL DEFAULT '',
            owner_id TEXT NOT NULL DEFAULT '',
            partition_id TEXT NOT NULL DEFAULT '',
            \"key\" TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL DEFAULT '',
            hash TEXT NOT NULL DEFAULT '',
            peer_hash TEXT NOT NULL DEFAULT '',
            prev_hash TEXT NOT NULL DEFAULT '',
            \"timestamp\" INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_objects_key ON objects(\"key\");
        CREATE INDEX IF NOT EXISTS idx_objects_timestamp ON objects(\"timestamp\");
        CREATE INDEX IF NOT EXISTS idx_objects_partition ON objects(partition_id);
        ",
    )?;
    Ok(())
}

pub fn has_table(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Remove every row from the objects table.
pub fn truncate(conn: &Connection) -> Result<usize> {
    let removed = conn.execute("DELETE FROM objects", [])?;
    Ok(removed)
}

pub fn insert_sql() -> String {
    let fields = record::valid_fields();
    let cols = fields
        .iter()
        .map(|f| quote_ident(f))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; fields.len()].join(", ");
    format!("INSERT INTO {OBJECTS_TABLE} ({cols}) VALUES ({placeholders})")
}

pub fn insert(conn: &Connection, record: &Record) -> Result<()> {
    let values = record.field_values();
    let mut stmt = conn.prepare_cached(&insert_sql())?;
    stmt.execute(params_from_iter(values.iter().map(|(_, v)| v)))?;
    Ok(())
}

pub fn select(conn: &Connection, query: &Query) -> Result<Vec<Record>> {
    let sql = query.to_select_sql(&record::valid_fields());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(query.params()), Record::from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

pub fn count(conn: &Connection, query: &Query) -> Result<i64> {
    let n: i64 = conn.query_row(
        &query.to_count_sql(),
        params_from_iter(query.params()),
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Rewrite the peer hash of the record with `id`. Returns the rows changed.
pub fn update_peer_hash(conn: &Connection, id: &str, peer_hash: &str) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE objects SET peer_hash = ?1 WHERE id = ?2",
        params![peer_hash, id],
    )?;
    Ok(changed)
}

// ── Transaction Support ──────────────────────────────────────────

/// Begin a write transaction, taking the write lock up front.
pub fn begin_transaction(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE TRANSACTION")?;
    Ok(())
}

pub fn commit_transaction(conn: &Connection) -> Result<()> {
    conn.execute_batch("COMMIT")?;
    Ok(())
}

pub fn rollback_transaction(conn: &Connection) -> Result<()> {
    conn.execute_batch("ROLLBACK")?;
    Ok(())
}
