//! Knowledge store: identities, chunks and links in SQLite.
//!
//! `Db` is the single writer of durable state. Callers share it as
//! `Arc<tokio::sync::Mutex<Db>>`, which serializes writers inside one
//! process; identity rows are additionally guarded by a unique constraint
//! so separate connections cannot duplicate them.
use rusqlite::{Connection, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;

pub mod chunks;
pub mod files;
pub mod identities;
pub mod links;
pub mod models;

pub type SharedDb = Arc<TokioMutex<Db>>;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    context TEXT NOT NULL,
    language TEXT NOT NULL,
    indexed_at DATETIME NOT NULL,
    UNIQUE(context, name)
);

CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    full_name TEXT NOT NULL,
    context TEXT NOT NULL,
    kind TEXT NOT NULL,
    short_name TEXT,
    display_name TEXT,
    file_id INTEGER,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    UNIQUE(full_name, context),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_identity_context ON identities(context);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    full_name TEXT,
    level INTEGER NOT NULL,
    kind TEXT NOT NULL,
    parent_chunk_id INTEGER,
    content TEXT NOT NULL,
    identity_id INTEGER,
    updated_at DATETIME NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
    FOREIGN KEY (parent_chunk_id) REFERENCES chunks(id) ON DELETE CASCADE,
    FOREIGN KEY (identity_id) REFERENCES identities(id) ON DELETE SET NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_chunk_key ON chunks(file_id, full_name, level);
CREATE INDEX IF NOT EXISTS idx_chunk_name ON chunks(full_name);
CREATE INDEX IF NOT EXISTS idx_chunk_identity ON chunks(identity_id);

CREATE TABLE IF NOT EXISTS links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    context TEXT NOT NULL,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    link_type TEXT NOT NULL,
    file_id INTEGER,
    UNIQUE(context, source, target, link_type),
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_link_source ON links(context, source);
CREATE INDEX IF NOT EXISTS idx_link_target ON links(context, target);
"#;

/// A SQLite connection initialized with the knowledge-store schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(TokioMutex::new(self))
    }
}

/// Escapes `%`, `_` and `\` for use in a `LIKE … ESCAPE '\'` pattern.
pub(crate) fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_init() {
        let db = Db::open_in_memory().expect("Failed to open in-memory DB");

        let tables: usize = db
            .conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('files', 'identities', 'chunks', 'links');",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(tables, 4);
    }

    #[test]
    fn test_open_on_disk_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.db");
        drop(Db::open(&path).unwrap());
        // Schema creation is idempotent.
        assert!(Db::open(&path).is_ok());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a_b%c"), r"a\_b\%c");
    }
}
