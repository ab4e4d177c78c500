use super::{Db, models::*};
use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{OptionalExtension, Result, Row, params};

fn map_file(row: &Row<'_>) -> Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        context: row.get(2)?,
        language: row.get(3)?,
        indexed_at: row.get(4)?,
    })
}

impl Db {
    /// Creates the file row on first sighting, refreshes it afterwards.
    /// Returns the stable id and whether the row is new.
    pub fn upsert_file(&mut self, context: &str, name: &str, language: &str) -> Result<(i64, bool)> {
        let existing = self.file_id(context, name)?;
        let id: i64 = self.conn.query_row(
            r#"
            INSERT INTO files (name, context, language, indexed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(context, name) DO UPDATE SET
                language = excluded.language,
                indexed_at = excluded.indexed_at
            RETURNING id
            "#,
            params![name, context, language, Utc::now()],
            |row| row.get(0),
        )?;
        Ok((id, existing.is_none()))
    }

    pub fn file_id(&self, context: &str, name: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM files WHERE context = ? AND name = ?",
                params![context, name],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn get_file(&self, id: i64) -> Result<Option<FileRecord>> {
        self.conn
            .query_row(
                "SELECT id, name, context, language, indexed_at FROM files WHERE id = ?",
                params![id],
                map_file,
            )
            .optional()
    }

    /// All indexed files of a context, ordered by name.
    pub fn list_files(&self, context: &str) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, context, language, indexed_at FROM files WHERE context = ? ORDER BY name",
        )?;
        let rows = stmt.query_map(params![context], map_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Deletes a file with its chunks and links, then garbage-collects the
    /// identities left without a level-0 chunk. Returns how many were collected.
    pub fn delete_file(&mut self, context: &str, name: &str) -> std::result::Result<Option<usize>, StoreError> {
        let Some(id) = self.file_id(context, name)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM files WHERE id = ?", params![id])?;
        let collected = self.gc_identities(context)?;
        Ok(Some(collected.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_crud() {
        let mut db = Db::open_in_memory().unwrap();

        let (id, is_new) = db.upsert_file("ctx", "schema.sql", "sql").unwrap();
        assert!(is_new);

        let (again, is_new) = db.upsert_file("ctx", "schema.sql", "sql").unwrap();
        assert_eq!(id, again);
        assert!(!is_new);

        // Same name in another context is a different file.
        let (other, _) = db.upsert_file("other", "schema.sql", "sql").unwrap();
        assert_ne!(id, other);

        let files = db.list_files("ctx").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "schema.sql");
        assert_eq!(db.get_file(id).unwrap().unwrap().language, "sql");

        assert_eq!(db.delete_file("ctx", "schema.sql").unwrap(), Some(0));
        assert_eq!(db.delete_file("ctx", "schema.sql").unwrap(), None);
        assert!(db.list_files("ctx").unwrap().is_empty());
    }
}
