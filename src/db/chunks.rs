use super::{Db, models::*};
use crate::error::StoreError;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Result, Row, params};
use std::collections::HashSet;

const CHUNK_COLUMNS: &str =
    "c.id, c.file_id, c.full_name, c.level, c.kind, c.parent_chunk_id, c.identity_id, c.content";

fn map_chunk(row: &Row<'_>) -> Result<StoredChunk> {
    let raw_level: i64 = row.get(3)?;
    let level = ChunkLevel::from_i64(raw_level).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Integer,
            format!("invalid chunk level {raw_level}").into(),
        )
    })?;
    let content: String = row.get(7)?;
    let body = ChunkBody::from_json(level, &content)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    Ok(StoredChunk {
        id: row.get(0)?,
        file_id: row.get(1)?,
        full_name: row.get(2)?,
        level,
        kind: row.get(4)?,
        parent_chunk_id: row.get(5)?,
        identity_id: row.get(6)?,
        body,
    })
}

impl Db {
    /// Creates or replaces the chunk keyed by `(file, full_name, level)`.
    ///
    /// Without a `full_name` the chunk is looked up by exact content at that
    /// level. Identical content is left untouched and reported `Unchanged`.
    pub fn upsert_chunk(
        &mut self,
        file_id: i64,
        full_name: Option<&str>,
        body: &ChunkBody,
        kind: &str,
        parent_chunk_id: Option<i64>,
    ) -> std::result::Result<ChunkWrite, StoreError> {
        let content = body.to_json()?;
        let level = body.level().as_i64();

        let existing: Option<(i64, String, String, Option<i64>)> = match full_name {
            Some(name) => self
                .conn
                .query_row(
                    "SELECT id, content, kind, parent_chunk_id FROM chunks WHERE file_id = ? AND full_name = ? AND level = ?",
                    params![file_id, name, level],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?,
            None => self
                .conn
                .query_row(
                    "SELECT id, content, kind, parent_chunk_id FROM chunks WHERE file_id = ? AND full_name IS NULL AND level = ? AND content = ?",
                    params![file_id, level, content],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?,
        };

        let write = match existing {
            Some((id, old_content, old_kind, old_parent))
                if old_content == content && old_kind == kind && old_parent == parent_chunk_id =>
            {
                ChunkWrite {
                    id,
                    status: WriteStatus::Unchanged,
                }
            }
            Some((id, ..)) => {
                self.conn.execute(
                    "UPDATE chunks SET content = ?, kind = ?, parent_chunk_id = ?, updated_at = ? WHERE id = ?",
                    params![content, kind, parent_chunk_id, Utc::now(), id],
                )?;
                ChunkWrite {
                    id,
                    status: WriteStatus::Updated,
                }
            }
            None => {
                self.conn.execute(
                    r#"
                    INSERT INTO chunks (file_id, full_name, level, kind, parent_chunk_id, content, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                    params![file_id, full_name, level, kind, parent_chunk_id, content, Utc::now()],
                )?;
                ChunkWrite {
                    id: self.conn.last_insert_rowid(),
                    status: WriteStatus::Created,
                }
            }
        };
        Ok(write)
    }

    /// Binds a chunk, its children and every other level-0 chunk of the same
    /// `(file, full_name)` to one identity.
    pub fn attach_identity(&self, chunk_id: i64, identity_id: i64) -> Result<usize> {
        self.conn.execute(
            r#"
            UPDATE chunks SET identity_id = ?1
            WHERE (id = ?2
                   OR parent_chunk_id = ?2
                   OR (level = 0 AND full_name IS NOT NULL
                       AND (file_id, full_name) = (SELECT file_id, full_name FROM chunks WHERE id = ?2)))
              AND identity_id IS NOT ?1
            "#,
            params![identity_id, chunk_id],
        )
    }

    pub fn get_chunk(&self, id: i64) -> Result<Option<StoredChunk>> {
        self.conn
            .query_row(
                &format!("SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.id = ?"),
                params![id],
                map_chunk,
            )
            .optional()
    }

    /// The level-0 chunk for `full_name` anywhere in the context.
    pub fn source_chunk(&self, context: &str, full_name: &str) -> Result<Option<StoredChunk>> {
        self.conn
            .query_row(
                &format!(
                    r#"
                    SELECT {CHUNK_COLUMNS} FROM chunks c JOIN files f ON f.id = c.file_id
                    WHERE f.context = ? AND c.full_name = ? AND c.level = 0
                    ORDER BY c.id LIMIT 1
                    "#
                ),
                params![context, full_name],
                map_chunk,
            )
            .optional()
    }

    pub fn chunks_for_file(&self, file_id: i64) -> Result<Vec<StoredChunk>> {
        self.query_chunks(
            &format!("SELECT {CHUNK_COLUMNS} FROM chunks c WHERE c.file_id = ? ORDER BY c.id"),
            params![file_id],
        )
    }

    /// All level-1 relation chunks of a context.
    pub fn relation_chunks(&self, context: &str) -> Result<Vec<StoredChunk>> {
        self.query_chunks(
            &format!(
                r#"
                SELECT {CHUNK_COLUMNS} FROM chunks c JOIN files f ON f.id = c.file_id
                WHERE f.context = ? AND c.level = 1
                ORDER BY c.full_name, c.id
                "#
            ),
            params![context],
        )
    }

    /// Level-0 chunks of the given kind, optionally limited to files of one language.
    pub fn source_chunks_of_kind(
        &self,
        context: &str,
        kind: &str,
        language: Option<&str>,
    ) -> Result<Vec<StoredChunk>> {
        self.query_chunks(
            &format!(
                r#"
                SELECT {CHUNK_COLUMNS} FROM chunks c JOIN files f ON f.id = c.file_id
                WHERE f.context = ?1 AND c.level = 0 AND c.kind = ?2
                  AND (?3 IS NULL OR f.language = ?3)
                ORDER BY c.full_name, c.id
                "#
            ),
            params![context, kind, language],
        )
    }

    /// Level-0 chunks of relational routines.
    pub fn routines(&self, context: &str) -> Result<Vec<StoredChunk>> {
        self.query_chunks(
            &format!(
                r#"
                SELECT {CHUNK_COLUMNS} FROM chunks c JOIN files f ON f.id = c.file_id
                WHERE f.context = ? AND f.language = 'sql' AND c.level = 0
                  AND c.kind IN ('function', 'procedure')
                ORDER BY c.full_name, c.id
                "#
            ),
            params![context],
        )
    }

    /// Declared shape of a table, read from its level-0 chunk.
    pub fn table_shape(&self, context: &str, full_name: &str) -> Result<Option<TableShape>> {
        let chunk = self
            .conn
            .query_row(
                &format!(
                    r#"
                    SELECT {CHUNK_COLUMNS} FROM chunks c JOIN files f ON f.id = c.file_id
                    WHERE f.context = ? AND lower(c.full_name) = lower(?) AND c.level = 0 AND c.kind = 'table'
                    ORDER BY c.id LIMIT 1
                    "#
                ),
                params![context, full_name],
                map_chunk,
            )
            .optional()?;
        Ok(chunk.and_then(|c| match c.body {
            ChunkBody::Source(SourceBody {
                detail: Some(EntityDetail::Table(shape)),
                ..
            }) => Some(shape),
            _ => None,
        }))
    }

    fn query_chunks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<StoredChunk>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, map_chunk)?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }

    pub fn update_chunk_body(&self, id: i64, body: &ChunkBody) -> std::result::Result<(), StoreError> {
        let content = body.to_json()?;
        self.conn.execute(
            "UPDATE chunks SET content = ?, updated_at = ? WHERE id = ? AND level = ?",
            params![content, Utc::now(), id, body.level().as_i64()],
        )?;
        Ok(())
    }

    /// Deletes one chunk (and its children), then garbage-collects identities.
    /// Returns how many identities were collected, or `None` if no such chunk.
    pub fn delete_chunk(&mut self, context: &str, id: i64) -> Result<Option<usize>> {
        let rows = self
            .conn
            .execute("DELETE FROM chunks WHERE id = ?", params![id])?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(self.gc_identities(context)?.len()))
    }

    /// Deletes chunks (and their children) in one transaction without
    /// collecting identities; callers run [`Db::gc_identities`] afterwards.
    pub fn delete_chunks(&mut self, ids: &[i64]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        for id in ids {
            deleted += tx.execute("DELETE FROM chunks WHERE id = ?", params![id])?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Removes chunks of `file_id` whose entity is no longer in `keep`.
    /// Column chunks are owned by the lineage pass and never pruned here.
    /// Returns `(pruned chunks, collected identities)`.
    pub fn prune_file_chunks(
        &mut self,
        context: &str,
        file_id: i64,
        keep: &HashSet<String>,
    ) -> Result<(usize, usize)> {
        let stale: Vec<i64> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, full_name FROM chunks WHERE file_id = ? AND full_name IS NOT NULL AND kind != 'table_column'",
            )?;
            let rows = stmt.query_map(params![file_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut stale = Vec::new();
            for row in rows {
                let (id, name) = row?;
                if !keep.contains(&name) {
                    stale.push(id);
                }
            }
            stale
        };

        if stale.is_empty() {
            return Ok((0, 0));
        }

        self.delete_chunks(&stale)?;
        let collected = self.gc_identities(context)?;
        Ok((stale.len(), collected.len()))
    }

    pub fn count_chunks(&self, context: &str, level: Option<ChunkLevel>) -> Result<usize> {
        self.conn.query_row(
            r#"
            SELECT count(*) FROM chunks c JOIN files f ON f.id = c.file_id
            WHERE f.context = ?1 AND (?2 IS NULL OR c.level = ?2)
            "#,
            params![context, level.map(ChunkLevel::as_i64)],
            |row| row.get(0),
        )
    }

    /// Level-0 chunks whose full name carries no namespace qualifier.
    pub fn count_unqualified_source_chunks(&self, context: &str) -> Result<usize> {
        self.conn.query_row(
            r#"
            SELECT count(*) FROM chunks c JOIN files f ON f.id = c.file_id
            WHERE f.context = ? AND c.level = 0 AND c.full_name IS NOT NULL AND instr(c.full_name, '.') = 0
            "#,
            params![context],
            |row| row.get(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(full_name: &str, body: &str) -> ChunkBody {
        ChunkBody::Source(SourceBody {
            full_name: full_name.to_string(),
            short_name: full_name.rsplit('.').next().unwrap_or(full_name).to_string(),
            kind: EntityKind::Function,
            signature: None,
            comment: None,
            body: body.to_string(),
            parent: None,
            start_line: Some(1),
            end_line: Some(1),
            detail: None,
        })
    }

    #[test]
    fn test_upsert_chunk_create_update_unchanged() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();

        let first = db
            .upsert_chunk(file, Some("public.f"), &source("public.f", "v1"), "function", None)
            .unwrap();
        assert_eq!(first.status, WriteStatus::Created);

        let same = db
            .upsert_chunk(file, Some("public.f"), &source("public.f", "v1"), "function", None)
            .unwrap();
        assert_eq!(same, ChunkWrite { id: first.id, status: WriteStatus::Unchanged });

        let changed = db
            .upsert_chunk(file, Some("public.f"), &source("public.f", "v2"), "function", None)
            .unwrap();
        assert_eq!(changed, ChunkWrite { id: first.id, status: WriteStatus::Updated });

        // Level is part of the key.
        let rel = db
            .upsert_chunk(file, Some("public.f"), &ChunkBody::Relations(RelationSet::default()), "function", Some(first.id))
            .unwrap();
        assert_ne!(rel.id, first.id);
        assert_eq!(db.count_chunks("ctx", None).unwrap(), 2);

        let stored = db.get_chunk(first.id).unwrap().unwrap();
        assert_eq!(stored.body.as_source().unwrap().body, "v2");
    }

    #[test]
    fn test_upsert_chunk_without_name_matches_content() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "notes.sql", "sql").unwrap();
        let body = ChunkBody::Enrichment(EnrichmentGraph {
            logic: "sums order lines".into(),
            graph: serde_json::json!({"nodes": []}),
        });

        let a = db.upsert_chunk(file, None, &body, "analysis", None).unwrap();
        let b = db.upsert_chunk(file, None, &body, "analysis", None).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.status, WriteStatus::Unchanged);
    }

    #[test]
    fn test_attach_identity_and_delete_chunk_gc() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();
        let l0 = db
            .upsert_chunk(file, Some("public.f"), &source("public.f", "x"), "function", None)
            .unwrap();
        let l1 = db
            .upsert_chunk(file, Some("public.f"), &ChunkBody::Relations(RelationSet::default()), "function", Some(l0.id))
            .unwrap();
        let id = db
            .upsert_identity(
                "ctx",
                &NewIdentity {
                    full_name: "public.f",
                    kind: "function",
                    short_name: Some("f"),
                    display_name: None,
                    file_id: Some(file),
                },
            )
            .unwrap();
        assert_eq!(db.attach_identity(l0.id, id).unwrap(), 2);
        assert_eq!(db.get_chunk(l1.id).unwrap().unwrap().identity_id, Some(id));
        // Already attached rows are not rewritten.
        assert_eq!(db.attach_identity(l0.id, id).unwrap(), 0);

        assert_eq!(db.delete_chunk("ctx", l0.id).unwrap(), Some(1));
        assert_eq!(db.count_identities("ctx").unwrap(), 0);
        // Children go with their parent.
        assert!(db.get_chunk(l1.id).unwrap().is_none());
        assert_eq!(db.delete_chunk("ctx", l0.id).unwrap(), None);
    }

    #[test]
    fn test_table_shape_and_routines() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "schema.sql", "sql").unwrap();
        let table = ChunkBody::Source(SourceBody {
            full_name: "public.orders".into(),
            short_name: "orders".into(),
            kind: EntityKind::Table,
            signature: None,
            comment: None,
            body: "CREATE TABLE public.orders (id int);".into(),
            parent: None,
            start_line: Some(1),
            end_line: Some(1),
            detail: Some(EntityDetail::Table(TableShape {
                schema: "public".into(),
                columns: vec![ColumnDef {
                    name: "id".into(),
                    data_type: "int".into(),
                    nullable: true,
                    primary_key: false,
                    unique: false,
                    default: None,
                    references: None,
                    comment: None,
                }],
                ..Default::default()
            })),
        });
        db.upsert_chunk(file, Some("public.orders"), &table, "table", None).unwrap();
        db.upsert_chunk(file, Some("public.f"), &source("public.f", "x"), "function", None).unwrap();

        let shape = db.table_shape("ctx", "PUBLIC.ORDERS").unwrap().unwrap();
        assert!(shape.column("ID").is_some());
        assert!(db.table_shape("ctx", "public.f").unwrap().is_none());
        assert!(db.table_shape("other", "public.orders").unwrap().is_none());

        let routines = db.routines("ctx").unwrap();
        assert_eq!(routines.len(), 1);
        assert_eq!(routines[0].full_name.as_deref(), Some("public.f"));
    }

    #[test]
    fn test_prune_file_chunks() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();
        for name in ["public.keep", "public.gone"] {
            let w = db
                .upsert_chunk(file, Some(name), &source(name, "x"), "function", None)
                .unwrap();
            let id = db
                .upsert_identity(
                    "ctx",
                    &NewIdentity {
                        full_name: name,
                        kind: "function",
                        short_name: None,
                        display_name: None,
                        file_id: Some(file),
                    },
                )
                .unwrap();
            db.attach_identity(w.id, id).unwrap();
        }

        let keep: HashSet<String> = ["public.keep".to_string()].into_iter().collect();
        assert_eq!(db.prune_file_chunks("ctx", file, &keep).unwrap(), (1, 1));
        assert!(db.get_identity("ctx", "public.gone").unwrap().is_none());
        assert!(db.get_identity("ctx", "public.keep").unwrap().is_some());
        assert_eq!(db.prune_file_chunks("ctx", file, &keep).unwrap(), (0, 0));
    }
}
