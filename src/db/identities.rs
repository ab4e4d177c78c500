use super::{Db, escape_like, models::*};
use crate::error::StoreError;
use chrono::Utc;
use rusqlite::{ErrorCode, OptionalExtension, Result, Row, params};
use tracing::{info, warn};

const IDENTITY_COLUMNS: &str =
    "id, full_name, context, kind, short_name, display_name, file_id, created_at, updated_at";

fn map_identity(row: &Row<'_>) -> Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        full_name: row.get(1)?,
        context: row.get(2)?,
        kind: row.get(3)?,
        short_name: row.get(4)?,
        display_name: row.get(5)?,
        file_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Errors worth one retry: a racing writer on another connection.
fn is_write_race(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                ErrorCode::ConstraintViolation | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
    )
}

impl Db {
    /// Creates the identity for `(full_name, context)` or refreshes its
    /// metadata and timestamp. A racing insert is retried once, then
    /// reported as [`StoreError::IdentityConflict`].
    pub fn upsert_identity(&self, context: &str, new: &NewIdentity<'_>) -> std::result::Result<i64, StoreError> {
        match self.try_upsert_identity(context, new) {
            Ok(id) => Ok(id),
            Err(e) if is_write_race(&e) => {
                warn!("Identity write raced for {}, retrying: {e}", new.full_name);
                self.try_upsert_identity(context, new).map_err(|e| {
                    if is_write_race(&e) {
                        StoreError::IdentityConflict {
                            context: context.to_string(),
                            full_name: new.full_name.to_string(),
                        }
                    } else {
                        e.into()
                    }
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_upsert_identity(&self, context: &str, new: &NewIdentity<'_>) -> Result<i64> {
        self.conn.query_row(
            r#"
            INSERT INTO identities (full_name, context, kind, short_name, display_name, file_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(full_name, context) DO UPDATE SET
                kind = excluded.kind,
                short_name = COALESCE(excluded.short_name, identities.short_name),
                display_name = COALESCE(excluded.display_name, identities.display_name),
                file_id = COALESCE(excluded.file_id, identities.file_id),
                updated_at = excluded.updated_at
            RETURNING id
            "#,
            params![
                new.full_name,
                context,
                new.kind,
                new.short_name,
                new.display_name,
                new.file_id,
                Utc::now(),
            ],
            |row| row.get(0),
        )
    }

    pub fn get_identity(&self, context: &str, full_name: &str) -> Result<Option<Identity>> {
        self.conn
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE context = ? AND full_name = ?"),
                params![context, full_name],
                map_identity,
            )
            .optional()
    }

    /// Every identity whose `full_name` ends in `.<short_name>` (case-sensitive).
    pub fn find_identity_by_suffix(&self, context: &str, short_name: &str) -> Result<Vec<Identity>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {IDENTITY_COLUMNS} FROM identities
            WHERE context = ?1
              AND length(full_name) > length(?2) + 1
              AND substr(full_name, length(full_name) - length(?2)) = '.' || ?2
            ORDER BY full_name
            "#
        ))?;
        let rows = stmt.query_map(params![context, short_name], map_identity)?;

        let mut found = Vec::new();
        for row in rows {
            found.push(row?);
        }
        Ok(found)
    }

    /// Tables and views matching `name`: the exact (case-insensitive) full
    /// name, or, for an unqualified name, any schema-qualified one.
    pub fn find_tables(&self, context: &str, name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT full_name FROM identities
            WHERE context = ?1 AND kind IN ('table', 'view')
              AND (lower(full_name) = lower(?2)
                   OR (instr(?2, '.') = 0 AND lower(full_name) LIKE '%.' || lower(?3) ESCAPE '\'))
            ORDER BY full_name
            "#,
        )?;
        let rows = stmt.query_map(params![context, name, escape_like(name)], |row| row.get(0))?;

        let mut found = Vec::new();
        for row in rows {
            found.push(row?);
        }
        Ok(found)
    }

    pub fn count_identities(&self, context: &str) -> Result<usize> {
        self.conn.query_row(
            "SELECT count(*) FROM identities WHERE context = ?",
            params![context],
            |row| row.get(0),
        )
    }

    /// Identities whose full name carries no namespace qualifier.
    pub fn count_unqualified_identities(&self, context: &str) -> Result<usize> {
        self.conn.query_row(
            "SELECT count(*) FROM identities WHERE context = ? AND instr(full_name, '.') = 0",
            params![context],
            |row| row.get(0),
        )
    }

    /// Deletes identities no level-0 chunk references, together with the
    /// links they were the source of. Returns the collected identities.
    pub fn gc_identities(&mut self, context: &str) -> Result<Vec<Identity>> {
        let tx = self.conn.transaction()?;

        let orphans = {
            let mut stmt = tx.prepare(&format!(
                r#"
                SELECT {IDENTITY_COLUMNS} FROM identities i
                WHERE i.context = ?
                  AND NOT EXISTS (
                      SELECT 1 FROM chunks c WHERE c.identity_id = i.id AND c.level = 0
                  )
                ORDER BY full_name
                "#
            ))?;
            let rows = stmt.query_map(params![context], map_identity)?;
            let mut orphans = Vec::new();
            for row in rows {
                orphans.push(row?);
            }
            orphans
        };

        for identity in &orphans {
            tx.execute(
                "DELETE FROM links WHERE context = ? AND source = ?",
                params![context, identity.full_name],
            )?;
            tx.execute("DELETE FROM identities WHERE id = ?", params![identity.id])?;
        }

        tx.commit()?;

        if !orphans.is_empty() {
            info!("Collected {} orphaned identities in {context}", orphans.len());
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident<'a>(full_name: &'a str, kind: &'a str, file_id: i64) -> NewIdentity<'a> {
        NewIdentity {
            full_name,
            kind,
            short_name: full_name.rsplit('.').next(),
            display_name: None,
            file_id: Some(file_id),
        }
    }

    #[test]
    fn test_upsert_identity_is_stable() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();

        let first = db.upsert_identity("ctx", &ident("billing.calc", "function", file)).unwrap();
        let second = db.upsert_identity("ctx", &ident("billing.calc", "function", file)).unwrap();
        assert_eq!(first, second);
        assert_eq!(db.count_identities("ctx").unwrap(), 1);

        // Same name, different context.
        let other = db.upsert_identity("other", &ident("billing.calc", "function", file)).unwrap();
        assert_ne!(first, other);

        let row = db.get_identity("ctx", "billing.calc").unwrap().unwrap();
        assert_eq!(row.short_name.as_deref(), Some("calc"));
        assert!(row.updated_at >= row.created_at);
    }

    #[test]
    fn test_find_identity_by_suffix() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();
        for name in ["billing.calc", "sales.calc", "billing.calculate", "calc", "x.Calc"] {
            db.upsert_identity("ctx", &ident(name, "function", file)).unwrap();
        }

        let found: Vec<String> = db
            .find_identity_by_suffix("ctx", "calc")
            .unwrap()
            .into_iter()
            .map(|i| i.full_name)
            .collect();
        assert_eq!(found, vec!["billing.calc", "sales.calc"]);
        assert!(db.find_identity_by_suffix("ctx", "missing").unwrap().is_empty());
    }

    #[test]
    fn test_find_tables() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();
        db.upsert_identity("ctx", &ident("public.orders", "table", file)).unwrap();
        db.upsert_identity("ctx", &ident("public.orders_archive", "table", file)).unwrap();
        db.upsert_identity("ctx", &ident("public.orders_fn", "function", file)).unwrap();

        assert_eq!(db.find_tables("ctx", "orders").unwrap(), vec!["public.orders"]);
        assert_eq!(db.find_tables("ctx", "PUBLIC.ORDERS").unwrap(), vec!["public.orders"]);
        assert!(db.find_tables("ctx", "sales.orders").unwrap().is_empty());
    }

    #[test]
    fn test_gc_removes_orphans_and_their_links() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();
        db.upsert_identity("ctx", &ident("public.f", "function", file)).unwrap();
        db.replace_links("ctx", "public.f", &[LinkType::Calls], &[(LinkType::Calls, "public.g".to_string())], Some(file))
            .unwrap();

        let collected = db.gc_identities("ctx").unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].full_name, "public.f");
        assert_eq!(db.count_identities("ctx").unwrap(), 0);
        assert!(db.links_from("ctx", "public.f", None).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers_share_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kb.db");
        {
            let mut db = Db::open(&path).unwrap();
            db.upsert_file("ctx", "a.sql", "sql").unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let db = Db::open(&path).unwrap();
                    for _ in 0..25 {
                        db.upsert_identity("ctx", &ident("public.shared", "function", 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let db = Db::open(&path).unwrap();
        assert_eq!(db.count_identities("ctx").unwrap(), 1);
    }
}
