use super::{Db, models::*};
use rusqlite::types::Value;
use rusqlite::{Result, Row, params};

fn map_link(row: &Row<'_>) -> Result<Link> {
    Ok(Link {
        id: row.get(0)?,
        context: row.get(1)?,
        source: row.get(2)?,
        target: row.get(3)?,
        link_type: row.get(4)?,
        file_id: row.get(5)?,
    })
}

impl Db {
    /// Replaces the outgoing edges of `source` for the given link types.
    ///
    /// Existing edges of those types are deleted first, then `targets` are
    /// inserted; duplicate edges are ignored. Runs in one transaction and
    /// returns how many edges were inserted.
    pub fn replace_links(
        &mut self,
        context: &str,
        source: &str,
        link_types: &[LinkType],
        targets: &[(LinkType, String)],
        file_id: Option<i64>,
    ) -> Result<usize> {
        let tx = self.conn.transaction()?;

        for link_type in link_types {
            tx.execute(
                "DELETE FROM links WHERE context = ? AND source = ? AND link_type = ?",
                params![context, source, link_type.as_str()],
            )?;
        }

        let mut inserted = 0;
        for (link_type, target) in targets {
            inserted += tx.execute(
                r#"
                INSERT INTO links (context, source, target, link_type, file_id)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(context, source, target, link_type) DO NOTHING
                "#,
                params![context, source, target, link_type.as_str(), file_id],
            )?;
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Points one edge at a new target, keeping its owning file.
    pub fn retarget_link(
        &mut self,
        context: &str,
        source: &str,
        link_type: LinkType,
        old_target: &str,
        new_target: &str,
    ) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let file_id: Option<Option<i64>> = {
            let mut stmt = tx.prepare(
                "SELECT file_id FROM links WHERE context = ? AND source = ? AND target = ? AND link_type = ?",
            )?;
            let mut rows = stmt.query(params![context, source, old_target, link_type.as_str()])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        let Some(file_id) = file_id else {
            return Ok(false);
        };

        tx.execute(
            "DELETE FROM links WHERE context = ? AND source = ? AND target = ? AND link_type = ?",
            params![context, source, old_target, link_type.as_str()],
        )?;
        tx.execute(
            r#"
            INSERT INTO links (context, source, target, link_type, file_id)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(context, source, target, link_type) DO NOTHING
            "#,
            params![context, source, new_target, link_type.as_str(), file_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn query_links(
        &self,
        column: &str,
        context: &str,
        name: &str,
        link_type: Option<LinkType>,
    ) -> Result<Vec<Link>> {
        let mut query = format!(
            "SELECT id, context, source, target, link_type, file_id FROM links WHERE context = ? AND {column} = ?"
        );
        let mut params: Vec<Value> = vec![
            Value::Text(context.to_string()),
            Value::Text(name.to_string()),
        ];

        if let Some(lt) = link_type {
            query.push_str(" AND link_type = ?");
            params.push(Value::Text(lt.as_str().to_string()));
        }
        query.push_str(" ORDER BY link_type, source, target");

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(param_refs.as_slice(), map_link)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Edges leaving `source`.
    pub fn links_from(&self, context: &str, source: &str, link_type: Option<LinkType>) -> Result<Vec<Link>> {
        self.query_links("source", context, source, link_type)
    }

    /// Edges pointing at `target`.
    pub fn links_to(&self, context: &str, target: &str, link_type: Option<LinkType>) -> Result<Vec<Link>> {
        self.query_links("target", context, target, link_type)
    }

    /// Distinct targets of the given link types across a context.
    pub fn link_targets(&self, context: &str, link_types: &[LinkType]) -> Result<Vec<String>> {
        let placeholders = vec!["?"; link_types.len()].join(", ");
        let query = format!(
            "SELECT DISTINCT target FROM links WHERE context = ? AND link_type IN ({placeholders}) ORDER BY target"
        );
        let mut params: Vec<Value> = vec![Value::Text(context.to_string())];
        params.extend(link_types.iter().map(|lt| Value::Text(lt.as_str().to_string())));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| row.get(0))?;

        let mut targets = Vec::new();
        for row in rows {
            targets.push(row?);
        }
        Ok(targets)
    }

    pub fn count_links(&self, context: &str) -> Result<usize> {
        self.conn.query_row(
            "SELECT count(*) FROM links WHERE context = ?",
            params![context],
            |row| row.get(0),
        )
    }
}
