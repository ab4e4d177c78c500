use crate::db::models::{ChunkBody, LinkType, NewIdentity, RelationSet, WriteStatus};
use crate::db::{Db, SharedDb};
use crate::error::IndexError;
use crate::indexer::code_parser::{CodeParser, Entity, ExtractionIssue};
use crate::indexer::languages::{Denylists, Language};
use crate::indexer::relations::DependencyAnalyzer;
use crate::source::SourceUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Extraction and analysis output for one unit, ready to persist.
#[derive(Debug, Clone)]
pub struct PreparedUnit {
    pub name: String,
    pub language: Language,
    pub entities: Vec<(Entity, RelationSet)>,
    pub issues: Vec<ExtractionIssue>,
}

/// What persisting one unit changed in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: String,
    pub language: String,
    pub new_file: bool,
    pub entities: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub links: usize,
    pub pruned: usize,
    pub collected: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ExtractionIssue>,
}

impl UnitReport {
    fn count(&mut self, status: WriteStatus) {
        match status {
            WriteStatus::Created => self.created += 1,
            WriteStatus::Updated => self.updated += 1,
            WriteStatus::Unchanged => self.unchanged += 1,
        }
    }
}

/// Turns source units into chunks, identities and links.
#[derive(Clone)]
pub struct Indexer {
    pub db: SharedDb,
    parser: Arc<CodeParser>,
    analyzer: Arc<DependencyAnalyzer>,
}

impl Indexer {
    pub fn new(db: SharedDb, denylists: Denylists) -> Self {
        Self {
            db,
            parser: Arc::new(CodeParser::new()),
            analyzer: Arc::new(DependencyAnalyzer::new(denylists)),
        }
    }

    /// Extracts entities and their relations. Touches no state.
    pub fn prepare_unit(&self, unit: &SourceUnit) -> PreparedUnit {
        let extraction = self.parser.parse_code(&unit.text, unit.language);

        // A name defined twice in one unit keeps its last definition.
        let mut seen = HashSet::new();
        let mut entities: Vec<(Entity, RelationSet)> = Vec::with_capacity(extraction.entities.len());
        for entity in extraction.entities.into_iter().rev() {
            if !seen.insert(entity.full_name.clone()) {
                debug!("{}: duplicate definition of {}", unit.name, entity.full_name);
                continue;
            }
            let relations = self.analyzer.analyze(&entity, unit.language);
            entities.push((entity, relations));
        }
        entities.reverse();

        PreparedUnit {
            name: unit.name.clone(),
            language: unit.language,
            entities,
            issues: extraction.issues,
        }
    }

    /// Prepares and persists one unit under the store lock.
    pub async fn index_unit(&self, context: &str, unit: &SourceUnit) -> Result<UnitReport, IndexError> {
        let prepared = self.prepare_unit(unit);
        let mut db = self.db.lock().await;
        persist_unit(&mut db, context, &prepared)
    }
}

/// Writes a prepared unit: file row, level-0 and level-1 chunks, identities
/// and relation links, then prunes chunks of entities the unit no longer has.
pub fn persist_unit(db: &mut Db, context: &str, unit: &PreparedUnit) -> Result<UnitReport, IndexError> {
    let (file_id, new_file) = db.upsert_file(context, &unit.name, unit.language.as_str())?;
    let mut report = UnitReport {
        unit: unit.name.clone(),
        language: unit.language.as_str().to_string(),
        new_file,
        entities: unit.entities.len(),
        issues: unit.issues.clone(),
        ..Default::default()
    };

    let mut keep = HashSet::with_capacity(unit.entities.len());
    for (entity, relations) in &unit.entities {
        let kind = entity.kind.as_str();
        let name = entity.full_name.as_str();

        let source = db.upsert_chunk(
            file_id,
            Some(name),
            &ChunkBody::Source(entity.to_source_body()),
            kind,
            None,
        )?;
        report.count(source.status);

        let relation = db.upsert_chunk(
            file_id,
            Some(name),
            &ChunkBody::Relations(relations.clone()),
            kind,
            Some(source.id),
        )?;
        report.count(relation.status);

        let identity = db.upsert_identity(
            context,
            &NewIdentity {
                full_name: name,
                kind,
                short_name: Some(entity.short_name.as_str()),
                display_name: entity.signature.as_deref(),
                file_id: Some(file_id),
            },
        )?;
        db.attach_identity(source.id, identity)?;

        report.links += db.replace_links(
            context,
            name,
            LinkType::RELATION_TYPES,
            &relations.edges(),
            Some(file_id),
        )?;
        keep.insert(entity.full_name.clone());
    }

    let (pruned, collected) = db.prune_file_chunks(context, file_id, &keep)?;
    report.pruned = pruned;
    report.collected = collected;

    info!(
        "Indexed {} ({}): {} entities, {} created, {} updated, {} unchanged, {} pruned",
        unit.name, unit.language, report.entities, report.created, report.updated, report.unchanged, report.pruned
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{ChunkLevel, RelationKind};

    const ORDERS_V1: &str = r#"
CREATE TABLE orders (id int PRIMARY KEY, total numeric);

CREATE FUNCTION order_total(p_id int) RETURNS numeric AS $$
BEGIN
    RETURN (SELECT total FROM orders WHERE id = p_id);
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION touch_order(p_id int) RETURNS void AS $$
BEGIN
    UPDATE orders SET total = order_total(p_id) WHERE id = p_id;
END;
$$ LANGUAGE plpgsql;
"#;

    fn indexer() -> Indexer {
        Indexer::new(Db::open_in_memory().unwrap().into_shared(), Denylists::defaults())
    }

    #[tokio::test]
    async fn test_index_unit_is_idempotent() {
        let indexer = indexer();
        let unit = SourceUnit::new("orders.sql", Language::Sql, ORDERS_V1);

        let first = indexer.index_unit("ctx", &unit).await.unwrap();
        assert!(first.new_file);
        assert_eq!(first.entities, 3);
        // one source and one relation chunk per entity
        assert_eq!(first.created, 6);
        assert!(first.links > 0);

        let second = indexer.index_unit("ctx", &unit).await.unwrap();
        assert!(!second.new_file);
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 6);

        let db = indexer.db.lock().await;
        assert_eq!(db.count_identities("ctx").unwrap(), 3);
        assert_eq!(db.count_chunks("ctx", Some(ChunkLevel::Relations)).unwrap(), 3);

        let calls = db.links_from("ctx", "touch_order", Some(LinkType::Calls)).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, "order_total");

        let relations = db.source_chunk("ctx", "touch_order").unwrap().unwrap();
        let children: Vec<_> = db
            .chunks_for_file(relations.file_id)
            .unwrap()
            .into_iter()
            .filter(|c| c.parent_chunk_id == Some(relations.id))
            .collect();
        assert_eq!(children.len(), 1);
        let set = children[0].body.as_relations().unwrap();
        assert_eq!(
            set.targets(RelationKind::UpdateTables).collect::<Vec<_>>(),
            vec!["orders"]
        );
        assert_eq!(children[0].identity_id, relations.identity_id);
    }

    #[tokio::test]
    async fn test_removed_entity_is_pruned() {
        let indexer = indexer();
        indexer
            .index_unit("ctx", &SourceUnit::new("orders.sql", Language::Sql, ORDERS_V1))
            .await
            .unwrap();

        let v2 = ORDERS_V1.split("CREATE FUNCTION touch_order").next().unwrap();
        let report = indexer
            .index_unit("ctx", &SourceUnit::new("orders.sql", Language::Sql, v2))
            .await
            .unwrap();
        assert_eq!(report.entities, 2);
        assert_eq!(report.pruned, 2);
        assert_eq!(report.collected, 1);

        let db = indexer.db.lock().await;
        assert!(db.get_identity("ctx", "touch_order").unwrap().is_none());
        assert!(db.links_from("ctx", "touch_order", None).unwrap().is_empty());
        assert!(db.get_identity("ctx", "order_total").unwrap().is_some());
    }

    #[test]
    fn test_prepare_keeps_last_duplicate() {
        let indexer = indexer();
        let unit = SourceUnit::new(
            "dup.js",
            Language::JavaScript,
            "function a() { first(); }\nfunction a() { second(); }\n",
        );
        let prepared = indexer.prepare_unit(&unit);
        assert_eq!(prepared.entities.len(), 1);
        let (entity, relations) = &prepared.entities[0];
        assert!(entity.body.contains("second"));
        assert_eq!(
            relations.targets(RelationKind::Calls).collect::<Vec<_>>(),
            vec!["second"]
        );
    }
}
