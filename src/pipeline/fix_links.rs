use super::{Pipeline, RunState, Step, StepLog, StepReport, UnitError};
use crate::db::Db;
use crate::db::models::{ChunkBody, EntityKind, RelationKind, StoredChunk};
use crate::error::{IndexError, StoreError};
use serde::{Deserialize, Serialize};

/// Separators that mark a name as already qualified.
const QUALIFIERS: &[&str] = &[".", "\\", "/", "->", "::"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    pub source: String,
    pub relation: RelationKind,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingTarget {
    pub source: String,
    pub relation: RelationKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousTarget {
    pub source: String,
    pub relation: RelationKind,
    pub target: String,
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixLinksReport {
    pub chunks: usize,
    pub checked: usize,
    pub exact: usize,
    pub rewritten: Vec<Rewrite>,
    pub missing: Vec<MissingTarget>,
    pub ambiguous: Vec<AmbiguousTarget>,
    pub errors: Vec<UnitError>,
    /// Identities whose full name has no namespace qualifier.
    pub unqualified_identities: usize,
    /// Level-0 chunks whose full name has no namespace qualifier.
    pub unqualified_chunks: usize,
    pub log: Vec<super::LogLine>,
}

fn is_qualified(target: &str) -> bool {
    QUALIFIERS.iter().any(|q| target.contains(q))
}

/// Qualifies the short targets of one relation chunk where exactly one
/// identity ends in `.<target>`; rewrites the chunk and its links in place.
pub fn fix_chunk(db: &mut Db, context: &str, chunk: &StoredChunk, report: &mut FixLinksReport) -> Result<(), StoreError> {
    let (Some(source), Some(relations)) = (chunk.full_name.as_deref(), chunk.body.as_relations()) else {
        return Ok(());
    };
    let mut fixed = relations.clone();
    let mut changed = false;

    for (kind, targets) in &relations.relations {
        if !kind.is_resolvable() {
            continue;
        }
        for target in targets.iter().filter(|t| !is_qualified(t)) {
            report.checked += 1;
            if db.get_identity(context, target)?.is_some() {
                report.exact += 1;
                continue;
            }
            let mut candidates: Vec<String> = db
                .find_identity_by_suffix(context, target)?
                .into_iter()
                .filter(|i| i.kind != EntityKind::Column.as_str())
                .map(|i| i.full_name)
                .collect();
            match candidates.len() {
                0 => report.missing.push(MissingTarget {
                    source: source.to_string(),
                    relation: *kind,
                    target: target.clone(),
                }),
                1 => {
                    let qualified = candidates.remove(0);
                    fixed.rewrite(*kind, target, &qualified);
                    db.retarget_link(context, source, kind.link_type(), target, &qualified)?;
                    report.rewritten.push(Rewrite {
                        source: source.to_string(),
                        relation: *kind,
                        from: target.clone(),
                        to: qualified,
                    });
                    changed = true;
                }
                _ => {
                    candidates.sort();
                    report.ambiguous.push(AmbiguousTarget {
                        source: source.to_string(),
                        relation: *kind,
                        target: target.clone(),
                        candidates,
                    });
                }
            }
        }
    }

    if changed {
        db.update_chunk_body(chunk.id, &ChunkBody::Relations(fixed))?;
    }
    Ok(())
}

pub(super) async fn run(pipeline: &Pipeline, mut state: RunState) -> RunState {
    let context = state.context.clone();
    let mut log = StepLog::default();
    let mut report = FixLinksReport::default();

    let chunks = {
        let db = pipeline.indexer.db.lock().await;
        db.relation_chunks(&context)
    };
    let chunks = match chunks {
        Ok(chunks) => chunks,
        Err(e) => {
            let e = IndexError::from(e);
            log.error(format!("fix-links: cannot list relation chunks: {e}"));
            report.log = log.into_lines();
            state.fail(e.to_string(), Some(StepReport::FixLinks(report)));
            return state;
        }
    };

    report.chunks = chunks.len();
    state.set_total(chunks.len());
    pipeline.registry.update(&state).await;
    log.info(format!("fix-links: {} relation chunks in {context}", chunks.len()));

    for (i, chunk) in chunks.iter().enumerate() {
        let result = {
            let mut db = pipeline.indexer.db.lock().await;
            fix_chunk(&mut db, &context, chunk, &mut report)
        };
        if let Err(e) = result {
            let e = IndexError::from(e);
            let name = chunk.full_name.clone().unwrap_or_default();
            log.warn(format!("fix-links: {name} failed: {e}"));
            let mut error = UnitError::new(Step::FixLinks, &file_name(pipeline, chunk.file_id).await, &e);
            error.entity = Some(name);
            report.errors.push(error);
        }
        state.advance(i + 1);
        pipeline.progress(&state).await;
    }

    {
        let db = pipeline.indexer.db.lock().await;
        match (
            db.count_unqualified_identities(&context),
            db.count_unqualified_source_chunks(&context),
        ) {
            (Ok(identities), Ok(chunks)) => {
                report.unqualified_identities = identities;
                report.unqualified_chunks = chunks;
            }
            (Err(e), _) | (_, Err(e)) => log.warn(format!("fix-links: cannot count unqualified names: {e}")),
        }
    }

    log.info(format!(
        "fix-links: {} rewritten, {} missing, {} ambiguous",
        report.rewritten.len(),
        report.missing.len(),
        report.ambiguous.len()
    ));
    report.log = log.into_lines();
    state.complete(StepReport::FixLinks(report));
    state
}

async fn file_name(pipeline: &Pipeline, file_id: i64) -> String {
    let db = pipeline.indexer.db.lock().await;
    match db.get_file(file_id) {
        Ok(Some(file)) => file.name,
        _ => format!("file #{file_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{LinkType, NewIdentity, RelationSet, SourceBody};

    fn seed(db: &mut Db, file: i64, full_name: &str, kind: EntityKind) -> i64 {
        let body = ChunkBody::Source(SourceBody {
            full_name: full_name.to_string(),
            short_name: full_name.rsplit('.').next().unwrap_or(full_name).to_string(),
            kind,
            signature: None,
            comment: None,
            body: String::new(),
            parent: None,
            start_line: None,
            end_line: None,
            detail: None,
        });
        let chunk = db.upsert_chunk(file, Some(full_name), &body, kind.as_str(), None).unwrap();
        let identity = db
            .upsert_identity(
                "ctx",
                &NewIdentity {
                    full_name,
                    kind: kind.as_str(),
                    short_name: None,
                    display_name: None,
                    file_id: Some(file),
                },
            )
            .unwrap();
        db.attach_identity(chunk.id, identity).unwrap();
        chunk.id
    }

    fn relations(db: &mut Db, file: i64, source: &str, parent: i64, set: RelationSet) -> StoredChunk {
        let write = db
            .upsert_chunk(file, Some(source), &ChunkBody::Relations(set.clone()), "function", Some(parent))
            .unwrap();
        db.replace_links("ctx", source, LinkType::RELATION_TYPES, &set.edges(), Some(file))
            .unwrap();
        db.get_chunk(write.id).unwrap().unwrap()
    }

    #[test]
    fn test_fix_chunk_outcomes() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "billing.sql", "sql").unwrap();
        let caller = seed(&mut db, file, "billing.close_month", EntityKind::Function);
        seed(&mut db, file, "billing.calc_tax", EntityKind::Function);
        seed(&mut db, file, "billing.log", EntityKind::Function);
        seed(&mut db, file, "audit.log", EntityKind::Function);
        seed(&mut db, file, "orders", EntityKind::Table);

        let mut set = RelationSet::default();
        set.insert(RelationKind::Calls, "calc_tax");
        set.insert(RelationKind::Calls, "log");
        set.insert(RelationKind::Calls, "missing_fn");
        set.insert(RelationKind::Calls, "billing.log");
        set.insert(RelationKind::SelectFrom, "orders");
        set.insert(RelationKind::Requires, "helpers");
        let chunk = relations(&mut db, file, "billing.close_month", caller, set);

        let mut report = FixLinksReport::default();
        fix_chunk(&mut db, "ctx", &chunk, &mut report).unwrap();

        assert_eq!(report.checked, 4);
        assert_eq!(report.exact, 1);
        assert_eq!(
            report.rewritten,
            vec![Rewrite {
                source: "billing.close_month".into(),
                relation: RelationKind::Calls,
                from: "calc_tax".into(),
                to: "billing.calc_tax".into(),
            }]
        );
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].target, "missing_fn");
        assert_eq!(report.ambiguous.len(), 1);
        assert_eq!(report.ambiguous[0].candidates, vec!["audit.log", "billing.log"]);

        let stored = db.get_chunk(chunk.id).unwrap().unwrap();
        let calls: Vec<&str> = stored
            .body
            .as_relations()
            .unwrap()
            .targets(RelationKind::Calls)
            .collect();
        assert_eq!(calls, vec!["billing.calc_tax", "billing.log", "log", "missing_fn"]);

        let links: Vec<String> = db
            .links_from("ctx", "billing.close_month", Some(LinkType::Calls))
            .unwrap()
            .into_iter()
            .map(|l| l.target)
            .collect();
        assert!(links.contains(&"billing.calc_tax".to_string()));
        assert!(!links.contains(&"calc_tax".to_string()));

        // A second pass changes nothing.
        let mut again = FixLinksReport::default();
        fix_chunk(&mut db, "ctx", &stored, &mut again).unwrap();
        assert!(again.rewritten.is_empty());
        assert_eq!(again.missing.len(), 1);
        assert_eq!(db.get_chunk(chunk.id).unwrap().unwrap().body, stored.body);
    }

    #[test]
    fn test_columns_are_not_candidates() {
        let mut db = Db::open_in_memory().unwrap();
        let (file, _) = db.upsert_file("ctx", "a.sql", "sql").unwrap();
        let caller = seed(&mut db, file, "f", EntityKind::Function);
        seed(&mut db, file, "orders.total", EntityKind::Column);

        let mut set = RelationSet::default();
        set.insert(RelationKind::Calls, "total");
        let chunk = relations(&mut db, file, "f", caller, set);

        let mut report = FixLinksReport::default();
        fix_chunk(&mut db, "ctx", &chunk, &mut report).unwrap();
        assert!(report.rewritten.is_empty());
        assert_eq!(report.missing.len(), 1);
    }
}
