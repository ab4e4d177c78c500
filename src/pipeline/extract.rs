use super::{Pipeline, RunState, Step, StepLog, StepReport, UnitError};
use crate::error::IndexError;
use crate::indexer::core::{PreparedUnit, UnitReport, persist_unit};
use crate::indexer::lineage::{self, LineageReport, LineageSummary};
use crate::source::UnitRef;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counters over a whole extract run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractTotals {
    pub units: usize,
    pub indexed: usize,
    pub failed: usize,
    pub files: usize,
    pub entities: usize,
    pub identities: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub links: usize,
    pub pruned: usize,
    pub collected: usize,
    pub issues: usize,
}

impl ExtractTotals {
    fn add(&mut self, unit: &UnitReport) {
        self.indexed += 1;
        self.entities += unit.entities;
        self.created += unit.created;
        self.updated += unit.updated;
        self.unchanged += unit.unchanged;
        self.links += unit.links;
        self.pruned += unit.pruned;
        self.collected += unit.collected;
        self.issues += unit.issues.len();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractReport {
    pub totals: ExtractTotals,
    pub units: Vec<UnitReport>,
    pub errors: Vec<UnitError>,
    #[serde(default)]
    pub lineage: LineageSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage_reports: Vec<LineageReport>,
    pub log: Vec<super::LogLine>,
}

/// Reads and prepares `batch` off the async runtime, keeping unit order.
async fn prepare_batch(pipeline: &Pipeline, batch: &[UnitRef]) -> Vec<(UnitRef, Result<PreparedUnit, IndexError>)> {
    let handles: Vec<_> = batch
        .iter()
        .map(|unit| {
            let provider = Arc::clone(&pipeline.provider);
            let indexer = pipeline.indexer.clone();
            let unit = unit.clone();
            tokio::task::spawn_blocking(move || {
                provider
                    .read(&unit)
                    .map(|source| indexer.prepare_unit(&source))
            })
        })
        .collect();

    let mut out = Vec::with_capacity(batch.len());
    for (unit, handle) in batch.iter().zip(handles) {
        let prepared = handle.await.unwrap_or_else(|e| {
            Err(IndexError::UnitRead {
                unit: unit.name.clone(),
                reason: format!("worker failed: {e}"),
            })
        });
        out.push((unit.clone(), prepared));
    }
    out
}

pub(super) async fn run(pipeline: &Pipeline, mut state: RunState) -> RunState {
    let context = state.context.clone();
    let mut log = StepLog::default();
    log.info(format!("extract: listing units for {context}"));

    let provider = Arc::clone(&pipeline.provider);
    let ctx = context.clone();
    let listed = match tokio::task::spawn_blocking(move || provider.list(&ctx)).await {
        Ok(listed) => listed,
        Err(e) => Err(IndexError::Setup(format!("unit listing task failed: {e}"))),
    };
    let units = match listed {
        Ok(units) => units,
        Err(e) => {
            log.error(format!("extract: {e}"));
            let report = ExtractReport {
                log: log.into_lines(),
                ..Default::default()
            };
            state.fail(e.to_string(), Some(StepReport::Extract(report)));
            return state;
        }
    };

    let mut report = ExtractReport::default();
    report.totals.units = units.len();
    state.set_total(units.len());
    pipeline.registry.update(&state).await;
    log.info(format!("extract: {} units, {} workers", units.len(), pipeline.workers));

    let mut processed = 0;
    for batch in units.chunks(pipeline.workers) {
        for (unit, prepared) in prepare_batch(pipeline, batch).await {
            let outcome = match prepared {
                Ok(prepared) => {
                    let mut db = pipeline.indexer.db.lock().await;
                    persist_unit(&mut db, &context, &prepared)
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(unit_report) => {
                    report.totals.add(&unit_report);
                    report.units.push(unit_report);
                }
                Err(e) => {
                    log.warn(format!("extract: {} failed: {e}", unit.name));
                    report.totals.failed += 1;
                    report.errors.push(UnitError::new(Step::Extract, &unit.name, &e));
                }
            }
            processed += 1;
            state.advance(processed);
            pipeline.progress(&state).await;
        }
    }

    let mut db = pipeline.indexer.db.lock().await;
    match lineage::run_lineage_pass(&mut db, &context) {
        Ok((summary, reports)) => {
            log.info(format!(
                "extract: lineage over {} routines, {} columns",
                summary.routines, summary.columns
            ));
            report.lineage = summary;
            report.lineage_reports = reports;
        }
        Err(e) => {
            let e = IndexError::from(e);
            log.error(format!("extract: lineage pass failed: {e}"));
            report.errors.push(UnitError::new(Step::Extract, "<lineage>", &e));
        }
    }

    match (db.list_files(&context), db.count_identities(&context)) {
        (Ok(files), Ok(identities)) => {
            report.totals.files = files.len();
            report.totals.identities = identities;
        }
        (Err(e), _) | (_, Err(e)) => log.warn(format!("extract: cannot read store totals: {e}")),
    }
    drop(db);

    log.info(format!(
        "extract: {} indexed, {} failed, {} created, {} updated, {} unchanged",
        report.totals.indexed,
        report.totals.failed,
        report.totals.created,
        report.totals.updated,
        report.totals.unchanged
    ));
    report.log = log.into_lines();
    state.complete(StepReport::Extract(report));
    state
}
