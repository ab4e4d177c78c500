//! Two-step indexing runs: extract, then fix-links.
//!
//! Runs execute on spawned tasks; callers get a handle back immediately and
//! follow progress through [`Pipeline::get_status`] and
//! [`Pipeline::get_history`]. At most one run per `(context, step)` is
//! active at a time.
use crate::config::Config;
use crate::db::SharedDb;
use crate::error::{IndexError, PipelineError};
use crate::indexer::core::{Indexer, UnitReport};
use crate::indexer::languages::{Denylists, LanguageConfig};
use crate::indexer::lineage;
use crate::source::{SourceUnitProvider, UnitRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod extract;
pub mod fix_links;
pub mod history;
pub mod registry;
pub mod step_log;

pub use extract::{ExtractReport, ExtractTotals};
pub use fix_links::{AmbiguousTarget, FixLinksReport, MissingTarget, Rewrite};
pub use history::RunHistory;
pub use registry::RunRegistry;
pub use step_log::{LogLevel, LogLine, StepLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Step {
    #[serde(rename = "extract")]
    Extract,
    #[serde(rename = "fix-links")]
    FixLinks,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Extract => "extract",
            Step::FixLinks => "fix-links",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract" => Ok(Step::Extract),
            "fix-links" | "fix_links" => Ok(Step::FixLinks),
            other => Err(format!("unknown step: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A per-unit failure recorded in a step report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub step: Step,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl UnitError {
    pub fn new(step: Step, unit: &str, error: &IndexError) -> Self {
        Self {
            step,
            unit: unit.to_string(),
            entity: None,
            kind: error.kind().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepReport {
    Extract(ExtractReport),
    FixLinks(FixLinksReport),
}

impl StepReport {
    pub fn as_extract(&self) -> Option<&ExtractReport> {
        match self {
            StepReport::Extract(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_fix_links(&self) -> Option<&FixLinksReport> {
        match self {
            StepReport::FixLinks(r) => Some(r),
            _ => None,
        }
    }
}

/// Snapshot of one `(context, step)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub context: String,
    pub step: Step,
    pub status: RunStatus,
    pub progress: u8,
    pub items_processed: usize,
    pub total_items: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub report: Option<StepReport>,
    pub session_id: String,
}

impl RunState {
    pub fn new(context: &str, step: Step) -> Self {
        Self {
            context: context.to_string(),
            step,
            status: RunStatus::Pending,
            progress: 0,
            items_processed: 0,
            total_items: 0,
            started_at: None,
            completed_at: None,
            error: None,
            report: None,
            session_id: String::new(),
        }
    }

    /// `round(processed / total * 100)`, capped at 100; 0 for an empty run.
    pub fn progress_of(processed: usize, total: usize) -> u8 {
        if total == 0 {
            return 0;
        }
        let pct = (processed as f64 / total as f64 * 100.0).round();
        pct.min(100.0) as u8
    }

    /// Running or queued behind a running step.
    pub fn is_active(&self) -> bool {
        match self.status {
            RunStatus::Running => true,
            RunStatus::Pending => !self.session_id.is_empty(),
            _ => false,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
        self.report = None;
        self.items_processed = 0;
        self.total_items = 0;
        self.progress = 0;
    }

    pub(crate) fn set_total(&mut self, total: usize) {
        self.total_items = total;
        self.progress = Self::progress_of(self.items_processed, total);
    }

    pub(crate) fn advance(&mut self, processed: usize) {
        self.items_processed = processed;
        self.progress = Self::progress_of(processed, self.total_items);
    }

    pub(crate) fn complete(&mut self, report: StepReport) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.report = Some(report);
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>, report: Option<StepReport>) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.report = report;
    }
}

/// A run started in the background.
pub struct RunHandle {
    pub context: String,
    pub session_id: String,
    /// State of the first step at the moment the run was accepted.
    pub initial: RunState,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    /// Waits for the run and returns the state of the last step it executed.
    pub async fn wait(self) -> Result<RunState, PipelineError> {
        Ok(self.task.await?)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub snapshot_every: usize,
    pub history_capacity: usize,
    pub history_path: Option<PathBuf>,
    pub denylists: Denylists,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            snapshot_every: 10,
            history_capacity: 1000,
            history_path: None,
            denylists: Denylists::defaults(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            snapshot_every: config.history.snapshot_every,
            history_capacity: config.history.capacity,
            history_path: config.history.path.as_ref().map(PathBuf::from),
            denylists: config.denylists(),
        }
    }
}

/// Drives extract and fix-links runs over the units of a provider.
#[derive(Clone)]
pub struct Pipeline {
    pub(crate) indexer: Indexer,
    pub(crate) provider: Arc<dyn SourceUnitProvider>,
    pub(crate) registry: RunRegistry,
    pub(crate) history: Arc<TokioMutex<RunHistory>>,
    pub(crate) workers: usize,
    pub(crate) snapshot_every: usize,
}

impl Pipeline {
    pub fn new(db: SharedDb, provider: Arc<dyn SourceUnitProvider>, options: PipelineOptions) -> Self {
        let history = match &options.history_path {
            Some(path) => RunHistory::with_path(options.history_capacity, path),
            None => RunHistory::new(options.history_capacity),
        };
        Self {
            indexer: Indexer::new(db, options.denylists),
            provider,
            registry: RunRegistry::new(),
            history: Arc::new(TokioMutex::new(history)),
            workers: options.workers.max(1),
            snapshot_every: options.snapshot_every.max(1),
        }
    }

    /// Shares an existing registry instead of the pipeline's own.
    pub fn with_registry(mut self, registry: RunRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn db(&self) -> &SharedDb {
        &self.indexer.db
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Starts extract chained into fix-links. Rejected while either step of
    /// the context is active.
    pub async fn start_run(&self, context: &str) -> Result<RunHandle, PipelineError> {
        let session_id = new_session_id(context);
        let previous = self
            .registry
            .begin(context, &[Step::Extract, Step::FixLinks], &session_id)
            .await?;
        let initial = self.registry.get(context, Step::Extract).await;
        self.snapshot(&initial).await;
        info!("Started run {session_id} for {context}");

        let pipeline = self.clone();
        let ctx = context.to_string();
        let queued = previous.into_iter().nth(1).flatten();
        let first = initial.clone();
        let task = tokio::spawn(async move {
            let extracted = pipeline.execute(first).await;
            if extracted.status != RunStatus::Completed {
                pipeline.registry.release(&ctx, Step::FixLinks, queued).await;
                return extracted;
            }
            let mut state = pipeline.registry.get(&ctx, Step::FixLinks).await;
            state.start();
            pipeline.registry.update(&state).await;
            pipeline.snapshot(&state).await;
            pipeline.execute(state).await
        });

        Ok(RunHandle {
            context: context.to_string(),
            session_id,
            initial,
            task,
        })
    }

    /// Starts a single step.
    pub async fn start_step(&self, context: &str, step: Step) -> Result<RunHandle, PipelineError> {
        let session_id = new_session_id(context);
        self.registry.begin(context, &[step], &session_id).await?;
        let initial = self.registry.get(context, step).await;
        self.snapshot(&initial).await;
        info!("Started {step} {session_id} for {context}");

        let pipeline = self.clone();
        let first = initial.clone();
        let task = tokio::spawn(async move { pipeline.execute(first).await });
        Ok(RunHandle {
            context: context.to_string(),
            session_id,
            initial,
            task,
        })
    }

    /// Runs one step to a terminal state. A step task that panics is
    /// recorded as `Failed` so the key can be claimed again.
    async fn execute(&self, state: RunState) -> RunState {
        let pipeline = self.clone();
        let (context, step) = (state.context.clone(), state.step);
        let task = tokio::spawn(async move {
            match state.step {
                Step::Extract => extract::run(&pipeline, state).await,
                Step::FixLinks => fix_links::run(&pipeline, state).await,
            }
        });
        let state = match task.await {
            Ok(state) => state,
            Err(e) => {
                warn!("{step} task for {context} aborted: {e}");
                let mut failed = self.registry.get(&context, step).await;
                failed.fail(format!("{step} task failed: {e}"), None);
                failed
            }
        };
        self.registry.update(&state).await;
        self.snapshot(&state).await;
        let history = self.history.lock().await;
        if let Err(e) = history.save() {
            warn!("Failed to persist run history: {e}");
        }
        state
    }

    pub async fn get_status(&self, context: &str, step: Step) -> RunState {
        self.registry.get(context, step).await
    }

    /// The last `limit` snapshots, oldest first.
    pub async fn get_history(&self, context: &str, step: Step, limit: usize) -> Vec<RunState> {
        self.history.lock().await.recent(context, step, limit)
    }

    /// Publishes a progress snapshot; every `snapshot_every` items it is also
    /// appended to the history.
    pub(crate) async fn progress(&self, state: &RunState) {
        self.registry.update(state).await;
        if state.items_processed % self.snapshot_every == 0 {
            self.snapshot(state).await;
        }
    }

    pub(crate) async fn snapshot(&self, state: &RunState) {
        self.history.lock().await.append(state.clone());
    }

    /// Re-indexes one unit outside a run, then refreshes column lineage.
    pub async fn reindex_unit(&self, context: &str, name: &str) -> Result<UnitReport, PipelineError> {
        self.ensure_idle(context).await?;
        let unit = unit_ref(name)?;
        let provider = Arc::clone(&self.provider);
        let source = tokio::task::spawn_blocking(move || provider.read(&unit)).await??;
        let report = self.indexer.index_unit(context, &source).await?;

        let mut db = self.indexer.db.lock().await;
        lineage::run_lineage_pass(&mut db, context)?;
        Ok(report)
    }

    /// Deletes a unit with everything derived from it. Returns the number of
    /// collected identities, or `None` if the unit was never indexed.
    pub async fn remove_unit(&self, context: &str, name: &str) -> Result<Option<usize>, PipelineError> {
        self.ensure_idle(context).await?;
        let mut db = self.indexer.db.lock().await;
        let Some(collected) = db.delete_file(context, name)? else {
            return Ok(None);
        };
        let summary = lineage::consolidate_columns(&mut db, context)?;
        info!("Removed {name} from {context}");
        Ok(Some(collected + summary.collected_identities))
    }

    async fn ensure_idle(&self, context: &str) -> Result<(), PipelineError> {
        if self.registry.get(context, Step::Extract).await.is_active() {
            return Err(PipelineError::Conflict {
                context: context.to_string(),
                step: Step::Extract.to_string(),
            });
        }
        Ok(())
    }
}

fn new_session_id(context: &str) -> String {
    format!("{context}-{}", Utc::now().format("%Y%m%d%H%M%S%6f"))
}

fn unit_ref(name: &str) -> Result<UnitRef, IndexError> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(LanguageConfig::get_by_extension)
        .map(|config| UnitRef {
            name: name.to_string(),
            language: config.language,
        })
        .ok_or_else(|| IndexError::UnitRead {
            unit: name.to_string(),
            reason: "unsupported file type".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_formula() {
        assert_eq!(RunState::progress_of(0, 0), 0);
        assert_eq!(RunState::progress_of(1, 3), 33);
        assert_eq!(RunState::progress_of(2, 3), 67);
        assert_eq!(RunState::progress_of(5, 4), 100);
    }

    #[test]
    fn test_step_names() {
        assert_eq!("fix-links".parse::<Step>(), Ok(Step::FixLinks));
        assert_eq!(Step::Extract.to_string(), "extract");
        let json = serde_json::to_string(&Step::FixLinks).unwrap();
        assert_eq!(json, r#""fix-links""#);
        assert!("load".parse::<Step>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        let mut state = RunState::new("ctx", Step::Extract);
        assert!(!state.is_active());
        state.start();
        assert!(state.is_active());
        state.set_total(4);
        state.advance(1);
        assert_eq!(state.progress, 25);
        state.fail("boom", None);
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.completed_at.is_some());
        assert!(!state.is_active());
    }
}
