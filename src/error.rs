//! Error taxonomy shared by the store, the indexer and the pipeline.
//!
//! Per-unit problems are recorded as data and never abort a run; only
//! [`IndexError::Setup`] fails a whole step.

use thiserror::Error;

/// Errors raised by the knowledge store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("chunk payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("identity conflict on `{full_name}` in context `{context}`")]
    IdentityConflict { context: String, full_name: String },
}

/// Errors raised while reading and indexing source units.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("cannot read source unit `{unit}`: {reason}")]
    UnitRead { unit: String, reason: String },

    #[error("setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for IndexError {
    fn from(e: rusqlite::Error) -> Self {
        IndexError::Store(StoreError::Sqlite(e))
    }
}

/// Errors raised by the run orchestrator.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("step `{step}` is already running for context `{context}`")]
    Conflict { context: String, step: String },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Index(IndexError::Store(e))
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Index(e.into())
    }
}

impl IndexError {
    /// Short machine-readable name used in step reports.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::UnitRead { .. } => "unit_read",
            IndexError::Setup(_) => "setup",
            IndexError::Store(StoreError::IdentityConflict { .. }) => "identity_conflict",
            IndexError::Store(_) => "store",
            IndexError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let e = IndexError::UnitRead {
            unit: "a.sql".into(),
            reason: "missing".into(),
        };
        assert_eq!(e.kind(), "unit_read");
        assert_eq!(e.to_string(), "cannot read source unit `a.sql`: missing");

        let e: IndexError = StoreError::IdentityConflict {
            context: "ctx".into(),
            full_name: "public.f".into(),
        }
        .into();
        assert_eq!(e.kind(), "identity_conflict");

        let e: IndexError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(e.kind(), "store");
    }

    #[test]
    fn test_pipeline_conflict_message() {
        let e = PipelineError::Conflict {
            context: "shop".into(),
            step: "extract".into(),
        };
        assert_eq!(e.to_string(), "step `extract` is already running for context `shop`");
    }
}
