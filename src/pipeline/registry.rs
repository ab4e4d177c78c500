use super::{RunState, Step};
use crate::error::PipelineError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Current state of every `(context, step)`.
///
/// Cloning shares the underlying map; a pipeline is handed one registry and
/// every handle it spawns reports into it.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<TokioMutex<HashMap<(String, Step), RunState>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `steps` of `context` in one check-and-set.
    ///
    /// The first step becomes `Running`, later ones `Pending` (queued behind
    /// it). If any of them is already active nothing is touched and a
    /// conflict is returned. Returns the previous states so a queued step can
    /// be released.
    pub async fn begin(
        &self,
        context: &str,
        steps: &[Step],
        session_id: &str,
    ) -> Result<Vec<Option<RunState>>, PipelineError> {
        let mut runs = self.runs.lock().await;
        for step in steps {
            let key = (context.to_string(), *step);
            if runs.get(&key).is_some_and(RunState::is_active) {
                return Err(PipelineError::Conflict {
                    context: context.to_string(),
                    step: step.to_string(),
                });
            }
        }

        let mut previous = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let mut state = RunState::new(context, *step);
            state.session_id = session_id.to_string();
            if i == 0 {
                state.start();
            }
            previous.push(runs.insert((context.to_string(), *step), state));
        }
        Ok(previous)
    }

    pub async fn update(&self, state: &RunState) {
        self.runs
            .lock()
            .await
            .insert((state.context.clone(), state.step), state.clone());
    }

    /// Puts back the state a queued step had before it was claimed.
    pub async fn release(&self, context: &str, step: Step, previous: Option<RunState>) {
        let mut runs = self.runs.lock().await;
        let key = (context.to_string(), step);
        match previous {
            Some(state) => {
                runs.insert(key, state);
            }
            None => {
                runs.remove(&key);
            }
        }
    }

    /// Snapshot of a key; a never-run key reports `Pending`.
    pub async fn get(&self, context: &str, step: Step) -> RunState {
        self.runs
            .lock()
            .await
            .get(&(context.to_string(), step))
            .cloned()
            .unwrap_or_else(|| RunState::new(context, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RunStatus;

    #[tokio::test]
    async fn test_begin_rejects_running_key() {
        let registry = RunRegistry::new();
        registry.begin("ctx", &[Step::Extract], "s1").await.unwrap();

        let mut running = registry.get("ctx", Step::Extract).await;
        running.set_total(10);
        running.advance(4);
        registry.update(&running).await;

        let err = registry.begin("ctx", &[Step::Extract], "s2").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { ref step, .. } if step == "extract"));

        let current = registry.get("ctx", Step::Extract).await;
        assert_eq!(current.session_id, "s1");
        assert_eq!(current.items_processed, 4);
        assert_eq!(current.progress, 40);

        // Other contexts are independent.
        assert!(registry.begin("other", &[Step::Extract], "s3").await.is_ok());
    }

    #[tokio::test]
    async fn test_chained_claim_and_release() {
        let registry = RunRegistry::new();
        let previous = registry
            .begin("ctx", &[Step::Extract, Step::FixLinks], "s1")
            .await
            .unwrap();
        assert_eq!(previous, vec![None, None]);
        assert_eq!(registry.get("ctx", Step::Extract).await.status, RunStatus::Running);
        assert_eq!(registry.get("ctx", Step::FixLinks).await.status, RunStatus::Pending);

        // The queued step blocks a direct start.
        assert!(registry.begin("ctx", &[Step::FixLinks], "s2").await.is_err());

        registry.release("ctx", Step::FixLinks, None).await;
        assert!(registry.get("ctx", Step::FixLinks).await.session_id.is_empty());
        assert!(registry.begin("ctx", &[Step::FixLinks], "s2").await.is_ok());
    }
}
