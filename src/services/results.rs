use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::app_state::AppState;
use crate::models::job::JobProgress;
use crate::services::evaluation::EvaluationApi;
use crate::services::orchestrator::CompletionHook;

/// Final state of a settled job, handed to whoever is waiting on it.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledResults {
    pub job_key: String,
    pub location: String,
    pub progress: JobProgress,
}

/// Completion hook that refreshes the final counters of a settled job, then
/// reports where its results can be viewed.
pub struct ResultsNavigator {
    state: AppState,
    done: Mutex<Option<oneshot::Sender<SettledResults>>>,
}

impl ResultsNavigator {
    pub fn new(state: AppState) -> (Self, oneshot::Receiver<SettledResults>) {
        let (tx, rx) = oneshot::channel();
        let navigator = Self {
            state,
            done: Mutex::new(Some(tx)),
        };
        (navigator, rx)
    }
}

#[async_trait]
impl CompletionHook for ResultsNavigator {
    async fn on_settled(&self, job_key: &str, progress: &JobProgress) {
        let progress = match self.state.evaluation.fetch_progress(job_key).await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::warn!(job_key = %job_key, error = %e, "Failed to refresh final progress");
                *progress
            }
        };

        let location = self.state.results_location(job_key);
        tracing::info!(
            job_key = %job_key,
            completed = progress.completed,
            failed = progress.failed,
            location = %location,
            "Opening evaluation results"
        );

        let sender = self
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(SettledResults {
                job_key: job_key.to_string(),
                location,
                progress,
            });
        }
    }
}
