use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;

use crate::models::job::{BulkEvaluationJob, JobProgress};
use crate::services::api_client::{ApiClient, ApiError};

const DEFAULT_BULK_EVALUATION_PATH: &str = "/ai-evaluation/bulk";
const DEFAULT_PROGRESS_PATH: &str = "/ai-evaluation/progress";

/// Server operations the orchestrator needs. Implemented over HTTP by
/// [`EvaluationClient`]; tests substitute fakes.
#[async_trait]
pub trait EvaluationApi: Send + Sync {
    async fn submit_bulk_evaluation(&self, job: &BulkEvaluationJob) -> Result<(), EvaluationError>;

    async fn fetch_progress(&self, job_key: &str) -> Result<JobProgress, EvaluationError>;
}

#[async_trait]
impl<T: EvaluationApi + ?Sized> EvaluationApi for Arc<T> {
    async fn submit_bulk_evaluation(&self, job: &BulkEvaluationJob) -> Result<(), EvaluationError> {
        (**self).submit_bulk_evaluation(job).await
    }

    async fn fetch_progress(&self, job_key: &str) -> Result<JobProgress, EvaluationError> {
        (**self).fetch_progress(job_key).await
    }
}

/// Bulk evaluation endpoints backed by the authenticated [`ApiClient`].
pub struct EvaluationClient {
    api: Arc<ApiClient>,
    bulk_evaluation_path: String,
    progress_path: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

impl EvaluationClient {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            bulk_evaluation_path: DEFAULT_BULK_EVALUATION_PATH.to_string(),
            progress_path: DEFAULT_PROGRESS_PATH.to_string(),
        }
    }

    pub fn with_paths(
        mut self,
        bulk_evaluation_path: impl Into<String>,
        progress_path: impl Into<String>,
    ) -> Self {
        self.bulk_evaluation_path = bulk_evaluation_path.into();
        self.progress_path = progress_path.into();
        self
    }

    fn progress_url(&self, job_key: &str) -> String {
        format!(
            "{}/{}",
            self.progress_path.trim_end_matches('/'),
            urlencoding::encode(job_key)
        )
    }
}

#[async_trait]
impl EvaluationApi for EvaluationClient {
    async fn submit_bulk_evaluation(&self, job: &BulkEvaluationJob) -> Result<(), EvaluationError> {
        let response = self.api.post(&self.bulk_evaluation_path, job).await?;
        ensure_success(response).await?;

        metrics::counter!("bulk_evaluation_submitted_total").increment(1);
        tracing::info!(
            job_key = %job.job_key,
            prompt_id = %job.prompt_id,
            candidates = job.candidate_ids.len(),
            "Bulk evaluation accepted"
        );
        Ok(())
    }

    async fn fetch_progress(&self, job_key: &str) -> Result<JobProgress, EvaluationError> {
        let response = self.api.get(&self.progress_url(job_key)).await?;
        let response = ensure_success(response).await?;
        response.json().await.map_err(EvaluationError::Decode)
    }
}

async fn ensure_success(response: Response) -> Result<Response, EvaluationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or(body);

    Err(EvaluationError::Rejected { status, message })
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Server rejected request with status {status}: {message}")]
    Rejected { status: StatusCode, message: String },

    #[error("Failed to decode progress response: {0}")]
    Decode(reqwest::Error),
}

impl EvaluationError {
    /// True when the session is gone and retrying cannot help.
    pub fn is_session_invalidated(&self) -> bool {
        matches!(self, Self::Api(ApiError::SessionInvalidated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session_store::SessionStore;
    use std::time::Duration;

    fn client() -> EvaluationClient {
        let api = ApiClient::new(
            "http://localhost:8080",
            Arc::new(SessionStore::in_memory()),
            Duration::from_secs(5),
        )
        .unwrap();
        EvaluationClient::new(Arc::new(api)).with_paths("/bulk", "/progress/")
    }

    #[test]
    fn test_progress_url_appends_key() {
        assert_eq!(client().progress_url("J1"), "/progress/J1");
        assert_eq!(client().progress_url("form-42"), "/progress/form-42");
    }

    #[test]
    fn test_progress_url_encodes_key_as_one_segment() {
        assert_eq!(client().progress_url("a b/c"), "/progress/a%20b%2Fc");
    }

    #[test]
    fn test_session_invalidated_detection() {
        assert!(EvaluationError::Api(ApiError::SessionInvalidated).is_session_invalidated());
        assert!(!EvaluationError::Rejected {
            status: StatusCode::BAD_REQUEST,
            message: "bad".to_string()
        }
        .is_session_invalidated());
    }
}
