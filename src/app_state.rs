use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    api_client::{ApiClient, ApiError},
    evaluation::EvaluationClient,
    session_store::{FileSessionStorage, SessionError, SessionStore},
};

/// Shared client wiring handed to every command.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub session: Arc<SessionStore>,
    pub api: Arc<ApiClient>,
    pub evaluation: Arc<EvaluationClient>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, StartupError> {
        let session = Arc::new(SessionStore::open(FileSessionStorage::new(
            &config.session_file,
        ))?);
        Self::with_session(config, session)
    }

    /// Build around an existing session store (tests, embedded hosts).
    pub fn with_session(
        config: AppConfig,
        session: Arc<SessionStore>,
    ) -> Result<Self, StartupError> {
        let api = Arc::new(
            ApiClient::new(
                &config.api_base_url,
                Arc::clone(&session),
                config.request_timeout(),
            )?
            .with_auth_paths(&config.login_path, &config.refresh_path),
        );

        let evaluation = Arc::new(
            EvaluationClient::new(Arc::clone(&api))
                .with_paths(&config.bulk_evaluation_path, &config.progress_path),
        );

        Ok(Self {
            config: Arc::new(config),
            session,
            api,
            evaluation,
        })
    }

    /// Location of the results view for `job_key`.
    pub fn results_location(&self, job_key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.api.base_url().as_str().trim_end_matches('/'),
            self.config.results_path.trim_matches('/'),
            job_key
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to open session store: {0}")]
    Session(#[from] SessionError),

    #[error("Failed to build API client: {0}")]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_location() {
        let config: AppConfig = envy::from_iter(vec![(
            "API_BASE_URL".to_string(),
            "https://screening.example.com/api/".to_string(),
        )])
        .unwrap();
        let state = AppState::with_session(config, Arc::new(SessionStore::in_memory())).unwrap();
        assert_eq!(
            state.results_location("J1"),
            "https://screening.example.com/api/ai-evaluation/results/J1"
        );
    }
}
