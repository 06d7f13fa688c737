use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::OrchestratorConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base URL of the screening API (e.g., "https://api.example.com/v1")
    pub api_base_url: String,

    /// File holding the persisted access/refresh token pair
    #[serde(default = "default_session_file")]
    pub session_file: String,

    /// Sign-in endpoint path
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Token refresh endpoint path
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Bulk AI-evaluation submission endpoint path
    #[serde(default = "default_bulk_evaluation_path")]
    pub bulk_evaluation_path: String,

    /// Progress endpoint prefix; the job key is appended as a path segment
    #[serde(default = "default_progress_path")]
    pub progress_path: String,

    /// Results view prefix reported once a job settles
    #[serde(default = "default_results_path")]
    pub results_path: String,

    /// Fixed interval between progress polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay between observing a settled job and running the completion action
    #[serde(default = "default_settle_grace_ms")]
    pub settle_grace_ms: u64,

    /// Upper bound on polling duration. Zero disables the limit.
    #[serde(default = "default_max_poll_secs")]
    pub max_poll_secs: u64,

    /// Consecutive poll failures tolerated before the job is flagged as stalled
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,

    /// Per-request transport timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_session_file() -> String {
    ".screening-session.json".to_string()
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

fn default_bulk_evaluation_path() -> String {
    "/ai-evaluation/bulk".to_string()
}

fn default_progress_path() -> String {
    "/ai-evaluation/progress".to_string()
}

fn default_results_path() -> String {
    "/ai-evaluation/results".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_settle_grace_ms() -> u64 {
    1000
}

fn default_max_poll_secs() -> u64 {
    30 * 60
}

fn default_stall_threshold() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Environment plus explicit overrides (e.g. command-line flags), with
    /// overrides winning.
    pub fn from_env_with_overrides<I>(overrides: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        dotenvy::dotenv().ok();
        let mut vars: HashMap<String, String> = std::env::vars().collect();
        vars.extend(overrides);
        envy::from_iter(vars)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Orchestrator timings derived from the environment.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle_grace: Duration::from_millis(self.settle_grace_ms),
            max_poll_duration: (self.max_poll_secs > 0)
                .then(|| Duration::from_secs(self.max_poll_secs)),
            stall_threshold: self.stall_threshold,
        }
    }
}
