//! Shared setup for tests that run the client against an in-process mock API.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use httpmock::MockServer;
use tokio::sync::Notify;

use screening_client::{
    app_state::AppState,
    config::AppConfig,
    models::{job::JobProgress, session::TokenPair},
    services::{
        orchestrator::CompletionHook,
        session_store::{MemorySessionStorage, SessionStore},
    },
};

/// Config pointing at `server` with fast timings.
pub fn config_for(server: &MockServer) -> AppConfig {
    envy::from_iter(vec![
        ("API_BASE_URL".to_string(), server.base_url()),
        ("POLL_INTERVAL_MS".to_string(), "50".to_string()),
        ("SETTLE_GRACE_MS".to_string(), "20".to_string()),
        ("MAX_POLL_SECS".to_string(), "10".to_string()),
        ("STALL_THRESHOLD".to_string(), "2".to_string()),
        ("REQUEST_TIMEOUT_SECS".to_string(), "5".to_string()),
    ])
    .expect("valid test config")
}

/// Client state for `server`, optionally signed in with `tokens`.
pub fn state_for(server: &MockServer, tokens: Option<TokenPair>) -> AppState {
    state_with(config_for(server), tokens)
}

/// Client state for an explicit config, optionally signed in with `tokens`.
pub fn state_with(config: AppConfig, tokens: Option<TokenPair>) -> AppState {
    let storage = match tokens {
        Some(pair) => MemorySessionStorage::with_tokens(pair),
        None => MemorySessionStorage::default(),
    };
    let session = Arc::new(SessionStore::open(storage).expect("memory storage"));
    AppState::with_session(config, session).expect("client state")
}

pub fn tokens(access: &str, refresh: &str) -> TokenPair {
    TokenPair::new(access, refresh)
}

/// Completion hook that records every call and wakes waiters.
#[derive(Default)]
pub struct RecordingHook {
    calls: Mutex<Vec<(String, JobProgress)>>,
    notify: Notify,
}

impl RecordingHook {
    pub fn calls(&self) -> Vec<(String, JobProgress)> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until the hook has fired at least once.
    pub async fn wait(&self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if !self.calls().is_empty() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("completion hook did not fire in time");
    }
}

#[async_trait]
impl CompletionHook for RecordingHook {
    async fn on_settled(&self, job_key: &str, progress: &JobProgress) {
        self.calls
            .lock()
            .unwrap()
            .push((job_key.to_string(), *progress));
        self.notify.notify_waiters();
    }
}
