//! Authenticated HTTP client for the screening API.
//!
//! Every call goes through [`ApiClient::request`], which attaches the current
//! bearer token and, on a 401, refreshes the session once and replays the
//! original request once. Everything else is handed back untouched.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use url::Url;
use uuid::Uuid;

use crate::models::request::{FormData, RequestBody, RequestDescriptor};
use crate::models::session::TokenPair;
use crate::services::session_store::{SessionError, SessionStore};

pub const HEADER_REQUEST_ID: &str = "x-request-id";

const DEFAULT_LOGIN_PATH: &str = "/auth/login";
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
const SESSION_EVENT_CAPACITY: usize = 16;

/// Session lifecycle notifications for the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Refreshed,
    /// The session could not be refreshed and has been cleared. The host
    /// should send the user back to sign-in.
    Invalidated { reason: String },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

pub struct ApiClient {
    http: Client,
    base_url: Url,
    login_path: String,
    refresh_path: String,
    session: Arc<SessionStore>,
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        session: Arc<SessionStore>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        let http = Client::builder().timeout(timeout).build()?;
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        Ok(Self {
            http,
            base_url,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            session,
            refresh_lock: Mutex::new(()),
            events,
        })
    }

    pub fn with_auth_paths(
        mut self,
        login_path: impl Into<String>,
        refresh_path: impl Into<String>,
    ) -> Self {
        self.login_path = login_path.into();
        self.refresh_path = refresh_path.into();
        self
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Issue a request with refresh-then-retry-once semantics.
    ///
    /// Any response other than 401 is returned as-is, including error
    /// statuses. If the replay after a refresh also fails, that response is
    /// returned too; there is never a second refresh for the same call.
    pub async fn request(&self, descriptor: &RequestDescriptor) -> Result<Response, ApiError> {
        let sent_with = self.session.get().access_token().map(str::to_string);
        let response = self.send(descriptor, sent_with.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::info!(
            method = %descriptor.method,
            path = %descriptor.path,
            "Authorization expired, refreshing session"
        );

        let access_token = self.refresh_session(sent_with.as_deref()).await?;

        tracing::debug!(
            method = %descriptor.method,
            path = %descriptor.path,
            "Replaying request with refreshed token"
        );
        self.send(descriptor, Some(&access_token)).await
    }

    pub async fn get(&self, path: &str) -> Result<Response, ApiError> {
        self.request(&RequestDescriptor::get(path)).await
    }

    pub async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response, ApiError> {
        self.request(&RequestDescriptor::new(Method::POST, path).json(body)?)
            .await
    }

    pub async fn put<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response, ApiError> {
        self.request(&RequestDescriptor::new(Method::PUT, path).json(body)?)
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<Response, ApiError> {
        self.request(&RequestDescriptor::delete(path)).await
    }

    /// Multipart upload. No content type is set here; reqwest supplies the
    /// multipart boundary.
    pub async fn post_form_data(&self, path: &str, form: FormData) -> Result<Response, ApiError> {
        self.request(&RequestDescriptor::new(Method::POST, path).form(form))
            .await
    }

    /// Exchange credentials for a token pair and store it.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let url = self.url_for(&self.login_path)?;
        let response = self
            .http
            .post(url)
            .header(HEADER_REQUEST_ID, Uuid::new_v4().to_string())
            .json(&SignInRequest { email, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = %status, "Sign-in rejected");
            return Err(ApiError::SignInRejected { status });
        }

        let tokens: TokenPair = response.json().await?;
        self.session.replace(tokens)?;
        tracing::info!("Signed in");
        Ok(())
    }

    /// Explicit logout.
    pub fn sign_out(&self) -> Result<(), ApiError> {
        self.session.clear()?;
        tracing::info!("Signed out");
        Ok(())
    }

    fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}")).map_err(|e| ApiError::InvalidUrl(e.to_string()))
    }

    async fn send(
        &self,
        descriptor: &RequestDescriptor,
        access_token: Option<&str>,
    ) -> Result<Response, ApiError> {
        let url = self.url_for(&descriptor.path)?;
        let mut builder = self
            .http
            .request(descriptor.method.clone(), url)
            .header(HEADER_REQUEST_ID, Uuid::new_v4().to_string());

        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }

        builder = builder.headers(descriptor.headers.clone());

        builder = match &descriptor.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Form(form)) => builder.multipart(form.to_form().map_err(ApiError::Build)?),
            None => builder,
        };

        metrics::counter!("api_requests_total").increment(1);
        let response = builder.send().await?;

        tracing::debug!(
            method = %descriptor.method,
            path = %descriptor.path,
            status = %response.status(),
            "Request completed"
        );

        Ok(response)
    }

    /// Obtain a usable access token after a 401. Refreshes are serialized;
    /// a caller that finds the token already rotated reuses it instead of
    /// refreshing again.
    async fn refresh_session(&self, stale_access: Option<&str>) -> Result<String, ApiError> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.session.get();

        let Some(stored) = current.tokens() else {
            // Signed out, or cleared by a refresh failure that was already announced.
            tracing::debug!("No session to refresh");
            return Err(ApiError::SessionInvalidated);
        };

        if Some(stored.access_token.as_str()) != stale_access {
            tracing::debug!("Session already refreshed by a concurrent request");
            return Ok(stored.access_token.clone());
        }

        match self.exchange_refresh_token(&stored.refresh_token).await {
            Ok(tokens) => {
                let access_token = tokens.access_token.clone();
                if let Err(e) = self.session.replace(tokens) {
                    tracing::warn!(error = %e, "Failed to persist refreshed session");
                }
                metrics::counter!("api_session_refresh_total", "outcome" => "success").increment(1);
                tracing::info!("Session refreshed");
                let _ = self.events.send(SessionEvent::Refreshed);
                Ok(access_token)
            }
            Err(failure) => Err(self.invalidate(failure)),
        }
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<TokenPair, RefreshFailure> {
        let url = self
            .url_for(&self.refresh_path)
            .map_err(|e| RefreshFailure::Endpoint(e.to_string()))?;

        let response = self
            .http
            .post(url)
            .header(HEADER_REQUEST_ID, Uuid::new_v4().to_string())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(RefreshFailure::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshFailure::Rejected(status));
        }

        let tokens: TokenPair = response.json().await.map_err(RefreshFailure::Malformed)?;
        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            return Err(RefreshFailure::Incomplete);
        }
        Ok(tokens)
    }

    fn invalidate(&self, reason: impl Display) -> ApiError {
        tracing::warn!(reason = %reason, "Session refresh failed, clearing session");
        metrics::counter!("api_session_refresh_total", "outcome" => "failed").increment(1);

        if let Err(e) = self.session.clear() {
            tracing::error!(error = %e, "Failed to clear persisted session");
        }

        let _ = self.events.send(SessionEvent::Invalidated {
            reason: reason.to_string(),
        });
        ApiError::SessionInvalidated
    }
}

#[derive(Debug, thiserror::Error)]
enum RefreshFailure {
    #[error("refresh endpoint unusable: {0}")]
    Endpoint(String),

    #[error("refresh request failed: {0}")]
    Transport(reqwest::Error),

    #[error("refresh rejected with status {0}")]
    Rejected(StatusCode),

    #[error("refresh response malformed: {0}")]
    Malformed(reqwest::Error),

    #[error("refresh response missing tokens")]
    Incomplete,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to build request: {0}")]
    Build(reqwest::Error),

    #[error("Session expired and could not be refreshed")]
    SessionInvalidated,

    #[error("Sign-in rejected with status {status}")]
    SignInRejected { status: StatusCode },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to serialize request body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(
            base,
            Arc::new(SessionStore::in_memory()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_url_join_keeps_base_path() {
        let api = client("https://api.example.com/v1/");
        assert_eq!(
            api.url_for("/ai-evaluation/progress/J1").unwrap().as_str(),
            "https://api.example.com/v1/ai-evaluation/progress/J1"
        );
        assert_eq!(
            api.url_for("auth/refresh").unwrap().as_str(),
            "https://api.example.com/v1/auth/refresh"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = ApiClient::new(
            "not a url",
            Arc::new(SessionStore::in_memory()),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ApiError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_signed_out_401_is_not_announced() {
        let api = client("http://127.0.0.1:9");
        let mut events = api.subscribe();

        let err = api.refresh_session(None).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionInvalidated));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rotated_token_is_reused_without_refresh() {
        let api = client("http://127.0.0.1:9");
        api.session()
            .replace(TokenPair::new("fresh", "r2"))
            .unwrap();

        let token = api.refresh_session(Some("stale")).await.unwrap();
        assert_eq!(token, "fresh");
    }

    #[tokio::test]
    async fn test_already_cleared_session_is_not_reannounced() {
        let api = client("http://127.0.0.1:9");
        let mut events = api.subscribe();

        let err = api.refresh_session(Some("stale")).await.unwrap_err();
        assert!(matches!(err, ApiError::SessionInvalidated));
        assert!(events.try_recv().is_err());
    }
}
