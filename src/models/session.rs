use serde::{Deserialize, Serialize};

/// A complete access/refresh credential pair as issued by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

/// Current authentication state. Either both tokens are present or neither is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    tokens: Option<TokenPair>,
}

impl Session {
    pub fn empty() -> Self {
        Self { tokens: None }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.refresh_token.as_str())
    }

    pub fn tokens(&self) -> Option<&TokenPair> {
        self.tokens.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }
}

impl From<TokenPair> for Session {
    fn from(tokens: TokenPair) -> Self {
        Self {
            tokens: Some(tokens),
        }
    }
}

/// On-disk shape: two independent keys, either of which may be missing.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredSession {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl From<StoredSession> for Session {
    fn from(stored: StoredSession) -> Self {
        match (stored.access_token, stored.refresh_token) {
            (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
                TokenPair::new(access, refresh).into()
            }
            _ => Session::empty(),
        }
    }
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        match session.tokens() {
            Some(pair) => StoredSession {
                access_token: Some(pair.access_token.clone()),
                refresh_token: Some(pair.refresh_token.clone()),
            },
            None => StoredSession::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_storage_loads_as_empty() {
        let stored: StoredSession =
            serde_json::from_str(r#"{"accessToken":"abc"}"#).unwrap();
        let session = Session::from(stored);
        assert!(!session.is_authenticated());
        assert_eq!(session.access_token(), None);
        assert_eq!(session.refresh_token(), None);
    }

    #[test]
    fn test_blank_token_loads_as_empty() {
        let stored: StoredSession =
            serde_json::from_str(r#"{"accessToken":"","refreshToken":"r1"}"#).unwrap();
        assert_eq!(Session::from(stored), Session::empty());
    }

    #[test]
    fn test_complete_storage_loads_both_tokens() {
        let stored: StoredSession =
            serde_json::from_str(r#"{"accessToken":"a1","refreshToken":"r1"}"#).unwrap();
        let session = Session::from(stored);
        assert_eq!(session.access_token(), Some("a1"));
        assert_eq!(session.refresh_token(), Some("r1"));
    }

    #[test]
    fn test_empty_session_serializes_without_keys() {
        let json = serde_json::to_string(&StoredSession::from(&Session::empty())).unwrap();
        assert_eq!(json, "{}");
    }
}
