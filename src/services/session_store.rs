use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::models::session::{Session, StoredSession, TokenPair};

/// Durable key/value backing for the session. Implementations must write the
/// token pair as a unit.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<Session, SessionError>;
    fn save(&self, session: &Session) -> Result<(), SessionError>;
}

/// Owns the current session. The only writer is the API client.
pub struct SessionStore {
    current: RwLock<Session>,
    storage: Box<dyn SessionStorage>,
}

impl SessionStore {
    /// Load the persisted session from `storage`.
    pub fn open(storage: impl SessionStorage + 'static) -> Result<Self, SessionError> {
        let session = storage.load()?;
        tracing::debug!(
            authenticated = session.is_authenticated(),
            "Session store opened"
        );
        Ok(Self {
            current: RwLock::new(session),
            storage: Box::new(storage),
        })
    }

    /// In-memory store with nothing persisted.
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Session::empty()),
            storage: Box::new(MemorySessionStorage::default()),
        }
    }

    pub fn get(&self) -> Session {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new token pair. The in-memory session is updated even when
    /// persisting fails, so in-flight requests keep working.
    pub fn replace(&self, tokens: TokenPair) -> Result<(), SessionError> {
        self.set(Session::from(tokens))
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        self.set(Session::empty())
    }

    fn set(&self, session: Session) -> Result<(), SessionError> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = session;
        self.storage.save(&current)
    }
}

/// JSON file holding `accessToken` and `refreshToken`.
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStorage for FileSessionStorage {
    fn load(&self) -> Result<Session, SessionError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Session::empty()),
            Err(e) => return Err(SessionError::Io(e)),
        };

        if raw.trim().is_empty() {
            return Ok(Session::empty());
        }

        let stored: StoredSession = serde_json::from_str(&raw)?;
        Ok(stored.into())
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        let payload = serde_json::to_vec_pretty(&StoredSession::from(session))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename keeps both keys in lockstep on disk.
        let tmp = self.temp_path();
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Volatile storage, used by tests and hosts that must not touch disk.
#[derive(Default)]
pub struct MemorySessionStorage {
    saved: Mutex<Session>,
}

impl MemorySessionStorage {
    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            saved: Mutex::new(tokens.into()),
        }
    }
}

impl SessionStorage for MemorySessionStorage {
    fn load(&self) -> Result<Session, SessionError> {
        Ok(self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = session.clone();
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session storage is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(FileSessionStorage::new(dir.path().join("session.json")))
            .unwrap();
        assert!(!store.get().is_authenticated());
    }

    #[test]
    fn test_replace_persists_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let store = SessionStore::open(FileSessionStorage::new(&path)).unwrap();

        store.replace(TokenPair::new("a1", "r1")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["accessToken"], "a1");
        assert_eq!(raw["refreshToken"], "r1");

        let reopened = SessionStore::open(FileSessionStorage::new(&path)).unwrap();
        assert_eq!(reopened.get().access_token(), Some("a1"));
        assert_eq!(reopened.get().refresh_token(), Some("r1"));
    }

    #[test]
    fn test_clear_removes_both_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::open(FileSessionStorage::new(&path)).unwrap();
        store.replace(TokenPair::new("a1", "r1")).unwrap();

        store.clear().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.get("accessToken").is_none());
        assert!(raw.get("refreshToken").is_none());
        assert_eq!(store.get(), Session::empty());
    }

    #[test]
    fn test_half_written_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"refreshToken":"r1"}"#).unwrap();

        let store = SessionStore::open(FileSessionStorage::new(&path)).unwrap();
        assert_eq!(store.get().refresh_token(), None);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let result = SessionStore::open(FileSessionStorage::new(&path));
        assert!(matches!(result, Err(SessionError::Serialize(_))));
    }

    #[test]
    fn test_session_never_half_populated_across_updates() {
        let store = SessionStore::in_memory();
        for i in 0..5 {
            store
                .replace(TokenPair::new(format!("a{i}"), format!("r{i}")))
                .unwrap();
            let s = store.get();
            assert_eq!(s.access_token().is_some(), s.refresh_token().is_some());
            if i % 2 == 0 {
                store.clear().unwrap();
                let s = store.get();
                assert_eq!(s.access_token().is_some(), s.refresh_token().is_some());
            }
        }
    }
}
