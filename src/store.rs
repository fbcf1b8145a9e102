use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::Error;
use crate::token::Token;

/// Serialized snapshot of the one persisted session.
///
/// Profile attributes are flattened alongside the fixed fields, so the
/// stored record is a single JSON object:
/// `{ "url": ..., "token": {...}, "audience": ..., ...attributes }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    /// Origin URL of the identity service the session belongs to.
    pub url: String,
    pub token: Token,
    #[serde(default)]
    pub audience: String,
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
}

/// Durable persistence for at most one session snapshot.
///
/// The store holds a single slot: this client supports one persisted
/// session per execution context, not multiple concurrent identities.
/// Reads and writes are synchronous.
///
/// # Example
///
/// ```rust,ignore
/// use ppoppo_identity::{Config, FileStore, IdentityClient};
///
/// let client = IdentityClient::new(
///     Config::new().with_session_store(FileStore::new("session.json")),
/// );
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Read the stored snapshot, if any.
    fn load(&self) -> Result<Option<String>, Error>;

    /// Replace the stored snapshot.
    fn save(&self, snapshot: &str) -> Result<(), Error>;

    /// Remove the stored snapshot. Removing an empty slot is not an error.
    fn clear(&self) -> Result<(), Error>;

    /// Whether a snapshot currently exists.
    fn exists(&self) -> bool {
        matches!(self.load(), Ok(Some(_)))
    }
}

/// File-backed session store: one JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl SessionStore for FileStore {
    fn load(&self) -> Result<Option<String>, Error> {
        match std::fs::read_to_string(&self.path) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, snapshot: &str) -> Result<(), Error> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, snapshot)
            .map_err(|e| Error::Storage(format!("write {}: {e}", self.path.display())))
    }

    fn clear(&self) -> Result<(), Error> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "remove {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// In-memory session store. The default for [`Config`]; also used in tests.
///
/// [`Config`]: crate::client::Config
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<String>>,
}

impl SessionStore for MemoryStore {
    fn load(&self) -> Result<Option<String>, Error> {
        Ok(self.slot.lock().expect("session slot poisoned").clone())
    }

    fn save(&self, snapshot: &str) -> Result<(), Error> {
        *self.slot.lock().expect("session slot poisoned") = Some(snapshot.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), Error> {
        *self.slot.lock().expect("session slot poisoned") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_snapshot() -> String {
        json!({
            "url": "https://identity.example.com",
            "token": {
                "access_token": "a.b.c",
                "token_type": "bearer",
                "expires_in": 3600,
                "expires_at": 1_700_000_000_000_i64,
                "refresh_token": "refresh-1",
            },
            "audience": "aud-1",
            "full_name": "Jane Doe",
        })
        .to_string()
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("session.json"));

        assert!(!store.exists());
        assert_eq!(store.load().unwrap(), None);

        store.save(&sample_snapshot()).unwrap();
        assert!(store.exists());
        assert_eq!(store.load().unwrap().unwrap(), sample_snapshot());

        store.clear().unwrap();
        assert!(!store.exists());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn file_store_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("session.json"));
        store.clear().unwrap();
        store.clear().unwrap();
    }

    #[test]
    fn file_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested/deeper/session.json"));
        store.save(&sample_snapshot()).unwrap();
        assert!(store.exists());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::default();
        assert!(!store.exists());
        store.save("snapshot").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("snapshot"));
        assert!(store.exists());
        store.clear().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn stored_session_flattens_attributes() {
        let stored: StoredSession = serde_json::from_str(&sample_snapshot()).unwrap();
        assert_eq!(stored.url, "https://identity.example.com");
        assert_eq!(stored.audience, "aud-1");
        assert_eq!(stored.token.refresh_token, "refresh-1");
        assert_eq!(
            stored.attributes.get("full_name").and_then(|v| v.as_str()),
            Some("Jane Doe")
        );

        let round_trip = serde_json::to_value(&stored).unwrap();
        assert_eq!(round_trip.get("full_name").and_then(|v| v.as_str()), Some("Jane Doe"));
        assert_eq!(round_trip.get("url").and_then(|v| v.as_str()), Some("https://identity.example.com"));
    }

    #[test]
    fn stored_session_requires_url_and_token() {
        let missing_token = json!({ "url": "https://identity.example.com" });
        assert!(serde_json::from_value::<StoredSession>(missing_token).is_err());
        let missing_url = json!({ "token": serde_json::from_str::<JsonValue>(&sample_snapshot()).unwrap()["token"] });
        assert!(serde_json::from_value::<StoredSession>(missing_url).is_err());
    }
}
