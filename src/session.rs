use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use url::Url;

use crate::refresh::RefreshRegistry;
use crate::store::{SessionStore, StoredSession};
use crate::transport::Transport;
use crate::user::User;

/// Session state shared between the client and the principals it creates:
/// the session store, the current-principal slot and the refresh registry.
///
/// One explicit value owned by the [`IdentityClient`]; there are no
/// module-level globals. At most one principal is current at a time;
/// `clear_current` (via logout, explicit clear or a failed refresh) is the
/// teardown that releases it.
///
/// [`IdentityClient`]: crate::client::IdentityClient
pub(crate) struct SessionContext {
    pub(crate) store: Box<dyn SessionStore>,
    pub(crate) refresh: RefreshRegistry,
    pub(crate) cookie_mode: bool,
    current: RwLock<Option<User>>,
}

impl SessionContext {
    pub(crate) fn new(store: Box<dyn SessionStore>, cookie_mode: bool) -> Arc<Self> {
        Arc::new(Self {
            store,
            refresh: RefreshRegistry::default(),
            cookie_mode,
            current: RwLock::new(None),
        })
    }

    pub(crate) fn set_current(&self, user: &User) {
        *self.current.write().expect("current session lock poisoned") = Some(user.clone());
    }

    pub(crate) fn clear_current(&self) {
        *self.current.write().expect("current session lock poisoned") = None;
    }

    /// The current principal: the in-memory one when set, else recovered
    /// from the persisted snapshot.
    ///
    /// Recovery never fails loudly: a missing snapshot yields `None`, and a
    /// corrupt one is logged and treated the same. A snapshot that parses
    /// but lacks the origin URL or token is ignored.
    pub(crate) fn recover(self: &Arc<Self>) -> Option<User> {
        if let Some(user) = self
            .current
            .read()
            .expect("current session lock poisoned")
            .clone()
        {
            return Some(user);
        }

        let raw = match self.store.load() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(error = %error, "could not read persisted session");
                return None;
            }
        };

        let value: JsonValue = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(error = %error, "persisted session is not valid JSON");
                return None;
            }
        };
        let has_url = value.get("url").and_then(JsonValue::as_str).is_some();
        let has_token = value.get("token").is_some_and(|t| !t.is_null());
        if !has_url || !has_token {
            return None;
        }

        let stored: StoredSession = match serde_json::from_value(value) {
            Ok(stored) => stored,
            Err(error) => {
                tracing::warn!(error = %error, "persisted session has an unexpected shape");
                return None;
            }
        };
        let url: Url = match stored.url.parse() {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(error = %error, "persisted session has an invalid origin URL");
                return None;
            }
        };

        let user = User::recovered(Arc::clone(self), Transport::new(url), stored);
        self.set_current(&user);
        Some(user)
    }

    /// Remove the persisted snapshot. The in-memory session is untouched.
    pub(crate) fn forget(&self) {
        if let Err(error) = self.store.clear() {
            tracing::warn!(error = %error, "could not remove persisted session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn seeded_context(snapshot: Option<&str>) -> Arc<SessionContext> {
        let store = MemoryStore::default();
        if let Some(snapshot) = snapshot {
            store.save(snapshot).unwrap();
        }
        SessionContext::new(Box::new(store), false)
    }

    fn valid_snapshot() -> String {
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
            "email": "jane@example.com",
            "full_name": "Jane Doe",
        })
        .to_string()
    }

    #[test]
    fn recover_returns_none_without_snapshot() {
        let ctx = seeded_context(None);
        assert!(ctx.recover().is_none());
    }

    #[test]
    fn recover_treats_corrupt_snapshot_as_absent() {
        let ctx = seeded_context(Some("{not json"));
        assert!(ctx.recover().is_none());
    }

    #[test]
    fn recover_ignores_snapshot_missing_url_or_token() {
        let missing_token = json!({ "url": "https://identity.example.com" }).to_string();
        assert!(seeded_context(Some(&missing_token)).recover().is_none());

        let missing_url = json!({
            "token": {
                "access_token": "a.b.c",
                "token_type": "bearer",
                "refresh_token": "refresh-1",
            },
        })
        .to_string();
        assert!(seeded_context(Some(&missing_url)).recover().is_none());
    }

    #[test]
    fn recover_rebuilds_the_session() {
        let ctx = seeded_context(Some(&valid_snapshot()));
        let user = ctx.recover().expect("session should recover");

        assert_eq!(user.audience(), "aud-1");
        assert_eq!(user.email().as_deref(), Some("jane@example.com"));
        assert!(user.recovered_from_storage());
        let token = user.token_snapshot().expect("token should be held");
        assert_eq!(token.refresh_token, "refresh-1");
        assert_eq!(token.expires_at, Some(1_700_000_000_000));
        assert_eq!(
            user.extra_attributes().get("full_name").and_then(|v| v.as_str()),
            Some("Jane Doe")
        );
    }

    #[test]
    fn recover_is_idempotent_while_a_session_is_current() {
        let ctx = seeded_context(Some(&valid_snapshot()));
        let first = ctx.recover().unwrap();
        let second = ctx.recover().unwrap();
        assert!(first.ptr_eq(&second));
    }

    #[test]
    fn forget_removes_the_snapshot_only() {
        let ctx = seeded_context(Some(&valid_snapshot()));
        let user = ctx.recover().unwrap();
        ctx.forget();
        assert!(!ctx.store.exists());
        // In-memory session still current.
        assert!(ctx.recover().unwrap().ptr_eq(&user));
    }
}
