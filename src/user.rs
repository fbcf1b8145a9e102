use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::Method;
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::admin::AdminClient;
use crate::error::Error;
use crate::session::SessionContext;
use crate::store::StoredSession;
use crate::token::{Token, now_ms};
use crate::transport::{CookieChoice, RequestOptions, Transport};
use crate::types::UserId;

/// How long a refresh caller waits before giving up on the attempt.
/// The timer bounds the wait, not the request itself.
const REFRESH_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Attribute names a server payload may never write through a merge.
/// The transport handle, token and audience are not attributes at all, so
/// this list only has to keep their names out of the extra-attribute map.
const RESERVED_ATTRIBUTES: &[&str] = &["api", "token", "url", "audience", "aud"];

/// Fixed identity fields reported by the identity service.
///
/// Everything the server reports outside this set lands in the principal's
/// extra-attribute map.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct UserData {
    pub id: Option<UserId>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub confirmed_at: Option<OffsetDateTime>,
    pub created_at: Option<OffsetDateTime>,
    pub updated_at: Option<OffsetDateTime>,
    pub app_metadata: Option<JsonValue>,
    pub user_metadata: Option<JsonValue>,
}

impl UserData {
    /// Merge one reported attribute into the fixed record. Returns whether
    /// the key named a fixed field (a typed field is only overwritten by a
    /// value of the right shape).
    fn merge_value(&mut self, key: &str, value: &JsonValue) -> bool {
        match key {
            "id" => {
                if let Some(id) = value.as_str() {
                    self.id = Some(UserId(id.to_string()));
                }
                true
            }
            "email" => {
                if let Some(email) = value.as_str() {
                    self.email = Some(email.to_string());
                }
                true
            }
            "role" => {
                if let Some(role) = value.as_str() {
                    self.role = Some(role.to_string());
                }
                true
            }
            "confirmed_at" => {
                if let Some(at) = parse_timestamp(value) {
                    self.confirmed_at = Some(at);
                }
                true
            }
            "created_at" => {
                if let Some(at) = parse_timestamp(value) {
                    self.created_at = Some(at);
                }
                true
            }
            "updated_at" => {
                if let Some(at) = parse_timestamp(value) {
                    self.updated_at = Some(at);
                }
                true
            }
            "app_metadata" => {
                self.app_metadata = Some(value.clone());
                true
            }
            "user_metadata" => {
                self.user_metadata = Some(value.clone());
                true
            }
            _ => false,
        }
    }

    /// Serializable view of the populated fields, for session snapshots.
    fn to_attributes(&self) -> Map<String, JsonValue> {
        let mut attributes = Map::new();
        if let Some(id) = &self.id {
            attributes.insert("id".into(), JsonValue::String(id.to_string()));
        }
        if let Some(email) = &self.email {
            attributes.insert("email".into(), JsonValue::String(email.clone()));
        }
        if let Some(role) = &self.role {
            attributes.insert("role".into(), JsonValue::String(role.clone()));
        }
        for (key, at) in [
            ("confirmed_at", self.confirmed_at),
            ("created_at", self.created_at),
            ("updated_at", self.updated_at),
        ] {
            if let Some(formatted) = at.and_then(|at| at.format(&Rfc3339).ok()) {
                attributes.insert(key.into(), JsonValue::String(formatted));
            }
        }
        if let Some(meta) = &self.app_metadata {
            attributes.insert("app_metadata".into(), meta.clone());
        }
        if let Some(meta) = &self.user_metadata {
            attributes.insert("user_metadata".into(), meta.clone());
        }
        attributes
    }
}

fn parse_timestamp(value: &JsonValue) -> Option<OffsetDateTime> {
    value
        .as_str()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
}

struct UserInner {
    ctx: Arc<SessionContext>,
    transport: Transport,
    audience: String,
    token: RwLock<Option<Token>>,
    data: RwLock<UserData>,
    extra: RwLock<Map<String, JsonValue>>,
    remember: AtomicBool,
    from_storage: AtomicBool,
}

/// The authenticated principal: identity attributes plus the current token.
///
/// Cheap to clone; clones share the same session. Created by the client on
/// successful authentication or session recovery, and logically destroyed
/// (token dropped, snapshot removed) by [`logout`](User::logout),
/// [`clear_session`](User::clear_session) or an unrecoverable refresh
/// failure.
#[derive(Clone)]
pub struct User {
    inner: Arc<UserInner>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id())
            .field("email", &self.email())
            .field("audience", &self.audience())
            .finish_non_exhaustive()
    }
}

impl User {
    /// Construct a principal from a fresh token-endpoint response.
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        transport: Transport,
        audience: String,
        token_response: JsonValue,
        remember: bool,
    ) -> Result<Self, Error> {
        let token = Token::from_response(token_response)?;
        Ok(Self {
            inner: Arc::new(UserInner {
                ctx,
                transport,
                audience,
                token: RwLock::new(Some(token)),
                data: RwLock::new(UserData::default()),
                extra: RwLock::new(Map::new()),
                remember: AtomicBool::new(remember),
                from_storage: AtomicBool::new(false),
            }),
        })
    }

    /// Reconstruct a principal from a persisted snapshot. The stored token
    /// is taken as-is (its expiry was derived when it was issued).
    pub(crate) fn recovered(
        ctx: Arc<SessionContext>,
        transport: Transport,
        stored: StoredSession,
    ) -> Self {
        let user = Self {
            inner: Arc::new(UserInner {
                ctx,
                transport,
                audience: stored.audience,
                token: RwLock::new(Some(stored.token)),
                data: RwLock::new(UserData::default()),
                extra: RwLock::new(Map::new()),
                remember: AtomicBool::new(true),
                from_storage: AtomicBool::new(false),
            }),
        };
        user.apply_attributes(stored.attributes, true);
        user
    }

    #[must_use]
    pub fn id(&self) -> Option<UserId> {
        self.inner.data.read().expect("user data lock poisoned").id.clone()
    }

    #[must_use]
    pub fn email(&self) -> Option<String> {
        self.inner
            .data
            .read()
            .expect("user data lock poisoned")
            .email
            .clone()
    }

    #[must_use]
    pub fn audience(&self) -> &str {
        &self.inner.audience
    }

    /// The fixed identity record.
    #[must_use]
    pub fn data(&self) -> UserData {
        self.inner.data.read().expect("user data lock poisoned").clone()
    }

    /// Server-reported attributes outside the fixed identity record.
    #[must_use]
    pub fn extra_attributes(&self) -> Map<String, JsonValue> {
        self.inner
            .extra
            .read()
            .expect("user attributes lock poisoned")
            .clone()
    }

    /// Whether this principal was recovered from a persisted snapshot.
    #[must_use]
    pub fn recovered_from_storage(&self) -> bool {
        self.inner.from_storage.load(Ordering::Relaxed)
    }

    /// A copy of the current token, if one is held.
    #[must_use]
    pub fn token_snapshot(&self) -> Option<Token> {
        self.inner.token.read().expect("token lock poisoned").clone()
    }

    /// Administrative user management through this principal's credentials.
    #[must_use]
    pub fn admin(&self) -> AdminClient<'_> {
        AdminClient::new(self)
    }

    /// A valid access token for this principal.
    ///
    /// Returns the held token when it is more than 60 seconds from expiry;
    /// otherwise refreshes it first. Concurrent callers during a refresh
    /// share a single request.
    ///
    /// # Errors
    ///
    /// [`Error::NoToken`] when no token is held; the refresh attempt's
    /// error (with the session cleared) when refreshing fails or times out.
    pub async fn jwt(&self) -> Result<String, Error> {
        self.jwt_with(false).await
    }

    /// Like [`jwt`](User::jwt), refreshing unconditionally when
    /// `force_refresh` is set.
    pub async fn jwt_with(&self, force_refresh: bool) -> Result<String, Error> {
        let (access_token, refresh_token, stale) = {
            let guard = self.inner.token.read().expect("token lock poisoned");
            match guard.as_ref() {
                None => return Err(Error::NoToken),
                Some(token) => (
                    token.access_token.clone(),
                    token.refresh_token.clone(),
                    token.is_stale(now_ms()),
                ),
            }
        };
        if force_refresh || stale {
            self.refresh_access_token(refresh_token).await
        } else {
            Ok(access_token)
        }
    }

    async fn refresh_access_token(&self, refresh_token: String) -> Result<String, Error> {
        let key = refresh_token.clone();
        let transport = self.inner.transport.clone();
        let outcome = self
            .inner
            .ctx
            .refresh
            .run(
                &key,
                REFRESH_WAIT_TIMEOUT,
                move || async move {
                    let response = transport
                        .request(
                            "/token",
                            RequestOptions::new(Method::POST).form(vec![
                                ("grant_type".into(), "refresh_token".into()),
                                ("refresh_token".into(), refresh_token),
                            ]),
                        )
                        .await?;
                    Token::from_response(response)
                },
                |outcome| self.settle_refresh(outcome),
            )
            .await;
        outcome.map(|token| token.access_token)
    }

    /// Apply a settled refresh outcome: replace the token wholesale and
    /// rewrite the persisted snapshot on success; clear the session on
    /// failure or timeout.
    fn settle_refresh(&self, outcome: &Result<Token, Error>) {
        match outcome {
            Ok(token) => {
                *self.inner.token.write().expect("token lock poisoned") = Some(token.clone());
                self.save_session();
            }
            Err(error) => {
                tracing::warn!(error = %error, "token refresh failed; clearing session");
                self.clear_session();
            }
        }
    }

    /// Issue an authenticated request.
    ///
    /// The audience header uses the request-specific override when present,
    /// else this principal's audience; the bearer credential comes from
    /// [`jwt`](User::jwt). A JSON-shaped error response is re-raised with
    /// its message rewritten: `msg` when present, else
    /// `"{error}: {error_description}"`.
    pub async fn request(
        &self,
        path: &str,
        mut options: RequestOptions,
    ) -> Result<JsonValue, Error> {
        if options.audience.is_none() && !self.inner.audience.is_empty() {
            options.audience = Some(self.inner.audience.clone());
        }
        options.bearer = Some(self.jwt().await?);
        if self.inner.ctx.cookie_mode && options.cookie.is_none() {
            options.cookie = Some(if self.inner.remember.load(Ordering::Relaxed) {
                CookieChoice::Persistent
            } else {
                CookieChoice::SessionOnly
            });
        }
        self.inner
            .transport
            .request(path, options)
            .await
            .map_err(rewrite_api_message)
    }

    /// Fetch the profile from `/user` and merge it into this principal.
    pub async fn get_user_data(&self) -> Result<UserData, Error> {
        let response = self.request("/user", RequestOptions::new(Method::GET)).await?;
        self.merge_response(response)?;
        Ok(self.data())
    }

    /// Update profile attributes via `PUT /user` and merge the response.
    pub async fn update(&self, attributes: JsonValue) -> Result<UserData, Error> {
        let response = self
            .request("/user", RequestOptions::new(Method::PUT).json(attributes))
            .await?;
        self.merge_response(response)?;
        Ok(self.data())
    }

    fn merge_response(&self, response: JsonValue) -> Result<(), Error> {
        match response {
            JsonValue::Object(attributes) => {
                self.apply_attributes(attributes, false);
                self.save_session();
                Ok(())
            }
            _ => Err(Error::Request("expected a profile object".into())),
        }
    }

    /// Merge server-reported attributes into this principal.
    ///
    /// Known identity fields update the fixed record; unknown keys land in
    /// the extra-attribute map. Reserved names (the token, audience and
    /// origin keys) are never written, whatever the payload contains.
    pub fn apply_attributes(&self, attributes: Map<String, JsonValue>, from_storage: bool) {
        {
            let mut data = self.inner.data.write().expect("user data lock poisoned");
            let mut extra = self
                .inner
                .extra
                .write()
                .expect("user attributes lock poisoned");
            for (key, value) in attributes {
                if RESERVED_ATTRIBUTES.contains(&key.as_str()) {
                    continue;
                }
                if !data.merge_value(&key, &value) {
                    extra.insert(key, value);
                }
            }
        }
        if from_storage {
            self.inner.from_storage.store(true, Ordering::Relaxed);
        }
    }

    /// Persist the session snapshot, if this session opted into persistence
    /// or a snapshot already exists. Best-effort: a failed write is logged,
    /// not raised.
    pub fn save_session(&self) {
        if self.inner.remember.load(Ordering::Relaxed) || self.inner.ctx.store.exists() {
            if let Err(error) = self.write_snapshot() {
                tracing::warn!(error = %error, "could not persist session snapshot");
            }
        }
    }

    fn write_snapshot(&self) -> Result<(), Error> {
        let token = match self.inner.token.read().expect("token lock poisoned").clone() {
            Some(token) => token,
            None => return Ok(()),
        };
        let mut attributes = self.inner.data.read().expect("user data lock poisoned").to_attributes();
        for (key, value) in self
            .inner
            .extra
            .read()
            .expect("user attributes lock poisoned")
            .iter()
        {
            attributes.insert(key.clone(), value.clone());
        }
        let stored = StoredSession {
            url: self
                .inner
                .transport
                .base_url()
                .as_str()
                .trim_end_matches('/')
                .to_string(),
            token,
            audience: self.inner.audience.clone(),
            attributes,
        };
        let snapshot = serde_json::to_string(&stored)
            .map_err(|e| Error::Storage(format!("serialize session snapshot: {e}")))?;
        self.inner.ctx.store.save(&snapshot)
    }

    /// Log out: best-effort remote invalidation, then unconditional local
    /// teardown. A failed logout request is logged and swallowed.
    pub async fn logout(&self) {
        if let Err(error) = self
            .request("/logout", RequestOptions::new(Method::POST))
            .await
        {
            tracing::warn!(error = %error, "logout request failed; clearing local session anyway");
        }
        self.clear_session();
    }

    /// Drop the token, remove any persisted snapshot and release the
    /// current-principal slot.
    pub fn clear_session(&self) {
        *self.inner.token.write().expect("token lock poisoned") = None;
        if let Err(error) = self.inner.ctx.store.clear() {
            tracing::warn!(error = %error, "could not remove persisted session");
        }
        self.inner.ctx.clear_current();
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &User) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Rewrite a JSON-shaped API error's message: prefer the body's `msg`,
/// else compose `"{error}: {error_description}"`. Everything else passes
/// through untouched.
fn rewrite_api_message(error: Error) -> Error {
    let Error::Api {
        status,
        message,
        body,
    } = error
    else {
        return error;
    };
    let message = if let Some(msg) = body.get("msg").and_then(JsonValue::as_str) {
        msg.to_string()
    } else if let Some(code) = body.get("error").and_then(JsonValue::as_str) {
        match body.get("error_description").and_then(JsonValue::as_str) {
            Some(description) => format!("{code}: {description}"),
            None => code.to_string(),
        }
    } else {
        message
    };
    Error::Api {
        status,
        message,
        body,
    }
}
