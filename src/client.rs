use std::sync::Arc;

use reqwest::Method;
use serde_json::{Value as JsonValue, json};
use url::Url;

use crate::error::Error;
use crate::session::SessionContext;
use crate::store::{MemoryStore, SessionStore};
use crate::transport::{CookieChoice, RequestOptions, Transport};
use crate::types::Settings;
use crate::user::User;

/// Ppoppo Identity client configuration.
///
/// All fields have sensible defaults; override with `with_*` methods.
///
/// ```rust,ignore
/// use ppoppo_identity::{Config, FileStore};
///
/// let config = Config::new()
///     .with_base_url("https://identity.example.com".parse()?)
///     .with_audience("my-app")
///     .with_session_store(FileStore::new("session.json"));
/// ```
pub struct Config {
    base_url: Url,
    audience: String,
    cookie_mode: bool,
    store: Box<dyn SessionStore>,
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_url: "https://identity.ppoppo.com"
                .parse()
                .expect("valid default URL"),
            audience: String::new(),
            cookie_mode: false,
            store: Box::new(MemoryStore::default()),
        }
    }

    /// Override the identity service origin.
    #[must_use]
    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = url;
        self
    }

    /// Default audience sent as `X-JWT-AUD` on every request.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Send cookie-mode headers (`X-Use-Cookie`) with authentication calls.
    #[must_use]
    pub fn with_cookie_mode(mut self, enabled: bool) -> Self {
        self.cookie_mode = enabled;
        self
    }

    /// Where the remembered session snapshot is persisted.
    /// Defaults to an in-memory store (nothing survives the process).
    #[must_use]
    pub fn with_session_store(mut self, store: impl SessionStore) -> Self {
        self.store = Box::new(store);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Client for the Ppoppo Identity service.
///
/// Owns the transport and the session state; successful authentication
/// calls hand back a [`User`] that manages its own token lifecycle.
pub struct IdentityClient {
    transport: Transport,
    audience: String,
    ctx: Arc<SessionContext>,
}

impl IdentityClient {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let ctx = SessionContext::new(config.store, config.cookie_mode);
        Self {
            transport: Transport::new(config.base_url),
            audience: config.audience,
            ctx,
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.transport = self.transport.with_http_client(client);
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        self.transport.base_url()
    }

    /// Fetch the service capability document.
    pub async fn settings(&self) -> Result<Settings, Error> {
        let response = self
            .unauthenticated("/settings", RequestOptions::new(Method::GET))
            .await?;
        serde_json::from_value(response)
            .map_err(|e| Error::Request(format!("unexpected settings response: {e}")))
    }

    /// Register a new account. Depending on the instance's settings the
    /// response is either the created account (confirmation pending) or a
    /// token response when signups are auto-confirmed.
    pub async fn signup(
        &self,
        email: &str,
        password: &str,
        data: Option<JsonValue>,
    ) -> Result<JsonValue, Error> {
        let mut body = json!({ "email": email, "password": password });
        if let Some(data) = data {
            body["data"] = data;
        }
        self.unauthenticated("/signup", RequestOptions::new(Method::POST).json(body))
            .await
    }

    /// Log in with email and password.
    ///
    /// Any previously persisted session is dropped first. On success the
    /// principal's profile is fetched and, when `remember` is set, the
    /// session is persisted.
    pub async fn login(&self, email: &str, password: &str, remember: bool) -> Result<User, Error> {
        let mut options = RequestOptions::new(Method::POST).form(vec![
            ("grant_type".into(), "password".into()),
            ("username".into(), email.into()),
            ("password".into(), password.into()),
        ]);
        options.cookie = self.cookie_choice(remember);
        let response = self.unauthenticated("/token", options).await?;
        self.ctx.forget();
        self.create_user(response, remember).await
    }

    /// Confirm a signup with the emailed confirmation token.
    pub async fn confirm(&self, token: &str, remember: bool) -> Result<User, Error> {
        self.verify("signup", token, None, remember).await
    }

    /// Complete a password recovery with the emailed recovery token.
    pub async fn recover(&self, token: &str, remember: bool) -> Result<User, Error> {
        self.verify("recovery", token, None, remember).await
    }

    /// Accept an invite, choosing a password for the new account.
    pub async fn accept_invite(
        &self,
        token: &str,
        password: &str,
        remember: bool,
    ) -> Result<User, Error> {
        self.verify("signup", token, Some(password), remember).await
    }

    /// Request a password recovery email.
    pub async fn request_password_recovery(&self, email: &str) -> Result<JsonValue, Error> {
        self.unauthenticated(
            "/recover",
            RequestOptions::new(Method::POST).json(json!({ "email": email })),
        )
        .await
    }

    /// URL to start an external-provider login.
    #[must_use]
    pub fn login_external_url(&self, provider: &str) -> String {
        let mut url = self.transport.url("/authorize");
        url.query_pairs_mut().append_pair("provider", provider);
        url.to_string()
    }

    /// URL for accepting an invite through an external provider.
    #[must_use]
    pub fn accept_invite_external_url(&self, provider: &str, invite_token: &str) -> String {
        let mut url = self.transport.url("/authorize");
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("invite_token", invite_token);
        url.to_string()
    }

    /// The current principal: the in-memory one if a session is active,
    /// else recovered from the persisted snapshot.
    #[must_use]
    pub fn current_user(&self) -> Option<User> {
        self.ctx.recover()
    }

    /// Remove the persisted session snapshot without touching the
    /// in-memory session.
    pub fn forget_persisted_session(&self) {
        self.ctx.forget();
    }

    /// Complete a `/verify` flow (`signup` or `recovery`).
    async fn verify(
        &self,
        kind: &str,
        token: &str,
        password: Option<&str>,
        remember: bool,
    ) -> Result<User, Error> {
        let mut body = json!({ "token": token, "type": kind });
        if let Some(password) = password {
            body["password"] = json!(password);
        }
        let mut options = RequestOptions::new(Method::POST).json(body);
        options.cookie = self.cookie_choice(remember);
        let response = self.unauthenticated("/verify", options).await?;
        self.create_user(response, remember).await
    }

    /// Construct the principal for a fresh token response, fetch its
    /// profile, persist it when remembered, and install it as current.
    async fn create_user(&self, token_response: JsonValue, remember: bool) -> Result<User, Error> {
        let user = User::new(
            Arc::clone(&self.ctx),
            self.transport.clone(),
            self.audience.clone(),
            token_response,
            remember,
        )?;
        user.get_user_data().await?;
        if remember {
            user.save_session();
        }
        self.ctx.set_current(&user);
        Ok(user)
    }

    async fn unauthenticated(
        &self,
        path: &str,
        mut options: RequestOptions,
    ) -> Result<JsonValue, Error> {
        if options.audience.is_none() && !self.audience.is_empty() {
            options.audience = Some(self.audience.clone());
        }
        self.transport.request(path, options).await
    }

    fn cookie_choice(&self, remember: bool) -> Option<CookieChoice> {
        self.ctx.cookie_mode.then(|| {
            if remember {
                CookieChoice::Persistent
            } else {
                CookieChoice::SessionOnly
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;

    fn client(base: &str) -> IdentityClient {
        IdentityClient::new(Config::new().with_base_url(base.parse().unwrap()))
    }

    #[test]
    fn config_defaults() {
        let client = IdentityClient::new(Config::new());
        assert_eq!(client.base_url().as_str(), "https://identity.ppoppo.com/");
        assert!(client.audience.is_empty());
        assert!(!client.ctx.cookie_mode);
    }

    #[test]
    fn config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let client = IdentityClient::new(
            Config::new()
                .with_base_url("https://identity.example.com".parse().unwrap())
                .with_audience("my-app")
                .with_cookie_mode(true)
                .with_session_store(FileStore::new(dir.path().join("session.json"))),
        );
        assert_eq!(client.base_url().as_str(), "https://identity.example.com/");
        assert_eq!(client.audience, "my-app");
        assert!(client.ctx.cookie_mode);
    }

    #[test]
    fn external_login_url() {
        let client = client("https://identity.example.com");
        assert_eq!(
            client.login_external_url("github"),
            "https://identity.example.com/authorize?provider=github"
        );
    }

    #[test]
    fn external_invite_url_carries_the_token() {
        let client = client("https://identity.example.com");
        assert_eq!(
            client.accept_invite_external_url("gitlab", "invite-1"),
            "https://identity.example.com/authorize?provider=gitlab&invite_token=invite-1"
        );
    }

    #[test]
    fn cookie_choice_follows_remember_flag() {
        let plain = client("https://identity.example.com");
        assert_eq!(plain.cookie_choice(true), None);

        let cookie_client = IdentityClient::new(
            Config::new()
                .with_base_url("https://identity.example.com".parse().unwrap())
                .with_cookie_mode(true),
        );
        assert_eq!(
            cookie_client.cookie_choice(true),
            Some(CookieChoice::Persistent)
        );
        assert_eq!(
            cookie_client.cookie_choice(false),
            Some(CookieChoice::SessionOnly)
        );
    }

    #[test]
    fn current_user_is_none_without_a_session() {
        let client = client("https://identity.example.com");
        assert!(client.current_user().is_none());
    }

    #[test]
    fn forget_persisted_session_clears_the_store() {
        let client = client("https://identity.example.com");
        client.ctx.store.save("{}").unwrap();
        client.forget_persisted_session();
        assert!(!client.ctx.store.exists());
    }
}
