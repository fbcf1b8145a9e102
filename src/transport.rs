use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::Error;

pub(crate) const AUDIENCE_HEADER: &str = "X-JWT-AUD";
pub(crate) const COOKIE_HEADER: &str = "X-Use-Cookie";

/// Cookie-mode header value, sent when cookie mode is enabled in [`Config`].
///
/// [`Config`]: crate::client::Config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieChoice {
    /// Session survives the browser/process session (`X-Use-Cookie: 1`).
    Persistent,
    /// Session-scoped cookie (`X-Use-Cookie: session`).
    SessionOnly,
}

impl CookieChoice {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Self::Persistent => "1",
            Self::SessionOnly => "session",
        }
    }
}

/// Options for a single request.
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    /// JSON body, serialized with an `application/json` content type.
    pub json: Option<JsonValue>,
    /// Form body, serialized as `application/x-www-form-urlencoded`.
    pub form: Option<Vec<(String, String)>>,
    /// Audience for the `X-JWT-AUD` header. Overrides the caller's default.
    pub audience: Option<String>,
    /// Bearer credential for the `Authorization` header.
    pub bearer: Option<String>,
    /// Cookie-mode header, when cookie mode is enabled.
    pub cookie: Option<CookieChoice>,
}

impl RequestOptions {
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn json(mut self, body: JsonValue) -> Self {
        self.json = Some(body);
        self
    }

    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.form = Some(fields);
        self
    }

    #[must_use]
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }
}

/// HTTP executor for the identity API with uniform error classification.
///
/// Non-2xx responses with a JSON content type become [`Error::Api`], all
/// other non-2xx responses become [`Error::Response`], and send failures
/// become [`Error::Request`]. Successful JSON responses parse to a
/// [`serde_json::Value`]; other successful responses yield their body text.
#[derive(Debug, Clone)]
pub struct Transport {
    http: reqwest::Client,
    base_url: Url,
}

impl Transport {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path (optionally carrying a query string) against the base URL.
    pub(crate) fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        match path.split_once('?') {
            Some((path, query)) => {
                url.set_path(&format!("{base_path}{path}"));
                url.set_query(Some(query));
            }
            None => {
                url.set_path(&format!("{base_path}{path}"));
                url.set_query(None);
            }
        }
        url
    }

    /// Execute a request and classify the response.
    ///
    /// # Errors
    ///
    /// [`Error::Request`] when the request could not be sent or a 2xx JSON
    /// body failed to parse; [`Error::Api`]/[`Error::Response`] for non-2xx
    /// responses, chosen by content type.
    pub async fn request(&self, path: &str, options: RequestOptions) -> Result<JsonValue, Error> {
        let url = self.url(path);
        let mut builder = self
            .http
            .request(options.method, url)
            .headers(options.headers);
        if let Some(audience) = options.audience.as_deref().filter(|a| !a.is_empty()) {
            builder = builder.header(AUDIENCE_HEADER, audience);
        }
        if let Some(bearer) = options.bearer.as_deref() {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(choice) = options.cookie {
            builder = builder.header(COOKIE_HEADER, choice.header_value());
        }
        if let Some(body) = &options.json {
            builder = builder.json(body);
        }
        if let Some(fields) = &options.form {
            builder = builder.form(fields);
        }

        let response = builder.send().await?;
        classify(response).await
    }
}

async fn classify(response: reqwest::Response) -> Result<JsonValue, Error> {
    let status = response.status();
    let json_body = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let text = response.text().await?;

    if status.is_success() {
        if !json_body {
            return Ok(JsonValue::String(text));
        }
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        return serde_json::from_str(&text)
            .map_err(|e| Error::Request(format!("unexpected response body: {e}")));
    }

    if json_body {
        if let Ok(body) = serde_json::from_str::<JsonValue>(&text) {
            return Err(Error::Api {
                status: status.as_u16(),
                message: format!("request failed with status {}", status.as_u16()),
                body,
            });
        }
    }
    Err(Error::Response {
        status: status.as_u16(),
        body: text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base: &str) -> Transport {
        Transport::new(base.parse().unwrap())
    }

    #[test]
    fn url_joins_paths() {
        let t = transport("https://identity.example.com");
        assert_eq!(
            t.url("/signup").as_str(),
            "https://identity.example.com/signup"
        );
    }

    #[test]
    fn url_splices_query_strings() {
        let t = transport("https://identity.example.com");
        let url = t.url("/token?grant_type=password");
        assert_eq!(url.path(), "/token");
        assert_eq!(url.query(), Some("grant_type=password"));
    }

    #[test]
    fn url_tolerates_trailing_slash_and_base_path() {
        let t = transport("https://example.com/identity/");
        assert_eq!(
            t.url("/user").as_str(),
            "https://example.com/identity/user"
        );
    }

    #[test]
    fn cookie_header_values() {
        assert_eq!(CookieChoice::Persistent.header_value(), "1");
        assert_eq!(CookieChoice::SessionOnly.header_value(), "session");
    }

    #[test]
    fn request_options_builder() {
        let options = RequestOptions::new(Method::POST)
            .json(serde_json::json!({"email": "a@b.c"}))
            .audience("aud-1");
        assert_eq!(options.method, Method::POST);
        assert_eq!(options.audience.as_deref(), Some("aud-1"));
        assert!(options.json.is_some());
        assert!(options.form.is_none());
    }

    #[test]
    fn default_options_are_a_get() {
        let options = RequestOptions::default();
        assert_eq!(options.method, Method::GET);
        assert!(options.bearer.is_none());
        assert!(options.cookie.is_none());
    }
}
