use serde_json::Value as JsonValue;

/// Errors surfaced by the identity client.
///
/// The enum is `Clone` because the outcome of a token refresh is delivered
/// to every caller waiting on the same in-flight attempt. Connection-level
/// failures are therefore captured as text rather than wrapping
/// `reqwest::Error`.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request could not be sent, or the response had an unusable shape.
    #[error("request failed: {0}")]
    Request(String),
    /// Non-2xx response with a JSON body.
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        body: JsonValue,
    },
    /// Non-2xx response without a JSON body.
    #[error("HTTP {status}: {body}")]
    Response { status: u16, body: String },
    /// The access token's payload segment could not be decoded.
    /// The message names the failing stage and never contains token text.
    #[error("access token decode failed: {0}")]
    Decode(String),
    /// An operation needing an access token was called with no token held.
    #[error("no session token held")]
    NoToken,
    /// Waiting on a token refresh exceeded the allowed time.
    #[error("token refresh timed out after {0}s")]
    RefreshTimeout(u64),
    /// The session store could not be read or written.
    #[error("session storage error: {0}")]
    Storage(String),
    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error.to_string())
    }
}
