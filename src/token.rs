use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;

/// A token within this margin of its expiry instant is treated as stale.
pub(crate) const EXPIRY_MARGIN_MS: i64 = 60_000;

/// Access/refresh token pair issued by the token endpoint.
///
/// `expires_at` is not taken from the server verbatim: it is derived by
/// decoding the access token's payload segment and reading its `exp` claim.
/// A token is replaced wholesale on refresh, never mutated field by field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Token {
    pub access_token: String,
    pub token_type: String,
    /// Relative lifetime in seconds, as issued.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiry instant in milliseconds since the epoch, derived
    /// from the access token's `exp` claim. Absent when decoding failed.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub refresh_token: String,
}

impl Token {
    /// Build a `Token` from a token-endpoint response, deriving `expires_at`.
    ///
    /// A payload that cannot be decoded is non-fatal: the token is kept
    /// with no expiry and the failure is logged (without the token text).
    pub(crate) fn from_response(response: JsonValue) -> Result<Self, Error> {
        let mut token: Token = serde_json::from_value(response)
            .map_err(|e| Error::Request(format!("unexpected token response shape: {e}")))?;
        match decode_expiry(&token.access_token) {
            Ok(expires_at) => token.expires_at = Some(expires_at),
            Err(error) => {
                token.expires_at = None;
                tracing::warn!(error = %error, "could not derive access token expiry");
            }
        }
        Ok(token)
    }

    /// Whether the token is within [`EXPIRY_MARGIN_MS`] of expiry (or past
    /// it). A token with no derivable expiry is not considered stale.
    #[must_use]
    pub fn is_stale(&self, now_ms: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - EXPIRY_MARGIN_MS <= now_ms,
            None => false,
        }
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Decodes the expiry instant (ms since epoch) from an access token's
/// payload segment, without verifying the signature.
///
/// This is not a security boundary: the token is trusted because it was
/// issued to this client over the secure channel. The payload is the middle
/// of three dot-delimited segments, url-safe base64 without padding
/// (a segment length of 1 mod 4 is rejected outright), containing a JSON
/// object with a numeric `exp` claim in seconds.
///
/// # Errors
///
/// Returns [`Error::Decode`] naming the failing stage. The message never
/// contains the token text.
pub fn decode_expiry(access_token: &str) -> Result<i64, Error> {
    let mut segments = access_token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(Error::Decode(
                "token is not a three-segment compact serialization".into(),
            ));
        }
    };

    if payload.len() % 4 == 1 {
        return Err(Error::Decode(
            "payload segment has an illegal base64 length".into(),
        ));
    }

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::Decode("payload segment is not valid url-safe base64".into()))?;
    let text = std::str::from_utf8(&raw)
        .map_err(|_| Error::Decode("payload is not valid UTF-8".into()))?;
    let claims: JsonValue = serde_json::from_str(text)
        .map_err(|_| Error::Decode("payload is not valid JSON".into()))?;

    let exp = claims
        .get("exp")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or_else(|| Error::Decode("payload has no numeric exp claim".into()))?;

    Ok(exp.saturating_mul(1000))
}
