use std::collections::BTreeMap;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// PIS account identifier (opaque string issued by the service).
///
/// Immutable, unique per account. Consumers store this as the sole link to
/// the PIS identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Public capability document served at `/settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Settings {
    /// Whether new signups are confirmed without an email round-trip.
    #[serde(default)]
    pub autoconfirm: bool,
    /// Whether open signup is disabled on this instance.
    #[serde(default)]
    pub disable_signup: bool,
    /// External login providers and whether each is enabled.
    #[serde(default)]
    pub external: BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_from_string() {
        let id = UserId::from("acct-123".to_string());
        assert_eq!(id.to_string(), "acct-123");
        assert_eq!(id.as_str(), "acct-123");
    }

    #[test]
    fn user_id_serde_transparent() {
        let id = UserId("acct-123".to_string());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"acct-123\"");
        let parsed: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn settings_defaults_for_missing_fields() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(!settings.autoconfirm);
        assert!(!settings.disable_signup);
        assert!(settings.external.is_empty());
    }

    #[test]
    fn settings_parses_provider_map() {
        let settings: Settings = serde_json::from_str(
            r#"{"autoconfirm":true,"external":{"github":true,"gitlab":false}}"#,
        )
        .unwrap();
        assert!(settings.autoconfirm);
        assert_eq!(settings.external.get("github"), Some(&true));
        assert_eq!(settings.external.get("gitlab"), Some(&false));
    }
}
