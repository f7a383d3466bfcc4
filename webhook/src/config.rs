//! One webhook endpoint per configured external source (§6, "Webhook
//! front-end (delegate)"): a path to listen on, which signature scheme to
//! apply, and the conversation a push event from this endpoint lands in.

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

const WEBHOOK_TOML_FILE: &str = "webhook.toml";

/// `{source, path, secret?, conversation_id?, participant_id?}` from §6.
/// `source` selects the signature scheme: `"gitlab"` compares `secret`
/// against `X-Gitlab-Token`; `"github"` verifies an HMAC-SHA256 of the body
/// against `X-Hub-Signature-256`; any other value is accepted unverified.
/// A `None` `secret` also skips verification regardless of `source` — the
/// endpoint is intentionally open.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WebhookEndpointConfig {
    pub source: String,
    pub path: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub participant_id: Option<String>,
}

/// The full set of endpoints one delegate process's webhook front-end
/// listens on, loaded from `webhook.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub endpoints: Vec<WebhookEndpointConfig>,
}

impl WebhookConfig {
    /// Reads `dir/webhook.toml`. A missing file yields an empty
    /// configuration (no endpoints registered) rather than an error, matching
    /// `mcpl-core::Config`'s "keep going with defaults" posture.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(WEBHOOK_TOML_FILE);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "webhook.toml not found, no endpoints registered");
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn missing_file_yields_no_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = WebhookConfig::load(dir.path()).expect("loads with defaults");
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn parses_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(WEBHOOK_TOML_FILE),
            r#"
            [[endpoints]]
            source = "github"
            path = "/hooks/github"
            secret = "s3cr3t"
            conversation_id = "conv-1"
            "#,
        )
        .expect("write config");
        let config = WebhookConfig::load(dir.path()).expect("loads");
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].source, "github");
        assert_eq!(config.endpoints[0].secret.as_deref(), Some("s3cr3t"));
    }
}
