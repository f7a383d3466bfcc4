//! Inference Router (§4.11, §6 "Config file"): first-match rule engine
//! mapping `(featureSet, delegateId, serverId, tag)` to `(provider,
//! model)`, hot-reloaded from `inference-routing.json` on an mtime poll.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use serde::Deserialize;
use tokio::sync::RwLock;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const CONFIG_FILE: &str = "inference-routing.json";

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    #[serde(default)]
    pub feature_set: Option<String>,
    #[serde(default)]
    pub delegate_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RouteTarget {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct Rule {
    #[serde(rename = "match")]
    match_: RuleMatch,
    route: RouteTarget,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct DefaultTarget {
    #[serde(default)]
    use_conversation_model: Option<bool>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct RoutingFile {
    #[serde(default)]
    rules: Vec<Rule>,
    #[serde(default)]
    default: Option<DefaultTarget>,
}

/// What the router resolved a request to: an explicit route, or a
/// deferral to the conversation's own configured model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Route(RouteTarget),
    UseConversationModel,
}

#[derive(Debug, Clone, Default)]
struct RoutingConfig {
    rules: Vec<Rule>,
    default: Option<DefaultTarget>,
}

pub struct InferenceRouter {
    path: PathBuf,
    config: RwLock<RoutingConfig>,
    last_mtime: RwLock<Option<SystemTime>>,
}

impl InferenceRouter {
    /// Loads `{mcpl_home}/inference-routing.json` once synchronously (so
    /// the first request after startup already has rules) and spawns a
    /// background mtime poll to keep the config warm.
    pub async fn spawn(mcpl_home: &Path) -> Arc<Self> {
        let path = mcpl_home.join(CONFIG_FILE);
        let router = Arc::new(Self {
            path: path.clone(),
            config: RwLock::new(RoutingConfig::default()),
            last_mtime: RwLock::new(None),
        });
        router.reload_if_changed().await;

        let poller = router.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                poller.reload_if_changed().await;
            }
        });
        router
    }

    async fn reload_if_changed(&self) {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(_) => return,
        };
        let mtime = metadata.modified().ok();
        if mtime.is_some() && mtime == *self.last_mtime.read().await {
            return;
        }

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "failed to read inference routing config");
                return;
            }
        };
        let parsed: RoutingFile = match serde_json::from_str(&contents) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(%error, "failed to parse inference-routing.json, keeping previous config");
                return;
            }
        };

        let rules: Vec<Rule> = parsed
            .rules
            .into_iter()
            .filter(|rule| {
                let known = !rule.route.model.is_empty();
                if !known {
                    tracing::warn!(provider = %rule.route.provider, "skipping rule with unknown/empty model");
                }
                known
            })
            .collect();

        *self.config.write().await = RoutingConfig {
            rules,
            default: parsed.default,
        };
        *self.last_mtime.write().await = mtime;
    }

    /// First-match resolution. Falls back to `UseConversationModel` when
    /// no rule matches and the default says so (or there is no default at
    /// all, which is the same posture: let the conversation decide).
    pub async fn resolve(
        &self,
        feature_set: Option<&str>,
        delegate_id: Option<&str>,
        server_id: Option<&str>,
        tag: Option<&str>,
    ) -> Resolution {
        let config = self.config.read().await;
        for rule in &config.rules {
            let matches = field_matches(&rule.match_.feature_set, feature_set)
                && field_matches(&rule.match_.delegate_id, delegate_id)
                && field_matches(&rule.match_.server_id, server_id)
                && field_matches(&rule.match_.tag, tag);
            if matches {
                return Resolution::Route(rule.route.clone());
            }
        }

        match &config.default {
            Some(DefaultTarget {
                provider: Some(provider),
                model: Some(model),
                ..
            }) => Resolution::Route(RouteTarget {
                provider: provider.clone(),
                model: model.clone(),
            }),
            _ => Resolution::UseConversationModel,
        }
    }
}

fn field_matches(rule_value: &Option<String>, given: Option<&str>) -> bool {
    match rule_value {
        None => true,
        Some(expected) => given == Some(expected.as_str()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::json!({
                "rules": [
                    {"match": {"delegateId": "alpha"}, "route": {"provider": "anthropic", "model": "claude"}},
                    {"match": {}, "route": {"provider": "openai", "model": "gpt"}},
                ],
                "default": {"useConversationModel": true}
            })
            .to_string(),
        )
        .expect("write config");

        let router = InferenceRouter::spawn(dir.path()).await;
        let resolved = router.resolve(None, Some("alpha"), None, None).await;
        assert_eq!(
            resolved,
            Resolution::Route(RouteTarget {
                provider: "anthropic".to_string(),
                model: "claude".to_string()
            })
        );

        let fallback = router.resolve(None, Some("gamma"), None, None).await;
        assert_eq!(
            fallback,
            Resolution::Route(RouteTarget {
                provider: "openai".to_string(),
                model: "gpt".to_string()
            })
        );
    }

    #[tokio::test]
    async fn missing_config_falls_back_to_conversation_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = InferenceRouter::spawn(dir.path()).await;
        assert_eq!(router.resolve(None, None, None, None).await, Resolution::UseConversationModel);
    }

    #[tokio::test]
    async fn rule_with_empty_model_is_skipped_at_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::json!({
                "rules": [
                    {"match": {}, "route": {"provider": "broken", "model": ""}},
                ],
            })
            .to_string(),
        )
        .expect("write config");

        let router = InferenceRouter::spawn(dir.path()).await;
        assert_eq!(router.resolve(None, None, None, None).await, Resolution::UseConversationModel);
    }
}
