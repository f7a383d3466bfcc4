//! Built-in management tools (§4.4): `list_mcp_servers`, `get_server_status`,
//! `enable_server`, `disable_server`, `manage_scope_policies`. Each is
//! registered as a global tool on the [`ToolRegistry`] and receives its
//! `{userId, conversationId}` context implicitly from
//! [`ToolExecutor::execute`] rather than through its JSON input schema.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mcpl_types::ToolCallContent;
use mcpl_types::ToolCallResult;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::delegate_manager::DelegateManager;
use crate::error::Result;
use crate::scope::ScopePolicy;
use crate::scope::ScopeRule;
use crate::scope::ScopeSubsystem;
use crate::scope::parse_capabilities;
use crate::tool_registry::ToolEntry;
use crate::tool_registry::ToolExecutor;
use crate::tool_registry::ToolRegistry;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Servers a user has administratively disabled via `disable_server`.
/// `get_server_status` reports this flag; whether it is actually enforced
/// at tool-call time is up to the embedder's own [`crate::tool_registry::ToolPolicy`]
/// construction, since this state lives outside the registry's resolution
/// path by design (see DESIGN.md).
#[derive(Default)]
pub struct ServerAdminState {
    disabled: Mutex<HashSet<(String, String)>>,
}

impl ServerAdminState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn is_disabled(&self, user_id: &str, server_id: &str) -> bool {
        self.disabled.lock().await.contains(&(user_id.to_string(), server_id.to_string()))
    }

    async fn set_disabled(&self, user_id: &str, server_id: &str, disabled: bool) {
        let mut guard = self.disabled.lock().await;
        let key = (user_id.to_string(), server_id.to_string());
        if disabled {
            guard.insert(key);
        } else {
            guard.remove(&key);
        }
    }
}

fn text_result(value: Value) -> ToolCallResult {
    ToolCallResult {
        content: ToolCallContent::Text(value.to_string()),
        is_error: false,
    }
}

fn error_result(message: impl Into<String>) -> ToolCallResult {
    ToolCallResult {
        content: ToolCallContent::Text(message.into()),
        is_error: true,
    }
}

struct ListServersExecutor {
    delegates: Arc<DelegateManager>,
    admin: Arc<ServerAdminState>,
}

impl ToolExecutor for ListServersExecutor {
    fn execute<'a>(
        &'a self,
        user_id: &'a str,
        _conversation_id: Option<&'a str>,
        _original_name: &'a str,
        _input: Value,
    ) -> BoxFuture<'a, ToolCallResult> {
        Box::pin(async move {
            let mut servers = Vec::new();
            for summary in self.delegates.summaries_for_user(user_id).await {
                let mut server_entries = Vec::new();
                for (server_name, server_id) in self.delegates.server_ids_for_delegate(&summary.delegate_id).await {
                    let enabled = !self.admin.is_disabled(user_id, &server_id).await;
                    server_entries.push(serde_json::json!({
                        "serverName": server_name,
                        "serverId": server_id,
                        "enabled": enabled,
                    }));
                }
                servers.push(serde_json::json!({
                    "delegateId": summary.delegate_id,
                    "toolCount": summary.tool_count,
                    "servers": server_entries,
                }));
            }
            text_result(serde_json::json!({"delegates": servers}))
        })
    }
}

struct GetServerStatusExecutor {
    delegates: Arc<DelegateManager>,
    admin: Arc<ServerAdminState>,
}

impl ToolExecutor for GetServerStatusExecutor {
    fn execute<'a>(
        &'a self,
        user_id: &'a str,
        _conversation_id: Option<&'a str>,
        _original_name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, ToolCallResult> {
        Box::pin(async move {
            let Some(server_id) = input.get("serverId").and_then(Value::as_str) else {
                return error_result("serverId is required");
            };
            let delegate_id = server_id.split('.').next().unwrap_or(server_id);
            let connected = self.delegates.is_connected(user_id, delegate_id).await;
            let enabled = !self.admin.is_disabled(user_id, server_id).await;
            text_result(serde_json::json!({
                "serverId": server_id,
                "connected": connected,
                "enabled": enabled,
            }))
        })
    }
}

struct SetServerEnabledExecutor {
    admin: Arc<ServerAdminState>,
    enabled: bool,
}

impl ToolExecutor for SetServerEnabledExecutor {
    fn execute<'a>(
        &'a self,
        user_id: &'a str,
        _conversation_id: Option<&'a str>,
        _original_name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, ToolCallResult> {
        Box::pin(async move {
            let Some(server_id) = input.get("serverId").and_then(Value::as_str) else {
                return error_result("serverId is required");
            };
            self.admin.set_disabled(user_id, server_id, !self.enabled).await;
            text_result(serde_json::json!({"serverId": server_id, "enabled": self.enabled}))
        })
    }
}

struct ManageScopePoliciesExecutor {
    scope: Arc<ScopeSubsystem>,
}

impl ToolExecutor for ManageScopePoliciesExecutor {
    fn execute<'a>(
        &'a self,
        user_id: &'a str,
        _conversation_id: Option<&'a str>,
        _original_name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, ToolCallResult> {
        Box::pin(async move {
            let Some(delegate_id) = input.get("delegateId").and_then(Value::as_str) else {
                return error_result("delegateId is required");
            };
            let action = input.get("action").and_then(Value::as_str).unwrap_or("list");

            match action {
                "list" => {
                    let ScopePolicy { whitelist, blacklist } = self.scope.policy_for(user_id, delegate_id).await;
                    text_result(serde_json::json!({"whitelist": whitelist, "blacklist": blacklist}))
                }
                "add_whitelist" | "add_blacklist" => {
                    let Some(pattern) = input.get("featureSetPattern").and_then(Value::as_str) else {
                        return error_result("featureSetPattern is required");
                    };
                    let capabilities = input
                        .get("capabilities")
                        .and_then(Value::as_array)
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    let label = input.get("label").and_then(Value::as_str).map(str::to_string);
                    let rule = ScopeRule {
                        feature_set_pattern: pattern.to_string(),
                        capabilities: parse_capabilities(&capabilities),
                        label,
                    };
                    self.scope.add_rule(user_id, delegate_id, rule, action == "add_whitelist").await;
                    text_result(serde_json::json!({"status": "ok"}))
                }
                other => error_result(format!("unknown action {other}")),
            }
        })
    }
}

/// Installs the five built-in management tools as global tools on
/// `registry`.
pub async fn register_builtins(
    registry: &ToolRegistry,
    delegates: Arc<DelegateManager>,
    scope: Arc<ScopeSubsystem>,
    admin: Arc<ServerAdminState>,
) -> Result<()> {
    registry
        .register_global(ToolEntry::new(
            "list_mcp_servers".to_string(),
            "list_mcp_servers".to_string(),
            Some("Lists every connected delegate and the MCP servers it hosts.".to_string()),
            serde_json::json!({"type": "object", "properties": {}}),
            None,
            None,
            Arc::new(ListServersExecutor {
                delegates: delegates.clone(),
                admin: admin.clone(),
            }),
        ))
        .await?;

    registry
        .register_global(ToolEntry::new(
            "get_server_status".to_string(),
            "get_server_status".to_string(),
            Some("Reports whether a server is connected and administratively enabled.".to_string()),
            serde_json::json!({
                "type": "object",
                "properties": {"serverId": {"type": "string"}},
                "required": ["serverId"],
            }),
            None,
            None,
            Arc::new(GetServerStatusExecutor {
                delegates: delegates.clone(),
                admin: admin.clone(),
            }),
        ))
        .await?;

    registry
        .register_global(ToolEntry::new(
            "enable_server".to_string(),
            "enable_server".to_string(),
            Some("Re-enables a previously disabled server.".to_string()),
            serde_json::json!({
                "type": "object",
                "properties": {"serverId": {"type": "string"}},
                "required": ["serverId"],
            }),
            None,
            None,
            Arc::new(SetServerEnabledExecutor {
                admin: admin.clone(),
                enabled: true,
            }),
        ))
        .await?;

    registry
        .register_global(ToolEntry::new(
            "disable_server".to_string(),
            "disable_server".to_string(),
            Some("Administratively disables a server.".to_string()),
            serde_json::json!({
                "type": "object",
                "properties": {"serverId": {"type": "string"}},
                "required": ["serverId"],
            }),
            None,
            None,
            Arc::new(SetServerEnabledExecutor {
                admin: admin.clone(),
                enabled: false,
            }),
        ))
        .await?;

    registry
        .register_global(ToolEntry::new(
            "manage_scope_policies".to_string(),
            "manage_scope_policies".to_string(),
            Some("Lists or updates the scope-elevate whitelist/blacklist for a delegate.".to_string()),
            serde_json::json!({
                "type": "object",
                "properties": {
                    "delegateId": {"type": "string"},
                    "action": {"type": "string", "enum": ["list", "add_whitelist", "add_blacklist"]},
                    "featureSetPattern": {"type": "string"},
                    "capabilities": {"type": "array", "items": {"type": "string"}},
                    "label": {"type": "string"},
                },
                "required": ["delegateId"],
            }),
            None,
            None,
            Arc::new(ManageScopePoliciesExecutor { scope }),
        ))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;
    use crate::collaborators::test_support::RecordingBroadcaster;
    use crate::event_log::EventLog;
    use crate::tool_registry::ToolPolicy;

    async fn registry_with_builtins() -> Arc<ToolRegistry> {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let delegates = DelegateManager::new(broadcaster.clone());
        let dir = tempfile::tempdir().expect("tempdir");
        let event_log = Arc::new(EventLog::new(dir.path().to_path_buf()));
        let scope = ScopeSubsystem::new(
            delegates.clone(),
            broadcaster,
            event_log,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let admin = ServerAdminState::new();
        let registry = ToolRegistry::new();
        register_builtins(&registry, delegates, scope, admin).await.expect("register builtins");
        registry
    }

    #[tokio::test]
    async fn list_mcp_servers_reports_empty_when_none_connected() {
        let registry = registry_with_builtins().await;
        let result = registry
            .execute_tool("list_mcp_servers", serde_json::json!({}), "user-1", None, &ToolPolicy::default())
            .await;
        assert!(!result.is_error);
        let ToolCallContent::Text(text) = result.content else { panic!("expected text content") };
        let parsed: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(parsed["delegates"].as_array().expect("array").len(), 0);
    }

    #[tokio::test]
    async fn disable_then_get_status_reports_disabled() {
        let registry = registry_with_builtins().await;
        let disable = registry
            .execute_tool(
                "disable_server",
                serde_json::json!({"serverId": "alpha.search"}),
                "user-1",
                None,
                &ToolPolicy::default(),
            )
            .await;
        assert!(!disable.is_error);

        let status = registry
            .execute_tool(
                "get_server_status",
                serde_json::json!({"serverId": "alpha.search"}),
                "user-1",
                None,
                &ToolPolicy::default(),
            )
            .await;
        let ToolCallContent::Text(text) = status.content else { panic!("expected text content") };
        let parsed: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(parsed["enabled"], false);
    }

    #[tokio::test]
    async fn manage_scope_policies_add_then_list() {
        let registry = registry_with_builtins().await;
        let add = registry
            .execute_tool(
                "manage_scope_policies",
                serde_json::json!({
                    "delegateId": "alpha",
                    "action": "add_whitelist",
                    "featureSetPattern": "alpha.*",
                    "capabilities": ["push_events"],
                    "label": "trusted",
                }),
                "user-1",
                None,
                &ToolPolicy::default(),
            )
            .await;
        assert!(!add.is_error);

        let list = registry
            .execute_tool(
                "manage_scope_policies",
                serde_json::json!({"delegateId": "alpha", "action": "list"}),
                "user-1",
                None,
                &ToolPolicy::default(),
            )
            .await;
        let ToolCallContent::Text(text) = list.content else { panic!("expected text content") };
        let parsed: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(parsed["whitelist"].as_array().expect("array").len(), 1);
    }
}
