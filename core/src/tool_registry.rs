//! Tool Registry (§4.4): the namespaced store of tools visible to the
//! inference engine, split between server-hosted global tools and
//! delegate-scoped tools prefixed `{delegate}__{name}`.
//!
//! The registry never talks to a delegate itself — each entry carries an
//! [`Arc<dyn ToolExecutor>`] closed over whatever is needed to actually run
//! it (a `DelegateManager` handle for delegate tools, or a management
//! closure for the built-ins registered by [`crate::management`]).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mcpl_types::ToolCallContent;
use mcpl_types::ToolCallResult;
use mcpl_types::ToolManifestEntry;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::error::Result;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Separator forbidden in raw tool names, used to prefix delegate tools.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Runs a resolved tool call to completion. Implemented either by a
/// delegate round-trip (closed over the original, unprefixed name and the
/// owning delegate id) or by a built-in management handler.
pub trait ToolExecutor: Send + Sync {
    /// `original_name` is the unprefixed name the delegate (or built-in)
    /// originally advertised, passed separately from `input` because one
    /// executor is shared by every tool a delegate's manifest contributes.
    fn execute<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: Option<&'a str>,
        original_name: &'a str,
        input: Value,
    ) -> BoxFuture<'a, ToolCallResult>;
}

/// One entry in the registry: everything the inference engine and the
/// executor need, regardless of whether the tool is global or delegate-scoped.
pub struct ToolEntry {
    /// Name visible to the inference engine: the bare name for global
    /// tools, `{lower(delegateId)}__{originalName}` for delegate tools.
    pub display_name: String,
    /// Name sent back to the delegate on execution.
    pub original_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub delegate_id: Option<String>,
    pub server_id: Option<String>,
    executor: Arc<dyn ToolExecutor>,
}

impl ToolEntry {
    /// Constructs an entry directly, for registrars outside this module
    /// (the built-in management tools) that don't go through
    /// [`ToolRegistry::install_delegate_tools`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        display_name: String,
        original_name: String,
        description: Option<String>,
        input_schema: Value,
        delegate_id: Option<String>,
        server_id: Option<String>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        Self {
            display_name,
            original_name,
            description,
            input_schema,
            delegate_id,
            server_id,
            executor,
        }
    }

    /// The manifest-shaped view of this entry, used for hashing and for
    /// the `list_mcp_servers` built-in.
    pub fn manifest_entry(&self) -> ToolManifestEntry {
        ToolManifestEntry {
            name: self.display_name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            server_name: self.server_id.clone(),
        }
    }
}

/// Per-participant policy applied after a tool name is resolved.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub tools_enabled: Option<bool>,
    pub enabled_tools: Option<Vec<String>>,
}

impl ToolPolicy {
    fn allows(&self, display_name: &str, original_name: &str) -> bool {
        if self.tools_enabled == Some(false) {
            return false;
        }
        match &self.enabled_tools {
            None => true,
            Some(list) => list.iter().any(|t| t == display_name || t == original_name),
        }
    }
}

/// A call resolved against the registry, ready to dispatch.
pub struct ResolvedCall {
    pub display_name: String,
    pub original_name: String,
    executor: Arc<dyn ToolExecutor>,
}

#[derive(Default)]
pub struct ToolRegistry {
    global: RwLock<HashMap<String, ToolEntry>>,
    /// Keyed by `{userId}:{prefixedName}`.
    delegate: RwLock<HashMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_global(&self, entry: ToolEntry) -> Result<()> {
        if entry.display_name.contains(NAMESPACE_SEPARATOR) {
            return Err(CoreError::InvalidDelegateId(format!(
                "global tool name {} must not contain {NAMESPACE_SEPARATOR}",
                entry.display_name
            )));
        }
        self.global.write().await.insert(entry.display_name.clone(), entry);
        Ok(())
    }

    /// Replaces every delegate tool belonging to `(user_id, delegate_id)`
    /// with `tools`, namespaced `{lower(delegate_id)}__{name}`. `executor`
    /// is shared by every tool of this delegate; it is expected to close
    /// over the delegate manager and delegate id.
    pub async fn install_delegate_tools(
        &self,
        user_id: &str,
        delegate_id: &str,
        server_id_for: impl Fn(&str) -> Option<String>,
        tools: Vec<ToolManifestEntry>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Result<Vec<String>> {
        let prefix = delegate_id.to_lowercase();
        let mut delegate_map = self.delegate.write().await;
        delegate_map.retain(|key, entry| {
            !(entry.delegate_id.as_deref() == Some(delegate_id) && key.starts_with(&format!("{user_id}:")))
        });

        let mut installed = Vec::with_capacity(tools.len());
        for tool in tools {
            if tool.name.contains(NAMESPACE_SEPARATOR) {
                return Err(CoreError::InvalidDelegateId(format!(
                    "tool name {} must not contain {NAMESPACE_SEPARATOR}",
                    tool.name
                )));
            }
            let display_name = format!("{prefix}{NAMESPACE_SEPARATOR}{}", tool.name);
            let key = format!("{user_id}:{display_name}");
            delegate_map.insert(
                key,
                ToolEntry {
                    display_name: display_name.clone(),
                    original_name: tool.name.clone(),
                    description: tool.description,
                    input_schema: tool.input_schema,
                    delegate_id: Some(delegate_id.to_string()),
                    server_id: server_id_for(&tool.server_name.unwrap_or_default()),
                    executor: executor.clone(),
                },
            );
            installed.push(display_name);
        }
        Ok(installed)
    }

    /// Removes every tool belonging to `(user_id, delegate_id)`. Called on
    /// disconnect once the reconnect-race guard has confirmed no
    /// replacement connection is live.
    pub async fn remove_delegate_tools(&self, user_id: &str, delegate_id: &str) {
        let mut delegate_map = self.delegate.write().await;
        delegate_map.retain(|key, entry| {
            !(entry.delegate_id.as_deref() == Some(delegate_id) && key.starts_with(&format!("{user_id}:")))
        });
    }

    /// All tools currently visible to `user_id` (global plus their own
    /// delegate tools), for manifest broadcast and toolset hashing.
    pub async fn visible_tools(&self, user_id: &str) -> Vec<ToolManifestEntry> {
        let global = self.global.read().await;
        let delegate = self.delegate.read().await;
        let prefix = format!("{user_id}:");
        global
            .values()
            .map(ToolEntry::manifest_entry)
            .chain(
                delegate
                    .iter()
                    .filter(|(key, _)| key.starts_with(&prefix))
                    .map(|(_, entry)| entry.manifest_entry()),
            )
            .collect()
    }

    /// Resolves `name` to a runnable entry for `user_id`, applying the
    /// three-step order from §4.4: exact global, exact prefixed, then the
    /// unprefixed compat shim (resolved only when exactly one candidate
    /// exists). Policy is *not* applied here, so an ambiguity error stays
    /// informative rather than being swallowed by a "not allowed" error.
    pub async fn resolve(&self, name: &str, user_id: &str) -> Result<ResolvedCall> {
        if let Some(entry) = self.global.read().await.get(name) {
            return Ok(ResolvedCall {
                display_name: entry.display_name.clone(),
                original_name: entry.original_name.clone(),
                executor: entry.executor.clone(),
            });
        }

        let delegate = self.delegate.read().await;
        let prefix = format!("{user_id}:");
        let exact_key = format!("{user_id}:{name}");
        if let Some(entry) = delegate.get(&exact_key) {
            return Ok(ResolvedCall {
                display_name: entry.display_name.clone(),
                original_name: entry.original_name.clone(),
                executor: entry.executor.clone(),
            });
        }

        let candidates: Vec<&ToolEntry> = delegate
            .iter()
            .filter(|(key, entry)| key.starts_with(&prefix) && entry.original_name == name)
            .map(|(_, entry)| entry)
            .collect();

        match candidates.as_slice() {
            [] => Err(CoreError::UnknownTool(name.to_string())),
            [only] => Ok(ResolvedCall {
                display_name: only.display_name.clone(),
                original_name: only.original_name.clone(),
                executor: only.executor.clone(),
            }),
            many => Err(CoreError::AmbiguousTool {
                name: name.to_string(),
                candidates: many.iter().map(|e| e.display_name.clone()).collect(),
            }),
        }
    }

    /// Resolves, applies `policy`, then executes. Exactly one `ToolResult`
    /// comes out, even on a resolution or policy failure.
    pub async fn execute_tool(
        &self,
        name: &str,
        input: Value,
        user_id: &str,
        conversation_id: Option<&str>,
        policy: &ToolPolicy,
    ) -> ToolCallResult {
        let resolved = match self.resolve(name, user_id).await {
            Ok(resolved) => resolved,
            Err(error) => return error_result(error),
        };

        if !policy.allows(&resolved.display_name, &resolved.original_name) {
            return error_result(CoreError::ToolNotAllowed(resolved.display_name));
        }

        resolved
            .executor
            .execute(user_id, conversation_id, &resolved.original_name, input)
            .await
    }
}

fn error_result(error: CoreError) -> ToolCallResult {
    ToolCallResult {
        content: ToolCallContent::Text(error.to_string()),
        is_error: true,
    }
}

/// Canonical-JSON SHA-256 of a toolset, truncated to 16 hex chars and
/// prefixed `sha256:`. Order-independent: tools are sorted by name and
/// every nested object's keys are sorted before serialization, so the
/// result does not depend on whether `serde_json`'s `preserve_order`
/// feature happens to be enabled elsewhere in the dependency graph.
pub fn compute_toolset_hash(tools: &[ToolManifestEntry]) -> String {
    if tools.is_empty() {
        return "sha256:empty".to_string();
    }
    let mut sorted = tools.to_vec();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let value = serde_json::to_value(&sorted).unwrap_or(Value::Null);
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("sha256:{}", &hex::encode(digest)[..16])
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                if let Some(nested) = map.get(*key) {
                    write_canonical(nested, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).unwrap_or_default()),
    }
}
