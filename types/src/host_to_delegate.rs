use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::capability::Capability;
use crate::feature_set::FeatureSetMap;

/// Every message the host may send to a delegate, legacy and MCPL alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum HostToDelegate {
    #[serde(rename_all = "camelCase")]
    DelegateAuthResult {
        success: bool,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallRequest {
        request_id: String,
        conversation_id: String,
        #[serde(default)]
        message_id: Option<String>,
        tool: ToolInvocation,
        timeout: u64,
        #[serde(default)]
        scope_context: Option<ScopeContext>,
    },
    #[serde(rename_all = "camelCase")]
    TriggerInferenceResult {
        trigger_id: String,
        success: bool,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        response: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    Pong {
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ToolManifestAck {
        tool_count: usize,
        tools: Vec<String>,
    },

    #[serde(rename = "mcpl/ack", rename_all = "camelCase")]
    Ack {
        session_id: String,
        negotiated_capabilities: Vec<Capability>,
        feature_sets: FeatureSetMap,
        #[serde(default)]
        resumed_from_seq: Option<u64>,
    },
    #[serde(rename = "mcpl/beforeInference", rename_all = "camelCase")]
    BeforeInference {
        request_id: String,
        conversation_id: String,
        #[serde(default)]
        messages_summary: Option<String>,
    },
    #[serde(rename = "mcpl/afterInference", rename_all = "camelCase")]
    AfterInference {
        request_id: String,
        conversation_id: String,
        #[serde(default)]
        messages_summary: Option<String>,
    },
    #[serde(rename = "mcpl/inference_chunk", rename_all = "camelCase")]
    InferenceChunk {
        request_id: String,
        chunk_index: u64,
        delta: String,
    },
    #[serde(rename = "mcpl/inference_response", rename_all = "camelCase")]
    InferenceResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "mcpl/scope_change_result", rename_all = "camelCase")]
    ScopeChangeResult {
        request_id: String,
        approved: bool,
        #[serde(default)]
        new_capabilities: Option<Vec<Capability>>,
    },
    #[serde(rename = "mcpl/scope_elevate_result", rename_all = "camelCase")]
    ScopeElevateResult {
        request_id: String,
        approved: bool,
        #[serde(default)]
        new_capabilities: Option<Vec<Capability>>,
    },
    #[serde(rename = "mcpl/state_patch_result", rename_all = "camelCase")]
    StatePatchResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "mcpl/state_response", rename_all = "camelCase")]
    StateResponse {
        request_id: String,
        state: Option<Value>,
        #[serde(default)]
        rolled_back: Option<bool>,
        #[serde(default)]
        checkpoint_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "mcpl/checkpoint_list_response", rename_all = "camelCase")]
    CheckpointListResponse {
        request_id: String,
        current: Option<String>,
        checkpoints: Vec<CheckpointSummary>,
    },
    #[serde(rename = "mcpl/model_info_response", rename_all = "camelCase")]
    ModelInfoResponse {
        request_id: String,
        model_id: String,
        provider: String,
        context_window: u64,
        output_token_limit: u64,
        supports_thinking: bool,
        supports_prefill: bool,
        capabilities: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Capabilities made available to a delegate for the duration of one tool
/// call, because its feature set enabled a scope-gated capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeContext {
    pub feature_set: String,
    pub active_capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub id: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub created_at: u64,
    pub is_current: bool,
    #[serde(default)]
    pub label: Option<String>,
    pub mutation_count: u64,
}
