use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::feature_set::FeatureSet;
use crate::tool::ToolCallResult;
use crate::tool::ToolManifestEntry;

/// Every message a delegate may send to the host, legacy and MCPL alike.
/// Framed messages (everything after `mcpl/hello`) travel inside a
/// [`crate::ReliableFrame`]; legacy messages pass through unframed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DelegateToHost {
    /// Legacy pre-MCPL handshake.
    #[serde(rename_all = "camelCase")]
    DelegateAuth {
        version: String,
        token: Option<String>,
        delegate_id: String,
        capabilities: Vec<String>,
    },
    /// `delegateId` is accepted for backward compatibility but ignored: the
    /// value established during the handshake is canonical.
    #[serde(rename_all = "camelCase")]
    ToolManifest {
        delegate_id: String,
        tools: Vec<ToolManifestEntry>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallResponse {
        request_id: String,
        tool_use_id: String,
        result: ToolCallResult,
    },
    #[serde(rename_all = "camelCase")]
    TriggerInference {
        trigger_id: String,
        source: String,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        participant_id: Option<String>,
        context: Value,
        #[serde(default)]
        system_message: Option<String>,
    },
    Ping {
        timestamp: u64,
    },

    #[serde(rename = "mcpl/hello", rename_all = "camelCase")]
    Hello {
        protocol_version: String,
        capabilities: Vec<String>,
        delegate_id: String,
        delegate_name: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        last_received_seq: Option<u64>,
    },
    #[serde(rename = "mcpl/beforeInference_response", rename_all = "camelCase")]
    BeforeInferenceResponse {
        request_id: String,
        injections: Vec<HookInjection>,
    },
    #[serde(rename = "mcpl/afterInference_ack", rename_all = "camelCase")]
    AfterInferenceAck { request_id: String },
    #[serde(rename = "mcpl/push_event", rename_all = "camelCase")]
    PushEvent {
        id: String,
        source: String,
        conversation_id: String,
        event_type: String,
        payload: Value,
        #[serde(default)]
        system_message: Option<String>,
        #[serde(default)]
        idempotency_key: Option<String>,
        timestamp: u64,
    },
    #[serde(rename = "mcpl/inference_request", rename_all = "camelCase")]
    InferenceRequest {
        request_id: String,
        server_id: String,
        conversation_id: String,
        #[serde(default)]
        system_message: Option<String>,
        user_message: String,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        stream: bool,
    },
    #[serde(rename = "mcpl/scope_change_request", rename_all = "camelCase")]
    ScopeChangeRequest {
        request_id: String,
        server_id: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        server_name: Option<String>,
        requested_capabilities: Vec<String>,
        reason: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    #[serde(rename = "mcpl/scope_elevate_request", rename_all = "camelCase")]
    ScopeElevateRequest {
        request_id: String,
        delegate_id: String,
        server_id: String,
        conversation_id: String,
        feature_set: String,
        label: String,
        requested_capabilities: Vec<String>,
        reason: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    #[serde(rename = "mcpl/connect_server_result", rename_all = "camelCase")]
    ConnectServerResult {
        request_id: String,
        url: String,
        success: bool,
        #[serde(default)]
        server_id: Option<String>,
        #[serde(default)]
        tools: Option<Vec<ToolManifestEntry>>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "mcpl/featureSets_changed", rename_all = "camelCase")]
    FeatureSetsChanged {
        feature_sets: HashMap<String, FeatureSet>,
    },
    #[serde(rename = "mcpl/state_set", rename_all = "camelCase")]
    StateSet {
        request_id: String,
        conversation_id: String,
        state: Value,
    },
    #[serde(rename = "mcpl/state_patch", rename_all = "camelCase")]
    StatePatch {
        request_id: String,
        conversation_id: String,
        patch: crate::JsonPatch,
    },
    #[serde(rename = "mcpl/state_rollback", rename_all = "camelCase")]
    StateRollback {
        request_id: String,
        conversation_id: String,
        #[serde(default)]
        checkpoint_id: Option<String>,
    },
    #[serde(rename = "mcpl/state_get", rename_all = "camelCase")]
    StateGet {
        request_id: String,
        conversation_id: String,
    },
    #[serde(rename = "mcpl/checkpoint_list", rename_all = "camelCase")]
    CheckpointList {
        request_id: String,
        conversation_id: String,
    },
    #[serde(rename = "mcpl/model_info_request", rename_all = "camelCase")]
    ModelInfoRequest { request_id: String },
}

/// One item of a `beforeInference_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookInjection {
    pub server_id: String,
    pub position: InjectionPosition,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InjectionPosition {
    System,
    BeforeUser,
    AfterUser,
}
