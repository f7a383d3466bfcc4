//! Default implementations of the collaborator traits `mcpl-core` leaves to
//! the embedding application: authentication, the LLM adapter, and
//! conversation-to-model binding. These exist so the binary links and runs
//! end to end; a production deployment replaces [`PassthroughAuthResolver`]
//! and [`UnconfiguredInferenceEngine`] with its own.

use std::sync::Arc;

use mcpl_core::AuthResolver;
use mcpl_core::ConversationModelResolver;
use mcpl_core::CoreError;
use mcpl_core::InferenceChunk;
use mcpl_core::InferenceEngine;
use mcpl_core::InferenceOutcome;
use mcpl_core::PushEventEntry;
use mcpl_core::PushEventHandler;
use mcpl_core::Result as CoreResult;
use mcpl_core::RoomBroadcaster;
use mcpl_core::TriggerInferenceHandler;
use serde_json::Value;

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Treats the bearer credential as the user id directly. A stand-in for
/// whatever token/API-key validation the real auth layer performs.
pub struct PassthroughAuthResolver;

impl AuthResolver for PassthroughAuthResolver {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, CoreResult<String>> {
        Box::pin(async move {
            if credential.is_empty() {
                return Err(CoreError::Unavailable("empty credential".to_string()));
            }
            Ok(credential.to_string())
        })
    }
}

/// No conversation has a pinned model by default; the Inference Router is
/// the only source of model selection until a real resolver is wired in.
pub struct NoneModelResolver;

impl ConversationModelResolver for NoneModelResolver {
    fn model_for<'a>(&'a self, _conversation_id: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move { None })
    }
}

/// Stands in for the LLM inference adapter. Every call fails with a message
/// explaining that no engine is configured; swap in an adapter to the real
/// model provider before deploying.
pub struct UnconfiguredInferenceEngine;

impl InferenceEngine for UnconfiguredInferenceEngine {
    fn run<'a>(
        &'a self,
        _conversation_id: &'a str,
        _model: Option<&'a str>,
        _prompt: &'a Value,
        _on_chunk: Box<dyn FnMut(InferenceChunk) + Send + 'a>,
    ) -> BoxFuture<'a, CoreResult<InferenceOutcome>> {
        Box::pin(async move { Err(CoreError::Unavailable("no inference engine configured".to_string())) })
    }

    fn model_info<'a>(&'a self, _conversation_id: &'a str) -> BoxFuture<'a, CoreResult<Value>> {
        Box::pin(async move { Ok(serde_json::json!({"modelId": "unconfigured", "provider": "none"})) })
    }
}

/// Bridges the legacy `push_event`/`trigger_inference` flows to the
/// `InferenceEngine`: builds a prompt from whatever context the delegate
/// sent, runs it, and streams chunks to the conversation's UI room as they
/// arrive.
pub struct InferenceBridge {
    engine: Arc<dyn InferenceEngine>,
    model_resolver: Arc<dyn ConversationModelResolver>,
    broadcaster: Arc<dyn RoomBroadcaster>,
}

impl InferenceBridge {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        model_resolver: Arc<dyn ConversationModelResolver>,
        broadcaster: Arc<dyn RoomBroadcaster>,
    ) -> Arc<Self> {
        Arc::new(Self { engine, model_resolver, broadcaster })
    }

    async fn run_for_conversation(&self, user_id: &str, conversation_id: &str, prompt: Value) -> Result<String, String> {
        let model = self.model_resolver.model_for(conversation_id).await;
        let user_id_owned = user_id.to_string();
        let conversation_id_owned = conversation_id.to_string();

        // `on_chunk` fires synchronously as the engine streams, but
        // broadcasting is async. Relay through an unbounded queue drained by
        // one task so chunks reach the UI room in the order the engine
        // produced them, rather than racing one spawned task per chunk.
        let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let relay_broadcaster = self.broadcaster.clone();
        let relay_user_id = user_id_owned.clone();
        let relay_task = tokio::spawn(async move {
            while let Some(payload) = chunk_rx.recv().await {
                relay_broadcaster.broadcast(&relay_user_id, payload).await;
            }
        });

        let on_chunk: Box<dyn FnMut(InferenceChunk) + Send> = Box::new(move |chunk: InferenceChunk| {
            let _ = chunk_tx.send(serde_json::json!({
                "type": "inference_chunk",
                "conversationId": conversation_id_owned,
                "delta": chunk.delta,
                "done": chunk.done,
            }));
        });

        let outcome = self
            .engine
            .run(conversation_id, model.as_deref(), &prompt, on_chunk)
            .await
            .map(|outcome| outcome.content)
            .map_err(|error| error.to_string());
        let _ = relay_task.await;
        outcome
    }
}

impl PushEventHandler for InferenceBridge {
    fn handle<'a>(&'a self, entry: &'a PushEventEntry) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let prompt = serde_json::json!({
                "source": entry.source,
                "eventType": entry.event_type,
                "payload": entry.payload,
                "systemMessage": entry.system_message,
            });
            self.run_for_conversation(&entry.user_id, &entry.conversation_id, prompt).await
        })
    }
}

impl TriggerInferenceHandler for InferenceBridge {
    fn handle<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: Option<&'a str>,
        participant_id: Option<&'a str>,
        context: &'a Value,
        system_message: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, String>> {
        Box::pin(async move {
            let Some(conversation_id) = conversation_id else {
                return Err("trigger_inference requires a conversationId".to_string());
            };
            let prompt = serde_json::json!({
                "participantId": participant_id,
                "context": context,
                "systemMessage": system_message,
            });
            self.run_for_conversation(user_id, conversation_id, prompt).await
        })
    }
}
