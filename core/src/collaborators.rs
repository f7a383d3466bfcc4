//! Trait seams to the host's own surrounding systems: the inference engine
//! that actually talks to a model, the room/UI broadcast fabric, and
//! whatever authenticates an inbound delegate connection.
//!
//! These are implemented by the embedding application, not by this crate.
//! `mcpl-core` only needs `dyn` object safety, so methods return boxed
//! futures by hand rather than depending on an `async_trait` macro.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::Result;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A single streamed piece of a model response, handed to the caller of
/// [`InferenceEngine::run`] as it arrives.
#[derive(Debug, Clone)]
pub struct InferenceChunk {
    pub delta: String,
    pub done: bool,
}

/// The final, assembled result of an inference call.
#[derive(Debug, Clone)]
pub struct InferenceOutcome {
    pub content: String,
    pub model: String,
}

/// Adapter to the chat/inference server's own model-calling machinery.
/// `mcpl-core` never talks to a model provider directly; it calls through
/// this trait so the Inference Broker and Hook Manager stay provider-agnostic.
pub trait InferenceEngine: Send + Sync {
    /// Runs a single inference request, invoking `on_chunk` for every
    /// streamed delta before resolving with the final outcome.
    fn run<'a>(
        &'a self,
        conversation_id: &'a str,
        model: Option<&'a str>,
        prompt: &'a Value,
        on_chunk: Box<dyn FnMut(InferenceChunk) + Send + 'a>,
    ) -> BoxFuture<'a, Result<InferenceOutcome>>;

    /// Returns metadata about the model currently bound to a conversation,
    /// answering `mcpl/model_info_request`.
    fn model_info<'a>(&'a self, conversation_id: &'a str) -> BoxFuture<'a, Result<Value>>;
}

/// Adapter to the chat UI's broadcast fabric, used to deliver push events
/// and inference responses to humans watching a conversation.
pub trait RoomBroadcaster: Send + Sync {
    /// Delivers an arbitrary JSON payload to every client subscribed to
    /// `user_id`'s room. Rooms are per-user, not per-conversation: a user's
    /// single UI connection watches every one of their conversations at
    /// once and filters by the `conversationId` the payload itself carries.
    fn broadcast<'a>(&'a self, user_id: &'a str, payload: Value) -> BoxFuture<'a, ()>;
}

/// Resolves a delegate connection's credentials (bearer token or API key)
/// to the user id that owns the resulting session.
pub trait AuthResolver: Send + Sync {
    fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Resolves the model a conversation is configured to use, consulted by
/// the Inference Broker when the Inference Router has no matching rule.
pub trait ConversationModelResolver: Send + Sync {
    fn model_for<'a>(&'a self, conversation_id: &'a str) -> BoxFuture<'a, Option<String>>;
}

/// Handles a delegate's legacy `trigger_inference` request: builds
/// whatever user-facing message `context`/`system_message` imply and
/// drives an inference over it, synchronously, outside the Event Queue's
/// push-event machinery (no idempotency, no FIFO — the delegate is asking
/// for an immediate reply, not scheduling a future turn).
pub trait TriggerInferenceHandler: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn handle<'a>(
        &'a self,
        user_id: &'a str,
        conversation_id: Option<&'a str>,
        participant_id: Option<&'a str>,
        context: &'a Value,
        system_message: Option<&'a str>,
    ) -> BoxFuture<'a, std::result::Result<String, String>>;
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    /// A fake `InferenceEngine` that echoes the prompt back as a single
    /// chunk, for tests that only need the broker/hook plumbing exercised.
    pub struct EchoInferenceEngine;

    impl InferenceEngine for EchoInferenceEngine {
        fn run<'a>(
            &'a self,
            _conversation_id: &'a str,
            model: Option<&'a str>,
            prompt: &'a Value,
            mut on_chunk: Box<dyn FnMut(InferenceChunk) + Send + 'a>,
        ) -> BoxFuture<'a, Result<InferenceOutcome>> {
            let content = prompt.to_string();
            Box::pin(async move {
                on_chunk(InferenceChunk {
                    delta: content.clone(),
                    done: true,
                });
                Ok(InferenceOutcome {
                    content,
                    model: model.unwrap_or("test-model").to_string(),
                })
            })
        }

        fn model_info<'a>(&'a self, _conversation_id: &'a str) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move { Ok(serde_json::json!({"model": "test-model"})) })
        }
    }

    /// Records every broadcast payload for assertions.
    #[derive(Default, Clone)]
    pub struct RecordingBroadcaster {
        pub sent: Arc<Mutex<Vec<(String, Value)>>>,
    }

    impl RoomBroadcaster for RecordingBroadcaster {
        fn broadcast<'a>(&'a self, user_id: &'a str, payload: Value) -> BoxFuture<'a, ()> {
            let sent = self.sent.clone();
            let user_id = user_id.to_string();
            Box::pin(async move {
                sent.lock().unwrap().push((user_id, payload));
            })
        }
    }

    /// Resolves any non-empty credential to a fixed user id.
    pub struct StaticAuthResolver(pub String);

    impl AuthResolver for StaticAuthResolver {
        fn resolve<'a>(&'a self, credential: &'a str) -> BoxFuture<'a, Result<String>> {
            let user_id = self.0.clone();
            Box::pin(async move {
                if credential.is_empty() {
                    return Err(crate::error::CoreError::InvalidDelegateId(
                        "empty credential".to_string(),
                    ));
                }
                Ok(user_id)
            })
        }
    }

    /// Always resolves to the same configured model, or `None`.
    pub struct FixedModelResolver(pub Option<String>);

    impl ConversationModelResolver for FixedModelResolver {
        fn model_for<'a>(&'a self, _conversation_id: &'a str) -> BoxFuture<'a, Option<String>> {
            let model = self.0.clone();
            Box::pin(async move { model })
        }
    }
}
