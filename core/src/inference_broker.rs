//! Inference Broker (§4.7): mediates MCP-server-to-host inference
//! requests behind a global hourly quota, streaming chunks back over the
//! requesting delegate's Reliable Channel.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use mcpl_types::HostToDelegate;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::collaborators::ConversationModelResolver;
use crate::collaborators::InferenceChunk;
use crate::collaborators::InferenceEngine;
use crate::collaborators::RoomBroadcaster;
use crate::delegate_manager::DelegateManager;
use crate::inference_router::InferenceRouter;
use crate::inference_router::Resolution;

#[derive(Debug, Clone)]
pub struct InferenceRequestPayload {
    pub request_id: String,
    pub server_id: String,
    pub conversation_id: String,
    pub system_message: Option<String>,
    pub user_message: String,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

pub struct InferenceBroker {
    max_per_hour: u32,
    timestamps: Mutex<Vec<Instant>>,
    router: Arc<InferenceRouter>,
    delegates: Arc<DelegateManager>,
    engine: Arc<dyn InferenceEngine>,
    model_resolver: Arc<dyn ConversationModelResolver>,
    broadcaster: Arc<dyn RoomBroadcaster>,
}

impl InferenceBroker {
    pub fn new(
        max_per_hour: u32,
        router: Arc<InferenceRouter>,
        delegates: Arc<DelegateManager>,
        engine: Arc<dyn InferenceEngine>,
        model_resolver: Arc<dyn ConversationModelResolver>,
        broadcaster: Arc<dyn RoomBroadcaster>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_per_hour,
            timestamps: Mutex::new(Vec::new()),
            router,
            delegates,
            engine,
            model_resolver,
            broadcaster,
        })
    }

    pub async fn handle_request(&self, user_id: &str, delegate_id: &str, request: InferenceRequestPayload) {
        let now = Instant::now();
        {
            let mut timestamps = self.timestamps.lock().await;
            timestamps.retain(|t| now.duration_since(*t) < Duration::from_secs(60 * 60));
            if timestamps.len() as u32 >= self.max_per_hour {
                drop(timestamps);
                self.respond_error(user_id, delegate_id, &request, "inference quota exceeded").await;
                self.broadcaster
                    .broadcast(
                        user_id,
                        serde_json::json!({
                            "type": "inference_rate_limited",
                            "requestId": request.request_id,
                            "conversationId": request.conversation_id,
                        }),
                    )
                    .await;
                return;
            }
        }

        let model = match self
            .router
            .resolve(None, Some(delegate_id), Some(&request.server_id), None)
            .await
        {
            Resolution::Route(route) => Some(format!("{}/{}", route.provider, route.model)),
            Resolution::UseConversationModel => self.model_resolver.model_for(&request.conversation_id).await,
        };

        let prompt = serde_json::json!({
            "system": request.system_message,
            "user": request.user_message,
            "maxTokens": request.max_tokens,
        });

        let Some(channel) = self.delegates.channel_for(user_id, delegate_id).await else {
            return;
        };

        let stream = request.stream;
        let request_id = request.request_id.clone();

        // `on_chunk` is a synchronous callback invoked by the engine as
        // chunks arrive, but sending a frame is async and must preserve
        // send order on the Reliable Channel. Relay chunks through an
        // unbounded queue drained by a single task that awaits each send
        // in turn, rather than spawning one task per chunk (which would
        // race and could deliver `chunkIndex`es out of seq order).
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<HostToDelegate>();
        let relay_channel = channel.clone();
        let relay_task = tokio::spawn(async move {
            while let Some(message) = chunk_rx.recv().await {
                if let Ok(payload) = serde_json::to_value(&message) {
                    let _ = relay_channel.send(payload).await;
                }
            }
        });

        let mut next_chunk_index = 0u64;
        let on_chunk = Box::new(move |chunk: InferenceChunk| {
            if !stream || chunk.delta.is_empty() {
                return;
            }
            let index = next_chunk_index;
            next_chunk_index += 1;
            let message = HostToDelegate::InferenceChunk {
                request_id: request_id.clone(),
                chunk_index: index,
                delta: chunk.delta,
            };
            let _ = chunk_tx.send(message);
        });

        let outcome = self.engine.run(&request.conversation_id, model.as_deref(), &prompt, on_chunk).await;
        // `on_chunk` (and with it, `chunk_tx`) was dropped when `run`
        // resolved; wait for the relay to drain so every chunk frame is on
        // the wire before the terminating response below.
        let _ = relay_task.await;

        match outcome {
            Ok(outcome) => {
                self.timestamps.lock().await.push(Instant::now());
                let message = HostToDelegate::InferenceResponse {
                    request_id: request.request_id.clone(),
                    success: true,
                    content: Some(outcome.content),
                    error: None,
                };
                if let Ok(payload) = serde_json::to_value(&message) {
                    let _ = channel.send(payload).await;
                }
            }
            Err(error) => {
                self.respond_error(user_id, delegate_id, &request, &error.to_string()).await;
            }
        }
    }

    async fn respond_error(
        &self,
        user_id: &str,
        delegate_id: &str,
        request: &InferenceRequestPayload,
        error: &str,
    ) {
        let Some(channel) = self.delegates.channel_for(user_id, delegate_id).await else {
            return;
        };
        let message = HostToDelegate::InferenceResponse {
            request_id: request.request_id.clone(),
            success: false,
            content: None,
            error: Some(error.to_string()),
        };
        if let Ok(payload) = serde_json::to_value(&message) {
            let _ = channel.send(payload).await;
        }
    }
}
