//! The HTTP side of §6's webhook front-end: one `POST` route per configured
//! endpoint, each closed over its own signature scheme and conversation
//! target.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Json;
use axum::response::Response;
use axum::routing::post;
use serde_json::json;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::config::WebhookEndpointConfig;
use crate::error::WebhookError;
use crate::normalize;
use crate::sink::PushEventSink;

/// Bodies larger than this are rejected with `413` before the handler runs.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Builds one route per `config.endpoints` entry, each POSTing to
/// `endpoint.path` and delivering accepted events to `sink`.
pub fn build_router(config: WebhookConfig, sink: Arc<dyn PushEventSink>) -> Router {
    let mut router = Router::new();
    for endpoint in config.endpoints {
        let endpoint = Arc::new(endpoint);
        let sink = sink.clone();
        router = router.route(
            &endpoint.path.clone(),
            post(move |headers: HeaderMap, body: Bytes| {
                let endpoint = endpoint.clone();
                let sink = sink.clone();
                async move { handle_delivery(endpoint, sink, headers, body).await }
            }),
        );
    }
    router.layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

fn error_response(status: StatusCode, error: &WebhookError) -> Response {
    (status, Json(json!({"accepted": false, "error": error.to_string()}))).into_response()
}

async fn handle_delivery(endpoint: Arc<WebhookEndpointConfig>, sink: Arc<dyn PushEventSink>, headers: HeaderMap, body: Bytes) -> Response {
    let received_at = chrono::Utc::now();
    if let Err(error) = crate::signature::verify(&endpoint.source, endpoint.secret.as_deref(), &headers, &body) {
        tracing::warn!(source = %endpoint.source, path = %endpoint.path, %error, "rejecting webhook delivery");
        return error_response(StatusCode::UNAUTHORIZED, &error);
    }

    let raw = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    let normalized = normalize::normalize(&endpoint.source, endpoint.participant_id.as_deref(), &headers, raw);

    let trigger_id = Uuid::new_v4().to_string();
    let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let event = mcpl_types::DelegateToHost::PushEvent {
        id: trigger_id.clone(),
        source: endpoint.source.clone(),
        conversation_id: endpoint.conversation_id.clone().unwrap_or_default(),
        event_type: normalized.event_type,
        payload: normalized.context,
        system_message: normalized.system_message,
        idempotency_key: normalized.idempotency_key,
        timestamp,
    };

    let result = match sink.push(event).await {
        Ok(()) => (StatusCode::OK, Json(json!({"accepted": true, "triggerId": trigger_id}))).into_response(),
        Err(error) => {
            tracing::warn!(source = %endpoint.source, %error, "push-event sink rejected delivery");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &error)
        }
    };
    tracing::debug!(
        source = %endpoint.source,
        trigger_id,
        elapsed = %mcpl_common::elapsed::format_elapsed(received_at),
        "webhook delivery handled"
    );
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use axum::http::Request;
    use axum::http::header::CONTENT_TYPE;
    use tower::ServiceExt;

    use super::*;
    use crate::sink::test_support::FailingSink;
    use crate::sink::test_support::RecordingSink;

    fn config_with(endpoint: WebhookEndpointConfig) -> WebhookConfig {
        WebhookConfig { endpoints: vec![endpoint] }
    }

    #[tokio::test]
    async fn accepted_delivery_reaches_the_sink_and_returns_200() {
        let sink = Arc::new(RecordingSink::default());
        let router = build_router(
            config_with(WebhookEndpointConfig {
                source: "github".to_string(),
                path: "/hooks/github".to_string(),
                secret: None,
                conversation_id: Some("conv-1".to_string()),
                participant_id: None,
            }),
            sink.clone(),
        );

        let body = serde_json::json!({"repository": {"full_name": "acme/widgets"}, "sender": {"login": "octocat"}}).to_string();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/github")
                    .header(CONTENT_TYPE, "application/json")
                    .header("x-github-event", "push")
                    .body(axum::body::Body::from(body))
                    .expect("request builds"),
            )
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::OK);
        let events = sink.events.lock().expect("sink mutex poisoned");
        assert_eq!(events.len(), 1);
        if let mcpl_types::DelegateToHost::PushEvent { conversation_id, event_type, .. } = &events[0] {
            assert_eq!(conversation_id, "conv-1");
            assert_eq!(event_type, "push");
        } else {
            panic!("expected a PushEvent");
        }
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_with_401_and_never_reaches_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let router = build_router(
            config_with(WebhookEndpointConfig {
                source: "github".to_string(),
                path: "/hooks/github".to_string(),
                secret: Some("s3cr3t".to_string()),
                conversation_id: None,
                participant_id: None,
            }),
            sink.clone(),
        );

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/github")
                    .header("x-hub-signature-256", "sha256=deadbeef")
                    .body(axum::body::Body::from("{}"))
                    .expect("request builds"),
            )
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let events = sink.events.lock().expect("sink mutex poisoned");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn sink_rejection_surfaces_as_503() {
        let router = build_router(
            config_with(WebhookEndpointConfig {
                source: "unknown".to_string(),
                path: "/hooks/unknown".to_string(),
                secret: None,
                conversation_id: None,
                participant_id: None,
            }),
            Arc::new(FailingSink),
        );

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/unknown")
                    .body(axum::body::Body::from("{}"))
                    .expect("request builds"),
            )
            .await
            .expect("router responds");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
