//! Delegate-facing WebSocket endpoint: translates axum's `WebSocket` into
//! the raw JSON `Value` stream [`mcpl_core::DelegateHandler`] expects, and
//! back. All MCPL semantics live in `mcpl-core`; this module only speaks
//! the transport.

use std::sync::Arc;

use axum::extract::Query;
use axum::extract::State;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use futures::stream::SplitSink;
use mcpl_core::DelegateHandler;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Query parameters on the delegate connection URL (§6): `ws(s)://…?token=JWT&delegateId=X`
/// or `…?apiKey=K&delegateId=X`. A connection with neither `token` nor
/// `apiKey` falls back to the legacy `delegate_auth` message instead.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
    #[serde(rename = "delegateId")]
    delegate_id: Option<String>,
}

pub async fn ws_handler(
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
    State(handler): State<Arc<DelegateHandler>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, handler, params))
}

async fn handle_socket(socket: WebSocket, handler: Arc<DelegateHandler>, params: ConnectParams) {
    let connected_at = chrono::Utc::now();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
    let conn = handler.begin_connection(outbound_tx);
    let (mut sink, mut stream) = socket.split();

    if params.token.is_some() || params.api_key.is_some() {
        let delegate_id = params.delegate_id.unwrap_or_default();
        if let Some(close) = conn.authenticate_from_query(params.token, params.api_key, delegate_id).await {
            tracing::info!(code = close.code, reason = %close.reason, "closing delegate connection");
            flush_outbound(&mut sink, &mut outbound_rx).await;
            let _ = sink.send(Message::Close(Some(CloseFrame { code: close.code, reason: close.reason.into() }))).await;
            conn.on_close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(payload) = outbound else { break };
                let Ok(text) = serde_json::to_string(&payload) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                let Some(message) = inbound else { break };
                let message = match message {
                    Ok(message) => message,
                    Err(error) => {
                        tracing::warn!(%error, "delegate websocket read error");
                        break;
                    }
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                let raw: Value = match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(%error, "ignoring malformed delegate message");
                        continue;
                    }
                };
                if let Some(close) = conn.handle_message(raw).await {
                    tracing::info!(code = close.code, reason = %close.reason, "closing delegate connection");
                    flush_outbound(&mut sink, &mut outbound_rx).await;
                    let _ = sink.send(Message::Close(Some(CloseFrame { code: close.code, reason: close.reason.into() }))).await;
                    break;
                }
            }
        }
    }

    conn.on_close().await;
    tracing::info!(elapsed = %mcpl_common::elapsed::format_elapsed(connected_at), "delegate connection closed");
}

/// Drains any outbound message already queued (e.g. a `delegate_auth_result`
/// sent just before a close) so it reaches the wire ahead of the close
/// frame, instead of being silently dropped with the channel.
async fn flush_outbound(sink: &mut SplitSink<WebSocket, Message>, outbound_rx: &mut mpsc::UnboundedReceiver<Value>) {
    while let Ok(payload) = outbound_rx.try_recv() {
        let Ok(text) = serde_json::to_string(&payload) else { continue };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}
