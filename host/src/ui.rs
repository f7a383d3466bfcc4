//! UI broadcast fabric: a minimal in-process fan-out of host-originated
//! events to every browser tab currently watching a given user's rooms.
//! `mcpl-core` only depends on the [`RoomBroadcaster`] trait; this module is
//! the one concrete implementation `mcpl-host` ships with.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use futures::SinkExt;
use futures::StreamExt;
use mcpl_core::RoomBroadcaster;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Fans broadcast payloads out to every UI WebSocket currently subscribed to
/// the owning user's room. Conversations are not distinguished here; the UI
/// filters by `conversationId` in the payload itself, the same shape every
/// broadcast already carries.
#[derive(Default, Clone)]
pub struct UiRoomBroadcaster {
    rooms: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>,
}

impl UiRoomBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn subscribe(&self, user_id: String) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms.lock().await.entry(user_id).or_default().push(tx);
        rx
    }

    async fn prune_closed(&self, user_id: &str) {
        let mut rooms = self.rooms.lock().await;
        if let Some(senders) = rooms.get_mut(user_id) {
            senders.retain(|tx| !tx.is_closed());
        }
    }
}

impl RoomBroadcaster for UiRoomBroadcaster {
    fn broadcast<'a>(&'a self, user_id: &'a str, payload: Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let rooms = self.rooms.lock().await;
            let Some(senders) = rooms.get(user_id) else { return };
            for sender in senders {
                let _ = sender.send(payload.clone());
            }
        })
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, Path(user_id): Path<String>, State(broadcaster): State<Arc<UiRoomBroadcaster>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, broadcaster))
}

async fn handle_socket(socket: WebSocket, user_id: String, broadcaster: Arc<UiRoomBroadcaster>) {
    let mut rx = broadcaster.subscribe(user_id.clone()).await;
    let (mut sink, mut stream) = socket.split();

    let forward = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // The UI connection is receive-only; any inbound traffic (pings aside)
    // just keeps the socket drained until the client disconnects.
    while let Some(message) = stream.next().await {
        if message.is_err() {
            break;
        }
    }

    forward.abort();
    broadcaster.prune_closed(&user_id).await;
}
