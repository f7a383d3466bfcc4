//! Trait seam to the delegate process's own connection to the host. This
//! crate normalizes and signature-checks an inbound HTTP webhook into a
//! `mcpl/push_event` payload; actually framing it onto a Reliable Channel
//! and a live WebSocket is the delegate process's job, not this crate's —
//! matching §1's "HTTP/WebSocket transport" being an external collaborator.
//!
//! A real delegate implements this trait over its own channel. The
//! standalone `mcpl-webhook` binary wires a logging stand-in so the binary
//! runs on its own for smoke-testing endpoint configuration.

use std::future::Future;
use std::pin::Pin;

use mcpl_types::DelegateToHost;

use crate::error::Result;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Accepts one normalized `DelegateToHost::PushEvent` for delivery to the
/// host. Implementations decide how (and whether) to frame and send it;
/// an `Err` here becomes a `503` response to the webhook caller.
pub trait PushEventSink: Send + Sync {
    fn push<'a>(&'a self, event: DelegateToHost) -> BoxFuture<'a, Result<()>>;
}

/// Logs every push event instead of sending it anywhere. Used by the
/// standalone binary, and by tests that only exercise signature
/// verification and normalization.
pub struct LoggingSink;

impl PushEventSink for LoggingSink {
    fn push<'a>(&'a self, event: DelegateToHost) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let DelegateToHost::PushEvent { id, source, conversation_id, event_type, .. } = &event {
                tracing::info!(id, source, conversation_id, event_type, "push event normalized (no channel wired, logging only)");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::expect_used)]

    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    /// Records every event handed to it for assertions.
    #[derive(Default, Clone)]
    pub struct RecordingSink {
        pub events: Arc<Mutex<Vec<DelegateToHost>>>,
    }

    impl PushEventSink for RecordingSink {
        fn push<'a>(&'a self, event: DelegateToHost) -> BoxFuture<'a, Result<()>> {
            let events = self.events.clone();
            Box::pin(async move {
                events.lock().expect("sink mutex poisoned").push(event);
                Ok(())
            })
        }
    }

    /// Always rejects, to exercise the `503` path.
    pub struct FailingSink;

    impl PushEventSink for FailingSink {
        fn push<'a>(&'a self, _event: DelegateToHost) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { Err(crate::error::WebhookError::SinkUnavailable("no host connection".to_string())) })
        }
    }
}
