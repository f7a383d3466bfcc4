//! The Reliable Channel: in-order, at-least-once delivery of MCPL payloads
//! over a transport that only promises "delivers objects" (a WebSocket, a
//! pair of pipes, stdio).
//!
//! A channel does not own a transport; it is handed an outbound sink
//! (`mpsc::UnboundedSender<Value>`) to write frames to, and its caller feeds
//! inbound transport messages into [`ReliableChannel::handle_incoming`]. This
//! keeps the channel transport-agnostic so the same implementation backs a
//! WebSocket-based host and an in-memory pair used in tests.

mod error;
mod state;

use std::sync::Arc;
use std::time::Duration;

use mcpl_types::ReliableFrame;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

pub use error::ChannelError;
pub use state::ChannelSnapshot;
use state::ChannelState;

/// Backpressure ceiling: once `outSeq - lastAckedSeq` reaches this, `send`
/// refuses further payloads and the caller is expected to close the
/// connection.
pub const MAX_UNACKED: u64 = 64;

/// How long a bare ack waits before firing, so it can coalesce with an
/// imminent outbound send.
const BARE_ACK_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct ReliableChannel {
    state: Arc<Mutex<ChannelState>>,
    outbound: mpsc::UnboundedSender<Value>,
}

impl ReliableChannel {
    pub fn new(outbound: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState::default())),
            outbound,
        }
    }

    /// Frames `payload`, buffers it for resend, and writes it to the
    /// transport. Returns [`ChannelError::Backpressure`] without sending (and
    /// without buffering) once the peer has fallen `MAX_UNACKED` frames
    /// behind; the caller should close the connection in that case.
    pub async fn send(&self, payload: Value) -> Result<(), ChannelError> {
        let frame = {
            let mut s = self.state.lock().await;
            if s.is_backpressured(MAX_UNACKED) {
                return Err(ChannelError::Backpressure {
                    unacked: s.out_seq.saturating_sub(s.last_acked_seq),
                });
            }
            s.out_seq += 1;
            let seq = s.out_seq;
            let ack = s.in_seq;
            s.outbound_buffer.insert(seq, payload.clone());
            // This frame piggybacks the current ack, so any bare-ack timer
            // already in flight is now redundant.
            s.ack_generation += 1;
            ReliableFrame {
                seq,
                ack,
                payload: Some(payload),
            }
        };
        self.emit(&frame)
    }

    /// Feeds one transport message into the channel. Returns, in send
    /// order, every MCPL payload now ready for the consumer: zero for a
    /// bare ack, a duplicate, or an out-of-order frame parked for later;
    /// possibly more than one when a parked frame's predecessor just
    /// arrived. Non-frame values (no numeric `seq`) pass through unchanged
    /// as legacy messages.
    pub async fn handle_incoming(&self, value: Value) -> Vec<Value> {
        if value.get("seq").and_then(Value::as_u64).is_none() {
            return vec![value];
        }

        let frame: ReliableFrame = match serde_json::from_value(value) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed reliable frame");
                return Vec::new();
            }
        };

        let delivered = {
            let mut s = self.state.lock().await;
            s.advance_ack(frame.ack);

            if frame.is_bare_ack() {
                Vec::new()
            } else if frame.seq <= s.in_seq {
                tracing::debug!(seq = frame.seq, in_seq = s.in_seq, "dropping duplicate frame");
                Vec::new()
            } else if frame.seq > s.in_seq + 1 {
                if let Some(payload) = frame.payload {
                    s.pending.insert(frame.seq, payload);
                }
                Vec::new()
            } else {
                let mut delivered = Vec::new();
                s.in_seq = frame.seq;
                if let Some(payload) = frame.payload {
                    delivered.push(payload);
                }
                while let Some(payload) = s.pending.remove(&(s.in_seq + 1)) {
                    s.in_seq += 1;
                    delivered.push(payload);
                }
                delivered
            }
        };

        if !delivered.is_empty() {
            self.schedule_bare_ack().await;
        }
        delivered
    }

    /// Returns a copy of the channel's bookkeeping for persistence across a
    /// reconnect.
    pub async fn get_state(&self) -> ChannelSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Restores bookkeeping saved by a prior physical connection. Must be
    /// called before [`Self::resend_buffered_after`].
    pub async fn restore_state(&self, snapshot: ChannelSnapshot) {
        self.state.lock().await.restore(snapshot);
    }

    /// Re-sends every buffered frame with `seq > peer_last_received_seq`, in
    /// seq order. The caller's inbound message handler must already be
    /// attached before calling this, or replies to the resent frames will be
    /// dropped. Aborts on the first transport error; the peer is expected to
    /// ask again.
    pub async fn resend_buffered_after(
        &self,
        peer_last_received_seq: u64,
    ) -> Result<(), ChannelError> {
        let to_resend: Vec<(u64, Value)> = {
            let s = self.state.lock().await;
            s.outbound_buffer
                .range((peer_last_received_seq + 1)..)
                .map(|(seq, payload)| (*seq, payload.clone()))
                .collect()
        };
        for (seq, payload) in to_resend {
            let ack = self.state.lock().await.in_seq;
            let frame = ReliableFrame {
                seq,
                ack,
                payload: Some(payload),
            };
            self.emit(&frame)?;
        }
        Ok(())
    }

    fn emit(&self, frame: &ReliableFrame) -> Result<(), ChannelError> {
        let value = serde_json::to_value(frame)?;
        self.outbound
            .send(value)
            .map_err(|_| ChannelError::TransportClosed)
    }

    /// Schedules a bare ack `BARE_ACK_DELAY` out. If a send piggybacks the
    /// ack (or a later delivery schedules a fresher one) before the timer
    /// fires, this one no-ops.
    async fn schedule_bare_ack(&self) {
        let generation = {
            let mut s = self.state.lock().await;
            s.ack_generation += 1;
            s.ack_generation
        };
        let state = self.state.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BARE_ACK_DELAY).await;
            let ack = {
                let s = state.lock().await;
                if s.ack_generation != generation {
                    return;
                }
                s.in_seq
            };
            let frame = ReliableFrame::bare_ack(ack);
            if let Ok(value) = serde_json::to_value(&frame) {
                let _ = outbound.send(value);
            }
        });
    }
}

#[cfg(test)]
mod tests;
