use std::collections::BTreeMap;

use serde_json::Value;

/// Snapshot of a [`crate::ReliableChannel`]'s bookkeeping, saved on one
/// physical connection and restored on the next so a session can resume.
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub out_seq: u64,
    pub in_seq: u64,
    pub last_acked_seq: u64,
    /// Unacked frames, in the order they were sent.
    pub outbound_buffer: Vec<(u64, Value)>,
}

#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) out_seq: u64,
    pub(crate) in_seq: u64,
    pub(crate) last_acked_seq: u64,
    /// seq -> payload, retained until acked, so it can be replayed on resume.
    pub(crate) outbound_buffer: BTreeMap<u64, Value>,
    /// seq -> payload, for inbound frames that arrived ahead of their
    /// predecessor.
    pub(crate) pending: BTreeMap<u64, Value>,
    /// Bumped every time a frame (carrying a fresh ack) is sent, so a
    /// queued bare-ack timer can detect it was piggybacked and no-op.
    pub(crate) ack_generation: u64,
}

impl ChannelState {
    pub(crate) fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            out_seq: self.out_seq,
            in_seq: self.in_seq,
            last_acked_seq: self.last_acked_seq,
            outbound_buffer: self
                .outbound_buffer
                .iter()
                .map(|(seq, payload)| (*seq, payload.clone()))
                .collect(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: ChannelSnapshot) {
        self.out_seq = snapshot.out_seq;
        self.in_seq = snapshot.in_seq;
        self.last_acked_seq = snapshot.last_acked_seq;
        self.outbound_buffer = snapshot.outbound_buffer.into_iter().collect();
    }

    /// Drops buffered frames the peer has now acked.
    pub(crate) fn advance_ack(&mut self, ack: u64) {
        if ack > self.last_acked_seq {
            self.last_acked_seq = ack;
        }
        self.outbound_buffer.retain(|seq, _| *seq > self.last_acked_seq);
    }

    /// `true` once `outSeq - lastAckedSeq` reaches the backpressure limit.
    pub(crate) fn is_backpressured(&self, max_unacked: u64) -> bool {
        self.out_seq.saturating_sub(self.last_acked_seq) >= max_unacked
    }
}
