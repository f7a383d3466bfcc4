use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    /// `outSeq - lastAckedSeq` reached `MAX_UNACKED`; the caller must close
    /// the underlying connection rather than keep sending.
    #[error("reliable channel backpressure: {unacked} frames unacked")]
    Backpressure { unacked: u64 },

    /// The transport's outbound sink has been dropped.
    #[error("reliable channel transport closed")]
    TransportClosed,

    #[error("failed to serialize reliable frame: {0}")]
    Serialize(#[from] serde_json::Error),
}
