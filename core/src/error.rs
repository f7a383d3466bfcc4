use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("reliable channel error: {0}")]
    Channel(#[from] mcpl_channel::ChannelError),

    #[error("no session found for id {0}")]
    SessionNotFound(String),

    #[error("session {session_id} belongs to a different user")]
    SessionOwnerMismatch { session_id: String },

    #[error("no delegate connected for id {0}")]
    DelegateNotConnected(String),

    #[error("tool call timed out after {0}ms")]
    ToolCallTimeout(u64),

    #[error("delegate disconnected before responding")]
    DelegateDisconnected,

    #[error("unknown tool {0}")]
    UnknownTool(String),

    #[error("tool {0} is not enabled by policy")]
    ToolNotAllowed(String),

    #[error("tool name {name} is ambiguous between {candidates:?}")]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    #[error("invalid json patch: {0}")]
    InvalidPatch(String),

    #[error("no checkpoints exist for this conversation")]
    NoCheckpoints,

    #[error("checkpoint {0} expired")]
    CheckpointExpired(String),

    #[error("checkpoint {0} is unknown")]
    CheckpointUnknown(String),

    #[error("rollback failed")]
    RollbackFailed,

    #[error("rollback denied for server-managed state")]
    RollbackDenied,

    #[error("inference quota exceeded")]
    InferenceQuotaExceeded,

    #[error("push event queue is full")]
    QueueFull,

    #[error("delegate id {0} is invalid")]
    InvalidDelegateId(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
