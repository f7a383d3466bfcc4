use thiserror::Error;

pub type Result<T> = std::result::Result<T, WebhookError>;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("required signature header is missing")]
    MissingSignature,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("push-event sink rejected the event: {0}")]
    SinkUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
