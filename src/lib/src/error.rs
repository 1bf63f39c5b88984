/// The lockbox builder error type.
#[derive(Debug, thiserror::Error)]
pub enum LockboxError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Invalid data: {0}")]
    Data(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Time error: {0}")]
    Time(String),
}
