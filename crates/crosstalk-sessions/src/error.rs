use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session key: {0}")]
    InvalidKey(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
