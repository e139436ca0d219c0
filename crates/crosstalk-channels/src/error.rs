use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel '{channel}' is not registered")]
    NotRegistered { channel: String },

    #[error("Delivery failed on '{channel}': {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Media rejected: {0}")]
    MediaRejected(String),

    #[error("Adapter error ({channel}): {reason}")]
    Adapter { channel: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ChannelError>;
