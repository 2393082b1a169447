//! Error types for handoff.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error on {channel}: {message}")]
    Transport { channel: String, message: String },

    #[error("send to {channel} timed out after {timeout:?}")]
    SendTimeout { channel: String, timeout: Duration },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn transport(channel: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            channel: channel.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
