//! Error types for the simulator and collector.

use thiserror::Error;

/// Top-level error kinds. Configuration and bind problems are fatal at
/// startup; everything else is logged with context and survived at
/// runtime.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("storage queue full, dropped value for {0}")]
    StorageBackpressure(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("shutdown requested")]
    Cancelled,
}

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }
}
