use std::time::Duration;

use thiserror::Error;

/// Transport failures. These stay inside the client; producers never see them.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}
