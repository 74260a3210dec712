use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiveStackError {
    #[error("Missing WebSocket URL")]
    MissingUrl,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Max reconnection attempts reached ({0})")]
    MaxReconnectAttempts(u32),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown view: {0}")]
    UnknownView(String),

    #[error("View {0} is not a {1} view")]
    ViewModeMismatch(String, &'static str),

    #[error("Channel error: {0}")]
    Channel(String),
}
