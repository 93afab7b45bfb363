use thiserror::Error;

#[derive(Debug, Error)]
pub enum HolodexError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("JSON deserialization failed: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid client configuration: {0}")]
    Config(String),
    #[error("WebSocket transport error: {0}")]
    Socket(String),
    #[error("Realtime protocol error: {0}")]
    Protocol(String),
    #[error("Realtime handshake failed: {0}")]
    Handshake(String),
    #[error("Engine task communication error: {0}")]
    TaskComm(String),
}

pub type Result<T, E = HolodexError> = std::result::Result<T, E>;
