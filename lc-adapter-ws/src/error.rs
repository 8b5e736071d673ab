//! Transport errors

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),
}
