use webrelay_protocol::ProtocolError;

/// Errors from connecting an upload tunnel.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay did not answer the handshake in time")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client is already connected")]
    AlreadyConnected,
}
