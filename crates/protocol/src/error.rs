/// Errors produced while parsing tunnel frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown instruction: {0:?}")]
    UnknownInstruction(String),

    #[error("invalid range instruction: {0:?}")]
    InvalidRange(String),

    #[error("invalid code reply: {0:?}")]
    InvalidCodeReply(String),

    #[error("handshake error: {0}")]
    Handshake(String),
}
