//! HTTP relay for WebRelay transfers.
//!
//! [`RelayRouter`] owns the code registry and the listener. Downloaders
//! hit `GET /<code>` and are handed to the matching transfer; uploaders
//! that cannot accept inbound connections open a WebSocket at the same
//! listener and are served through a [`BridgedUpload`].

mod bridge;
mod config;
mod fallback;
mod prefix;
mod registry;
mod router;
mod throttle;

pub use bridge::{BridgedUpload, FrameStream, read_handshake};
pub use config::{RouterConfig, ThrottleConfig};
pub use prefix::ListenPrefix;
pub use registry::Registry;
pub use router::{BridgeRegistration, ListenOutcome, RelayRouter};
pub use throttle::HostThrottle;

use std::net::IpAddr;

/// Errors produced by the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("cannot listen on {prefix}: {source}{}", bind_hint(.source))]
    Bind {
        prefix: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("invalid listen prefix {0:?}")]
    InvalidPrefix(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("upload handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Protocol(#[from] webrelay_protocol::ProtocolError),
}

fn bind_hint(err: &std::io::Error) -> &'static str {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => {
            " (binding this port needs elevated privileges; try a port above 1024)"
        }
        std::io::ErrorKind::AddrInUse => {
            " (another process is listening; pick another port or tunnel through it)"
        }
        _ => "",
    }
}

/// Reason a request was dropped without a response.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("host {0} is throttled")]
    Throttled(IpAddr),
}
