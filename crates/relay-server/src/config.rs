//! Router configuration.

use std::time::Duration;

use webrelay_protocol::HANDSHAKE_TIMEOUT;
use webrelay_transfer::AdaptivePolicy;

/// Bad-request throttling for abusive hosts.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Requests from a host are dropped once it exceeds this count...
    pub max_bad_requests: u32,
    /// ...with each bad request less than this apart.
    pub window: Duration,
    /// The whole table is cleared on this interval.
    pub clear_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_bad_requests: 10,
            window: Duration::from_secs(10),
            clear_interval: Duration::from_secs(60),
        }
    }
}

/// Relay router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Serve the landing page and `robots.txt` for unknown paths.
    pub enable_builtin_webclient: bool,
    /// Accept WebSocket upload tunnels.
    pub accept_socket_connections: bool,
    /// Reject downloads of a transfer from any host but the first.
    pub pin_downloader_host: bool,
    /// Bound for receiving the upload handshake and sending the code.
    pub handshake_timeout: Duration,
    pub throttle: ThrottleConfig,
    /// Adaptive-stream policy handed to bridged uploads.
    pub adaptive: AdaptivePolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_builtin_webclient: true,
            accept_socket_connections: true,
            pin_downloader_host: false,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            throttle: ThrottleConfig::default(),
            adaptive: AdaptivePolicy::default(),
        }
    }
}

impl RouterConfig {
    /// Settings for a process hosting its own file: no landing page, but
    /// other local uploaders may still tunnel through it.
    pub fn host() -> Self {
        Self {
            enable_builtin_webclient: false,
            ..Self::default()
        }
    }
}
