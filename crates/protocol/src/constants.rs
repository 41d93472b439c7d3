//! Protocol constants shared by both ends of the tunnel.

use std::time::Duration;

/// Size of a single data chunk, and the read quantum for streams of
/// unknown length.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound for the connect + handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest WebSocket message either side accepts.
///
/// Chunks never exceed [`CHUNK_SIZE`]; the headroom covers handshake
/// frames carrying long file names.
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Prefix of the relay's handshake reply.
pub const CODE_PREFIX: &str = "code=";

/// Prefix of a range instruction.
pub const RANGE_PREFIX: &str = "range:";

/// Instruction telling the uploader the download finished.
pub const COMPLETED: &str = "completed";

/// Instruction telling the uploader the downloader dropped mid-transfer.
pub const DISCONNECTED: &str = "disconnected";
