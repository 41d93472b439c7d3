//! Wire vocabulary for the WebRelay upload tunnel.
//!
//! The tunnel is a plain WebSocket. After the upgrade the uploader sends
//! three text frames describing the file, the relay answers with the
//! assigned download code, and from then on the relay drives the
//! exchange with text instructions while the uploader answers with
//! binary chunks.
//!
//! ```text
//! uploader -> relay:  "<filename>"  "<filesize or empty>"  "<mimetype>"
//! relay -> uploader:  "code=<code>"
//! relay -> uploader:  "range: <offset>-<count>"   start a window
//! uploader -> relay:  [binary chunk]
//! relay -> uploader:  ""                          send the next chunk
//! relay -> uploader:  "disconnected"              downloader went away
//! relay -> uploader:  "completed"                 close the tunnel
//! ```

pub mod constants;
mod error;
mod handshake;
mod instruction;

pub use constants::{CHUNK_SIZE, HANDSHAKE_TIMEOUT, WS_MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use handshake::{Handshake, format_code_reply, parse_code_reply};
pub use instruction::Instruction;
