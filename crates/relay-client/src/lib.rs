//! Uploader side of the WebRelay tunnel.
//!
//! A [`BridgedUploadClient`] connects to a relay over a WebSocket,
//! announces the file, receives its download code and then answers the
//! relay's range instructions with binary chunks read from a [`Source`].
//!
//! [`Source`]: webrelay_transfer::Source

mod client;
mod error;

pub use client::BridgedUploadClient;
pub use error::ClientError;
