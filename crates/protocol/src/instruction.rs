use std::fmt;

use crate::ProtocolError;
use crate::constants::{COMPLETED, DISCONNECTED, RANGE_PREFIX};

/// A text frame sent by the relay to the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// Seek to `offset` and stream up to `count` bytes.
    Range { offset: u64, count: u64 },
    /// Blank frame: send the next chunk of the current window.
    Continue,
    /// The download is complete; close the tunnel.
    Completed,
    /// The downloader dropped; wait for a new `Range`.
    Disconnected,
}

impl Instruction {
    /// Parses a text frame received from the relay.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::Continue);
        }
        if trimmed == COMPLETED {
            return Ok(Self::Completed);
        }
        if trimmed == DISCONNECTED {
            return Ok(Self::Disconnected);
        }
        if let Some(rest) = trimmed.strip_prefix(RANGE_PREFIX) {
            let (offset, count) = rest
                .trim()
                .split_once('-')
                .ok_or_else(|| ProtocolError::InvalidRange(text.to_string()))?;
            let offset = offset
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidRange(text.to_string()))?;
            let count = count
                .trim()
                .parse()
                .map_err(|_| ProtocolError::InvalidRange(text.to_string()))?;
            return Ok(Self::Range { offset, count });
        }
        Err(ProtocolError::UnknownInstruction(text.to_string()))
    }

    /// Returns the text frame for this instruction.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { offset, count } => write!(f, "{RANGE_PREFIX} {offset}-{count}"),
            Self::Continue => Ok(()),
            Self::Completed => f.write_str(COMPLETED),
            Self::Disconnected => f.write_str(DISCONNECTED),
        }
    }
}
