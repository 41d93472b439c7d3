//! Byte sources a transfer can serve from.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Readers that can also seek.
pub trait SeekableReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableReader for T {}

/// The bytes behind a transfer.
pub enum Source {
    /// Random access with a known length (files, in-memory buffers).
    Seekable {
        reader: Box<dyn SeekableReader>,
        len: u64,
        position: u64,
    },
    /// Forward-only with unknown length (pipes, stdin).
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        position: u64,
    },
}

impl Source {
    /// Wraps a seekable reader of `len` bytes positioned at 0.
    pub fn seekable(reader: impl SeekableReader + 'static, len: u64) -> Self {
        Self::Seekable {
            reader: Box::new(reader),
            len,
            position: 0,
        }
    }

    /// Wraps a forward-only reader.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Stream {
            reader: Box::new(reader),
            position: 0,
        }
    }

    /// Opens a file as a seekable source.
    pub async fn file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self::seekable(file, len))
    }

    /// Standard input as a stream source.
    pub fn stdin() -> Self {
        Self::stream(tokio::io::stdin())
    }

    /// Total length, if known.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Seekable { len, .. } => Some(*len),
            Self::Stream { .. } => None,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::Seekable { .. })
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        match self {
            Self::Seekable { position, .. } | Self::Stream { position, .. } => *position,
        }
    }

    /// Reads into `buf` starting at `offset`.
    ///
    /// Seekable sources seek when `offset` differs from the current
    /// position; streams ignore `offset` and read whatever comes next.
    /// Returns 0 at end of input.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Seekable {
                reader, position, ..
            } => {
                if *position != offset {
                    reader.seek(SeekFrom::Start(offset)).await?;
                    *position = offset;
                }
                let n = reader.read(buf).await?;
                *position += n as u64;
                Ok(n)
            }
            Self::Stream { reader, position } => {
                let n = reader.read(buf).await?;
                *position += n as u64;
                Ok(n)
            }
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seekable { len, position, .. } => f
                .debug_struct("Seekable")
                .field("len", len)
                .field("position", position)
                .finish(),
            Self::Stream { position, .. } => {
                f.debug_struct("Stream").field("position", position).finish()
            }
        }
    }
}
