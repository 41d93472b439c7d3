//! Transfer engine: download codes, range coverage and the `Transfer`
//! abstraction that turns a byte source into a resumable HTTP download.
//!
//! A [`Transfer`] is registered with a relay under a [`ShortCode`]. Each
//! downloader request is handed to
//! [`handle_download_request`](Transfer::handle_download_request) along
//! with a [`ResponseWriter`]; the transfer writes headers via
//! [`prepare_response`] and streams the body, recording what was sent in
//! its [`RangeCoverage`] and reporting lifecycle changes on its
//! [`EventBus`].

pub mod adaptive;
pub mod code;
pub mod coverage;
pub mod events;
pub mod local;
pub mod pin;
pub mod range;
pub mod response;
pub mod source;

use std::future::Future;
use std::pin::Pin;

pub use adaptive::AdaptivePolicy;
pub use code::{InvalidCode, ShortCode};
pub use coverage::RangeCoverage;
pub use events::{EventBus, ProgressThrottle, TransferEvent};
pub use local::LocalTransfer;
pub use pin::HostPin;
pub use range::{RangePlan, content_disposition, prepare_response};
pub use response::{
    ClientDisconnected, DownloadRequest, HttpContext, PendingResponse, ResponseHead,
    ResponseWriter,
};
pub use source::Source;

/// A boxed future returned by [`Transfer`] methods.
pub type TransferFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Descriptive metadata served with a download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferMeta {
    /// Served as an attachment name; `None` means inline.
    pub filename: Option<String>,
    pub mimetype: Option<String>,
}

impl TransferMeta {
    pub fn new(filename: Option<String>, mimetype: Option<String>) -> Self {
        Self {
            filename: filename.filter(|f| !f.is_empty()),
            mimetype: mimetype.filter(|m| !m.is_empty()),
        }
    }
}

/// One logical, cancelable, observable download.
pub trait Transfer: Send + Sync + 'static {
    /// Serves one downloader request.
    ///
    /// The response headers are committed no later than when `ctx` is
    /// dropped.
    fn handle_download_request(&self, ctx: HttpContext) -> TransferFuture<'_>;

    /// Stops the transfer and emits [`TransferEvent::Cancel`].
    fn cancel(&self);

    fn events(&self) -> &EventBus;

    fn host_pin(&self) -> &HostPin;

    fn meta(&self) -> &TransferMeta;

    /// Total size in bytes, when known.
    fn size(&self) -> Option<u64>;
}

/// Errors reading from a byte source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source ended at {position} of {len} bytes")]
    Truncated { position: u64, len: u64 },
}
