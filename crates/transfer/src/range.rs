//! Response headers shared by every transfer, and `Range` handling.

use http::StatusCode;
use http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use webrelay_protocol::CHUNK_SIZE;

use crate::TransferMeta;
use crate::response::{DownloadRequest, ResponseWriter};

/// What a transfer should send after the headers are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePlan {
    /// Serve `count` bytes starting at `offset`.
    ///
    /// For unknown sizes `count` is only the read quantum; the body runs
    /// until the source ends.
    Serve { offset: u64, count: u64 },
    /// A 416 was prepared; send nothing.
    Unsatisfiable,
}

/// A parsed `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// `bytes=<start>-` or `bytes=<start>-<end>` (end inclusive).
    From { start: u64, end: Option<u64> },
    /// `bytes=-<len>`: the last `len` bytes.
    Suffix(u64),
}

fn parse_range(value: &str) -> Option<ByteRange> {
    let set = value.trim().strip_prefix("bytes=")?.trim();
    // Multi-range requests are served whole.
    if set.contains(',') {
        return None;
    }
    let (start, end) = set.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    if start.is_empty() {
        return end.parse().ok().map(ByteRange::Suffix);
    }
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        let end: u64 = end.parse().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some(ByteRange::From { start, end })
}

/// Resolves a range against a known size; `None` when unsatisfiable.
fn resolve(range: ByteRange, size: u64) -> Option<(u64, u64)> {
    match range {
        ByteRange::From { start, end } => {
            let end = end.unwrap_or(size.checked_sub(1)?);
            if start >= size || end >= size {
                return None;
            }
            Some((start, end - start + 1))
        }
        ByteRange::Suffix(0) => None,
        ByteRange::Suffix(len) => {
            if size == 0 {
                return None;
            }
            let len = len.min(size);
            Some((size - len, len))
        }
    }
}

/// Builds a `Content-Disposition` value.
///
/// No filename means `inline`. Names outside ASCII get an RFC 5987
/// `filename*` alongside a sanitized fallback.
pub fn content_disposition(filename: Option<&str>) -> String {
    let Some(name) = filename.filter(|n| !n.is_empty()) else {
        return "inline".to_string();
    };
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    if name.is_ascii() && !name.contains(['"', '\\']) {
        format!("attachment; filename=\"{name}\"")
    } else {
        let encoded = utf8_percent_encode(name, NON_ALPHANUMERIC);
        format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
    }
}

/// Writes the common headers and decides which bytes to send.
pub fn prepare_response(
    request: &DownloadRequest,
    response: &mut ResponseWriter,
    meta: &TransferMeta,
    size: Option<u64>,
) -> RangePlan {
    if let Some(mime) = meta.mimetype.as_deref().filter(|m| !m.is_empty()) {
        response.set_header(CONTENT_TYPE, mime);
    }
    response.set_header(
        CONTENT_DISPOSITION,
        content_disposition(meta.filename.as_deref()),
    );
    response.set_header(ACCEPT_RANGES, if size.is_some() { "bytes" } else { "none" });

    let Some(size) = size else {
        return RangePlan::Serve {
            offset: 0,
            count: CHUNK_SIZE as u64,
        };
    };

    let Some(range) = request.header(RANGE).and_then(parse_range) else {
        response.set_header(CONTENT_LENGTH, size.to_string());
        return RangePlan::Serve {
            offset: 0,
            count: size,
        };
    };

    match resolve(range, size) {
        Some((offset, count)) => {
            response.set_status(StatusCode::PARTIAL_CONTENT);
            response.set_header(
                CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, offset + count - 1, size),
            );
            response.set_header(CONTENT_LENGTH, count.to_string());
            RangePlan::Serve { offset, count }
        }
        None => {
            tracing::debug!(?range, size, "unsatisfiable range");
            response.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
            response.set_header(CONTENT_RANGE, format!("bytes */{size}"));
            response.set_header(CONTENT_LENGTH, "0");
            RangePlan::Unsatisfiable
        }
    }
}
