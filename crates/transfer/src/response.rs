//! Minimal HTTP request/response surface seen by transfers.
//!
//! The server owns the real connection. Transfers get a
//! [`DownloadRequest`] describing what was asked and a [`ResponseWriter`]
//! they fill in; the server receives the status line and headers through
//! [`PendingResponse::head`] and streams the body from
//! [`PendingResponse::body`].

use std::net::IpAddr;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use http::{Method, StatusCode};
use tokio::sync::{mpsc, oneshot};

/// Body chunks buffered between a transfer and the connection.
///
/// Kept small so a dropped downloader is noticed within a few chunks.
const BODY_BUFFER: usize = 2;

/// What the downloader asked for.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub remote: IpAddr,
}

impl DownloadRequest {
    pub fn new(method: Method, headers: HeaderMap, remote: IpAddr) -> Self {
        Self {
            method,
            headers,
            remote,
        }
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn user_agent(&self) -> &str {
        self.header(USER_AGENT).unwrap_or("")
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Returned when the downloader is no longer reading.
#[derive(Debug, thiserror::Error)]
#[error("downloader disconnected")]
pub struct ClientDisconnected;

/// Write side of a response.
///
/// Headers are committed by the first [`write`](Self::write), by
/// [`finish`](Self::finish), or when the writer is dropped.
#[derive(Debug)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
}

/// Read side of a response, held by the server.
#[derive(Debug)]
pub struct PendingResponse {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

impl ResponseWriter {
    /// Creates a connected writer/reader pair.
    pub fn channel() -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        let writer = Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_tx: Some(head_tx),
            body_tx: Some(body_tx),
        };
        (
            writer,
            PendingResponse {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Sets a header, ignoring values that are not valid header text.
    pub fn set_header(&mut self, name: HeaderName, value: impl AsRef<str>) {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(_) => tracing::warn!(header = %name, "dropping invalid header value"),
        }
    }

    /// Discards prepared headers and replies with a bare `status`.
    ///
    /// Has no effect once headers were committed.
    pub fn reject(&mut self, status: StatusCode) {
        if !self.is_committed() {
            self.status = status;
            self.headers.clear();
            self.finish();
        }
    }

    /// Returns `true` once headers were handed to the server.
    pub fn is_committed(&self) -> bool {
        self.head_tx.is_none()
    }

    fn commit(&mut self) {
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(ResponseHead {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
            });
        }
    }

    /// Writes a body chunk, committing headers first.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), ClientDisconnected> {
        self.commit();
        let tx = self.body_tx.as_ref().ok_or(ClientDisconnected)?;
        tx.send(chunk).await.map_err(|_| ClientDisconnected)
    }

    /// Commits headers and ends the body.
    pub fn finish(&mut self) {
        self.commit();
        self.body_tx = None;
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        self.commit();
    }
}

/// A request paired with the writer for its response.
#[derive(Debug)]
pub struct HttpContext {
    pub request: DownloadRequest,
    pub response: ResponseWriter,
}

impl HttpContext {
    pub fn new(request: DownloadRequest) -> (Self, PendingResponse) {
        let (response, pending) = ResponseWriter::channel();
        (Self { request, response }, pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    #[tokio::test]
    async fn head_is_committed_on_first_write() {
        let (mut writer, mut pending) = ResponseWriter::channel();
        writer.set_status(StatusCode::PARTIAL_CONTENT);
        writer.set_header(CONTENT_TYPE, "text/plain");
        assert!(pending.head.try_recv().is_err());

        let reader = tokio::spawn(async move {
            let head = (&mut pending.head).await.unwrap();
            let chunk = pending.body.recv().await.unwrap();
            (head, chunk)
        });
        writer.write(Bytes::from_static(b"abc")).await.unwrap();

        let (head, chunk) = reader.await.unwrap();
        assert_eq!(head.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(head.headers[CONTENT_TYPE], "text/plain");
        assert_eq!(&chunk[..], b"abc");
    }

    #[tokio::test]
    async fn drop_commits_head_and_ends_body() {
        let (mut writer, mut pending) = ResponseWriter::channel();
        writer.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
        drop(writer);

        let head = pending.head.await.unwrap();
        assert_eq!(head.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(pending.body.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_fails_after_reader_is_gone() {
        let (mut writer, pending) = ResponseWriter::channel();
        drop(pending);
        assert!(writer.write(Bytes::from_static(b"x")).await.is_err());
    }

    #[test]
    fn invalid_header_values_are_dropped() {
        let (mut writer, _pending) = ResponseWriter::channel();
        writer.set_header(CONTENT_TYPE, "bad\nvalue");
        assert!(writer.headers().get(CONTENT_TYPE).is_none());
    }
}
