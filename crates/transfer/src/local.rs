//! Transfers served straight from a byte source in this process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use webrelay_protocol::CHUNK_SIZE;

use crate::adaptive::AdaptivePolicy;
use crate::coverage::RangeCoverage;
use crate::events::{EventBus, ProgressThrottle, TransferEvent};
use crate::pin::HostPin;
use crate::range::{RangePlan, prepare_response};
use crate::response::{HttpContext, ResponseWriter};
use crate::source::Source;
use crate::{SourceError, Transfer, TransferFuture, TransferMeta};

/// Delay before deciding the outcome once the last request finished.
const SETTLE_DELAY: Duration = Duration::from_millis(10);

/// A transfer reading from a local [`Source`].
///
/// Concurrent requests share the source; each chunk is read under a lock
/// so seeks from one request never corrupt another's read.
pub struct LocalTransfer {
    source: Mutex<Source>,
    size: Option<u64>,
    seekable: bool,
    meta: TransferMeta,
    coverage: RangeCoverage,
    events: EventBus,
    progress: ProgressThrottle,
    pending: AtomicUsize,
    adaptive_streaming: AtomicBool,
    canceled: AtomicBool,
    pin: HostPin,
    policy: AdaptivePolicy,
}

impl LocalTransfer {
    pub fn new(source: Source, meta: TransferMeta) -> Self {
        Self {
            size: source.len(),
            seekable: source.is_seekable(),
            source: Mutex::new(source),
            meta,
            coverage: RangeCoverage::new(),
            events: EventBus::new(),
            progress: ProgressThrottle::default(),
            pending: AtomicUsize::new(0),
            adaptive_streaming: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            pin: HostPin::new(),
            policy: AdaptivePolicy::default(),
        }
    }

    /// Replaces the adaptive-stream policy.
    pub fn with_policy(mut self, policy: AdaptivePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn coverage(&self) -> &RangeCoverage {
        &self.coverage
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    async fn serve(&self, ctx: HttpContext) {
        let HttpContext {
            request,
            mut response,
        } = ctx;

        let (offset, count) = match prepare_response(&request, &mut response, &self.meta, self.size)
        {
            RangePlan::Serve { offset, count } => (offset, count),
            RangePlan::Unsatisfiable => return,
        };
        if request.is_head() {
            return;
        }

        if self.pending.fetch_add(1, Ordering::SeqCst) == 0 {
            self.events.emit(TransferEvent::Start);
        }

        let adaptive_client = self.seekable
            && self
                .policy
                .is_adaptive_client(request.user_agent(), self.meta.mimetype.as_deref());
        if adaptive_client && AdaptivePolicy::is_probe(offset, count) {
            tracing::debug!(peer = %request.remote, "adaptive streaming client detected");
            self.adaptive_streaming.store(true, Ordering::SeqCst);
        }
        if offset == 0 && self.size.is_none_or(|size| count == size) {
            self.coverage.reset();
        }

        let disconnected = self.stream_range(&mut response, offset, count).await;
        drop(response);

        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            tokio::time::sleep(SETTLE_DELAY).await;
            self.settle(adaptive_client, disconnected).await;
        }
    }

    /// Streams `[offset, offset + count)`, or the rest of a stream source.
    ///
    /// Returns `true` if the downloader went away mid-write.
    async fn stream_range(&self, response: &mut ResponseWriter, offset: u64, count: u64) -> bool {
        let end = self.size.map(|_| offset + count);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut position = offset;

        while !self.is_canceled() {
            let want = match end {
                Some(end) => (end - position).min(CHUNK_SIZE as u64) as usize,
                None => CHUNK_SIZE,
            };
            if want == 0 {
                break;
            }

            let (at, n) = match self.read_chunk(position, &mut buf[..want]).await {
                Ok((_, 0)) => break,
                Ok(read) => read,
                Err(e) => {
                    tracing::warn!("{e}");
                    break;
                }
            };

            if response
                .write(Bytes::copy_from_slice(&buf[..n]))
                .await
                .is_err()
            {
                tracing::debug!(position, "downloader disconnected");
                return true;
            }
            self.coverage.download(at, n as u64);
            position += n as u64;
            self.progress
                .tick(&self.events, self.coverage.downloaded(), self.size);
        }

        response.finish();
        false
    }

    /// Reads the chunk at `position` and returns where it starts.
    ///
    /// Stream sources read from wherever they are.
    async fn read_chunk(&self, position: u64, buf: &mut [u8]) -> Result<(u64, usize), SourceError> {
        let mut source = self.source.lock().await;
        let at = if self.seekable {
            position
        } else {
            source.position()
        };
        let n = source.read_at(position, buf).await?;
        if let Some(len) = self.size.filter(|len| n == 0 && position < *len) {
            return Err(SourceError::Truncated { position, len });
        }
        Ok((at, n))
    }

    /// Decides the outcome once no requests are pending.
    async fn settle(&self, adaptive_client: bool, disconnected: bool) {
        let done = match self.size {
            None => true,
            Some(size) => {
                self.coverage.downloaded() >= size
                    || (self.adaptive_streaming.load(Ordering::SeqCst)
                        && self.policy.is_done(&self.coverage, size))
            }
        };

        if done {
            if adaptive_client {
                // Players sometimes fetch the whole resource again right
                // after finishing; give that request a chance to arrive.
                tokio::time::sleep(self.policy.completion_grace).await;
                if self.pending.load(Ordering::SeqCst) == 0 {
                    self.events.emit(TransferEvent::Complete);
                }
            } else if disconnected {
                self.events.emit(TransferEvent::Disconnect);
            } else {
                self.events.emit(TransferEvent::Complete);
            }
        } else if self.is_canceled() {
            self.events.emit(TransferEvent::Cancel);
        } else if disconnected {
            self.events.emit(TransferEvent::Disconnect);
        }
    }
}

impl Transfer for LocalTransfer {
    fn handle_download_request(&self, ctx: HttpContext) -> TransferFuture<'_> {
        Box::pin(self.serve(ctx))
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.events.emit(TransferEvent::Cancel);
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn host_pin(&self) -> &HostPin {
        &self.pin
    }

    fn meta(&self) -> &TransferMeta {
        &self.meta
    }

    fn size(&self) -> Option<u64> {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{DownloadRequest, ResponseHead};
    use http::header::{RANGE, USER_AGENT};
    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use std::io::Cursor;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use tokio::sync::broadcast;

    const IPHONE: &str = "AppleCoreMedia/1.0.0 (iPhone; CPU OS 17_0 like Mac OS X)";

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn request(method: Method, range: Option<&str>, ua: Option<&str>) -> DownloadRequest {
        let mut headers = HeaderMap::new();
        if let Some(r) = range {
            headers.insert(RANGE, HeaderValue::from_str(r).unwrap());
        }
        if let Some(ua) = ua {
            headers.insert(USER_AGENT, HeaderValue::from_str(ua).unwrap());
        }
        DownloadRequest::new(method, headers, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    async fn fetch(transfer: &Arc<LocalTransfer>, req: DownloadRequest) -> (ResponseHead, Vec<u8>) {
        let (ctx, mut pending) = HttpContext::new(req);
        let t = Arc::clone(transfer);
        let task = tokio::spawn(async move { t.handle_download_request(ctx).await });

        let head = (&mut pending.head).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = pending.body.recv().await {
            body.extend_from_slice(&chunk);
        }
        task.await.unwrap();
        (head, body)
    }

    fn drain(rx: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event, TransferEvent::Progress { .. }) {
                out.push(event);
            }
        }
        out
    }

    fn seekable(data: &[u8], mimetype: Option<&str>) -> Arc<LocalTransfer> {
        let source = Source::seekable(Cursor::new(data.to_vec()), data.len() as u64);
        Arc::new(LocalTransfer::new(
            source,
            TransferMeta::new(Some("data.bin".into()), mimetype.map(str::to_string)),
        ))
    }

    #[tokio::test]
    async fn stream_full_get_completes_once() {
        let data = payload(300_000);
        let transfer = Arc::new(LocalTransfer::new(
            Source::stream(Cursor::new(data.clone())),
            TransferMeta::default(),
        ));
        let mut rx = transfer.events().subscribe();

        let (head, body) = fetch(&transfer, request(Method::GET, None, None)).await;
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(body, data);
        assert_eq!(
            drain(&mut rx),
            vec![TransferEvent::Start, TransferEvent::Complete]
        );
        assert!(transfer.events().is_finished());
    }

    #[tokio::test]
    async fn concurrent_ranges_complete_once() {
        let data = payload(2000);
        let transfer = seekable(&data, None);
        let mut rx = transfer.events().subscribe();

        let (a, b) = tokio::join!(
            fetch(&transfer, request(Method::GET, Some("bytes=0-999"), None)),
            fetch(&transfer, request(Method::GET, Some("bytes=1000-1999"), None)),
        );
        assert_eq!(a.0.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(a.1, &data[..1000]);
        assert_eq!(b.1, &data[1000..]);

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&TransferEvent::Start));
        let completes = events
            .iter()
            .filter(|e| **e == TransferEvent::Complete)
            .count();
        assert_eq!(completes, 1);
        assert_eq!(transfer.coverage().downloaded(), 2000);
    }

    #[tokio::test]
    async fn partial_range_emits_no_terminal_event() {
        let data = payload(5000);
        let transfer = seekable(&data, None);
        let mut rx = transfer.events().subscribe();

        let (_, body) = fetch(&transfer, request(Method::GET, Some("bytes=100-199"), None)).await;
        assert_eq!(body, &data[100..200]);
        assert_eq!(drain(&mut rx), vec![TransferEvent::Start]);
        assert!(!transfer.events().is_finished());
    }

    #[tokio::test]
    async fn head_and_unsatisfiable_have_no_events() {
        let data = payload(100);
        let transfer = seekable(&data, None);
        let mut rx = transfer.events().subscribe();

        let (head, body) = fetch(&transfer, request(Method::HEAD, None, None)).await;
        assert_eq!(head.status, StatusCode::OK);
        assert!(body.is_empty());

        let (head, body) = fetch(&transfer, request(Method::GET, Some("bytes=50-500"), None)).await;
        assert_eq!(head.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(body.is_empty());

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn dropped_downloader_disconnects() {
        let data = payload(4 * 1024 * 1024);
        let transfer = seekable(&data, None);
        let mut rx = transfer.events().subscribe();

        let (ctx, mut pending) = HttpContext::new(request(Method::GET, None, None));
        let t = Arc::clone(&transfer);
        let task = tokio::spawn(async move { t.handle_download_request(ctx).await });
        let _ = (&mut pending.head).await.unwrap();
        let _ = pending.body.recv().await.unwrap();
        drop(pending);
        task.await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![TransferEvent::Start, TransferEvent::Disconnect]
        );
        assert!(!transfer.events().is_finished());
    }

    #[tokio::test]
    async fn cancel_emits_once_and_stops_reading() {
        let data = payload(1000);
        let transfer = seekable(&data, None);
        let mut rx = transfer.events().subscribe();

        transfer.cancel();
        transfer.cancel();
        let (_, body) = fetch(&transfer, request(Method::GET, None, None)).await;
        assert!(body.is_empty());
        assert_eq!(drain(&mut rx), vec![TransferEvent::Cancel]);
    }

    #[tokio::test]
    async fn repeated_full_download_resets_coverage() {
        let data = payload(1000);
        let transfer = seekable(&data, None);

        let (_, first) = fetch(&transfer, request(Method::GET, Some("bytes=0-499"), None)).await;
        assert_eq!(first.len(), 500);
        assert_eq!(transfer.coverage().downloaded(), 500);

        let (_, full) = fetch(&transfer, request(Method::GET, None, None)).await;
        assert_eq!(full, data);
        assert_eq!(transfer.coverage().downloaded(), 1000);
    }

    #[tokio::test]
    async fn adaptive_client_completes_without_every_byte() {
        let chunk = CHUNK_SIZE;
        let data = payload(chunk * 10);
        let source = Source::seekable(Cursor::new(data.clone()), data.len() as u64);
        let transfer = Arc::new(
            LocalTransfer::new(
                source,
                TransferMeta::new(Some("clip.mp4".into()), Some("video/mp4".into())),
            )
            .with_policy(AdaptivePolicy {
                completion_grace: Duration::from_millis(50),
                ..Default::default()
            }),
        );
        let mut rx = transfer.events().subscribe();

        let (_, probe) =
            fetch(&transfer, request(Method::GET, Some("bytes=0-1"), Some(IPHONE))).await;
        assert_eq!(probe, &data[..2]);
        assert!(!transfer.events().is_finished());

        let tail = format!("bytes={}-", chunk * 7 + 10);
        let (_, body) = fetch(&transfer, request(Method::GET, Some(&tail), Some(IPHONE))).await;
        assert_eq!(body, &data[chunk * 7 + 10..]);

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&TransferEvent::Complete));
        assert!(transfer.coverage().downloaded() < data.len() as u64);
    }
}
