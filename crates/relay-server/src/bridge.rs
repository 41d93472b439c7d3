//! Relay side of the upload tunnel.
//!
//! A [`BridgedUpload`] serves downloads whose bytes live in a remote
//! uploader connected over a WebSocket. Only one downloader request uses
//! the tunnel at a time: overlapping requests queue behind each other
//! through a [`RequestQueue`], and the upload loop in [`BridgedUpload::run`]
//! reacts to each request's outcome.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::StatusCode;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use webrelay_protocol::{Handshake, Instruction, ProtocolError};
use webrelay_transfer::{
    AdaptivePolicy, EventBus, HostPin, HttpContext, ProgressThrottle, RangeCoverage, RangePlan,
    ResponseWriter, Transfer, TransferEvent, TransferFuture, TransferMeta, prepare_response,
};

use crate::RelayError;

/// How long to wait for the uploader to close after `completed`.
const CLOSE_WAIT: Duration = Duration::from_secs(3);

/// A WebSocket carrying the tunnel.
pub trait FrameStream:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static
{
}

impl<T> FrameStream for T where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Send
        + Unpin
        + 'static
{
}

type Socket = Box<dyn FrameStream>;

/// Reads the three handshake frames sent by a new uploader.
///
/// Control frames are skipped. The caller bounds this with a timeout.
pub async fn read_handshake<S>(socket: &mut S) -> Result<Handshake, RelayError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut fields = Vec::with_capacity(3);
    while fields.len() < 3 {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => fields.push(text.as_str().to_string()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                return Err(ProtocolError::Handshake("closed during handshake".into()).into());
            }
            Some(Ok(_)) => {
                return Err(ProtocolError::Handshake("expected a text frame".into()).into());
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
    Ok(Handshake::from_frames(&fields[0], &fields[1], &fields[2]))
}

/// How one downloader request through the tunnel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestOutcome {
    /// Everything the downloader needs was delivered.
    Completed,
    /// The uploader went away or the transfer was canceled.
    Canceled,
    /// The downloader dropped mid-write.
    Interrupted,
    /// A bounded range finished; more requests are expected.
    Partial,
}

/// FIFO of one-shot completion tickets serializing downloader requests.
///
/// Each request takes the previous request's ticket, leaves its own, and
/// waits on the one it took. The upload loop releases a ticket once it has
/// reacted to that request's outcome; dropping the sender releases it too.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    next_id: AtomicU64,
    tickets: StdMutex<VecDeque<(u64, oneshot::Receiver<()>)>>,
}

/// A request's place in the [`RequestQueue`].
#[derive(Debug)]
pub(crate) struct Ticket {
    pub id: u64,
    /// Fire or drop to let the next request proceed.
    pub release: oneshot::Sender<()>,
    /// The ticket of the request ahead of this one, if any.
    pub previous: Option<oneshot::Receiver<()>>,
}

impl RequestQueue {
    pub fn enter(&self) -> Ticket {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (release, waiter) = oneshot::channel();
        let mut tickets = self.tickets.lock().unwrap();
        let previous = tickets.pop_front().map(|(_, rx)| rx);
        tickets.push_back((id, waiter));
        Ticket {
            id,
            release,
            previous,
        }
    }

    /// Returns `true` if no request has queued up behind `id`.
    pub fn is_latest(&self, id: u64) -> bool {
        self.tickets
            .lock()
            .unwrap()
            .front()
            .is_some_and(|(front, _)| *front == id)
    }
}

/// Handed from a request to the upload loop once it owns the tunnel.
struct Connected {
    id: u64,
    release: oneshot::Sender<()>,
    /// Fired once the loop stopped reading frames, so the request can.
    ack: oneshot::Sender<()>,
    outcome: oneshot::Receiver<RequestOutcome>,
}

/// What the uploader sent while the relay was waiting for data.
enum Inbound {
    Data(Bytes),
    Closed(Option<String>),
}

/// A transfer whose bytes come from a remote uploader.
pub struct BridgedUpload {
    meta: TransferMeta,
    size: Option<u64>,
    sink: Mutex<SplitSink<Socket, Message>>,
    frames: Mutex<SplitStream<Socket>>,
    coverage: RangeCoverage,
    events: EventBus,
    progress: ProgressThrottle,
    queue: RequestQueue,
    connected_tx: mpsc::Sender<Connected>,
    connected_rx: Mutex<Option<mpsc::Receiver<Connected>>>,
    adaptive_client: AtomicBool,
    adaptive_streaming: AtomicBool,
    socket_closed: AtomicBool,
    close_reason: StdMutex<Option<String>>,
    cancel: CancellationToken,
    pin: HostPin,
    policy: AdaptivePolicy,
}

impl BridgedUpload {
    /// Wraps a socket whose handshake was already read.
    pub fn new(socket: impl FrameStream, handshake: Handshake, policy: AdaptivePolicy) -> Self {
        let socket: Socket = Box::new(socket);
        let (sink, frames) = socket.split();
        let (connected_tx, connected_rx) = mpsc::channel(1);
        Self {
            meta: TransferMeta::new(handshake.filename, handshake.mimetype),
            size: handshake.filesize,
            sink: Mutex::new(sink),
            frames: Mutex::new(frames),
            coverage: RangeCoverage::new(),
            events: EventBus::new(),
            progress: ProgressThrottle::default(),
            queue: RequestQueue::default(),
            connected_tx,
            connected_rx: Mutex::new(Some(connected_rx)),
            adaptive_client: AtomicBool::new(false),
            adaptive_streaming: AtomicBool::new(false),
            socket_closed: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
            cancel: CancellationToken::new(),
            pin: HostPin::new(),
            policy,
        }
    }

    pub fn coverage(&self) -> &RangeCoverage {
        &self.coverage
    }

    /// Sends a text frame to the uploader.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), RelayError> {
        let text: String = text.into();
        self.sink.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    fn mark_closed(&self, reason: Option<String>) {
        self.socket_closed.store(true, Ordering::SeqCst);
        if reason.is_some() {
            *self.close_reason.lock().unwrap() = reason;
        }
    }

    fn is_socket_closed(&self) -> bool {
        self.socket_closed.load(Ordering::SeqCst)
    }

    /// Closes our side of the tunnel, echoing the uploader's close reason.
    async fn close(&self) {
        let reason = self.close_reason.lock().unwrap().clone().unwrap_or_default();
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            tracing::trace!("close frame not sent: {e}");
        }
        let _ = sink.close().await;
    }

    /// Waits for the next data frame while a request is being served.
    async fn next_data(&self) -> Inbound {
        let mut frames = self.frames.lock().await;
        loop {
            match frames.next().await {
                Some(Ok(Message::Binary(data))) => return Inbound::Data(data),
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(len = text.len(), "ignoring text frame from uploader");
                }
                Some(Ok(Message::Close(frame))) => {
                    return Inbound::Closed(frame.map(|f| f.reason.as_str().to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("upload socket error: {e}");
                    return Inbound::Closed(None);
                }
                None => return Inbound::Closed(None),
            }
        }
    }

    /// Waits until the uploader closes; other frames are discarded.
    async fn wait_for_close(&self) -> Option<String> {
        loop {
            match self.next_data().await {
                Inbound::Closed(reason) => return reason,
                Inbound::Data(data) => {
                    tracing::debug!(len = data.len(), "ignoring unsolicited chunk");
                }
            }
        }
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

        let Ticket {
            id,
            release,
            previous,
        } = self.queue.enter();
        let first = previous.is_none();
        if let Some(previous) = previous {
            // A dropped sender releases us just the same.
            let _ = previous.await;
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        let connected = Connected {
            id,
            release,
            ack: ack_tx,
            outcome: outcome_rx,
        };
        if self.cancel.is_cancelled()
            || self.connected_tx.send(connected).await.is_err()
            || ack_rx.await.is_err()
        {
            tracing::debug!(peer = %request.remote, "tunnel already closed");
            response.reject(StatusCode::GONE);
            return;
        }
        if first {
            self.events.emit(TransferEvent::Start);
        }

        let adaptive_client = self.size.is_some()
            && self
                .policy
                .is_adaptive_client(request.user_agent(), self.meta.mimetype.as_deref());
        self.adaptive_client.store(adaptive_client, Ordering::SeqCst);
        if adaptive_client && AdaptivePolicy::is_probe(offset, count) {
            self.adaptive_streaming.store(true, Ordering::SeqCst);
        }
        if offset == 0 && self.size.is_none_or(|size| count == size) {
            self.coverage.reset();
        }

        let outcome = self.pump(&mut response, offset, count).await;
        tracing::debug!(peer = %request.remote, offset, count, ?outcome, "request finished");
        drop(response);
        let _ = outcome_tx.send(outcome);
    }

    /// Relays one window from the uploader to the downloader.
    async fn pump(&self, response: &mut ResponseWriter, mut offset: u64, count: u64) -> RequestOutcome {
        let instruction = Instruction::Range { offset, count };
        if let Err(e) = self.send_text(instruction.to_text()).await {
            tracing::debug!("range instruction not sent: {e}");
            self.mark_closed(None);
        }

        let mut remaining = count;
        while !self.is_socket_closed() && (self.size.is_none() || remaining > 0) {
            let inbound = tokio::select! {
                _ = self.cancel.cancelled() => return RequestOutcome::Canceled,
                inbound = self.next_data() => inbound,
            };
            let mut data = match inbound {
                Inbound::Data(data) => data,
                Inbound::Closed(reason) => {
                    self.mark_closed(reason);
                    break;
                }
            };
            if self.size.is_some() && data.len() as u64 > remaining {
                data.truncate(remaining as usize);
            }
            let n = data.len() as u64;

            let written = tokio::select! {
                _ = self.cancel.cancelled() => return RequestOutcome::Canceled,
                written = response.write(data) => written,
            };
            if written.is_err() {
                return RequestOutcome::Interrupted;
            }
            self.coverage.download(offset, n);
            offset += n;
            remaining = remaining.saturating_sub(n);
            self.progress
                .tick(&self.events, self.coverage.downloaded(), self.size);

            if self.size.is_none() || remaining > 0 {
                if let Err(e) = self.send_text(Instruction::Continue.to_text()).await {
                    tracing::debug!("continue instruction not sent: {e}");
                    self.mark_closed(None);
                }
            }
        }
        response.finish();
        self.classify()
    }

    fn classify(&self) -> RequestOutcome {
        let closed = self.is_socket_closed();
        match self.size {
            None if closed => RequestOutcome::Completed,
            Some(size)
                if self.coverage.downloaded() >= size
                    || (self.adaptive_streaming.load(Ordering::SeqCst)
                        && self.policy.is_done(&self.coverage, size)) =>
            {
                RequestOutcome::Completed
            }
            Some(_) if closed => RequestOutcome::Canceled,
            _ => RequestOutcome::Partial,
        }
    }

    /// Drives the tunnel until it completes, is canceled, or the uploader
    /// leaves.
    ///
    /// Waits on either a downloader taking the tunnel or the uploader
    /// closing it. Interrupted downloads keep the tunnel open for a resume.
    pub async fn run(&self) {
        let Some(mut connected) = self.connected_rx.lock().await.take() else {
            tracing::warn!("upload loop already running");
            return;
        };

        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                request = connected.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                reason = self.wait_for_close() => {
                    self.mark_closed(reason);
                    if self.size.is_some() || self.coverage.downloaded() == 0 {
                        self.events.emit(TransferEvent::Cancel);
                    }
                    tracing::info!(downloaded = self.coverage.downloaded(), "uploader closed the tunnel");
                    self.close().await;
                    return;
                }
            };

            let _ = request.ack.send(());
            let outcome = request.outcome.await.unwrap_or(RequestOutcome::Canceled);
            if self.queue.is_latest(request.id) {
                if self.adaptive_client.load(Ordering::SeqCst)
                    && matches!(
                        outcome,
                        RequestOutcome::Completed | RequestOutcome::Interrupted
                    )
                {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.policy.completion_grace) => {}
                    }
                    if !self.queue.is_latest(request.id) {
                        let _ = request.release.send(());
                        continue;
                    }
                }

                match outcome {
                    RequestOutcome::Completed => {
                        self.events.emit(TransferEvent::Complete);
                        if !self.is_socket_closed() {
                            let _ = self.send_text(Instruction::Completed.to_text()).await;
                            match tokio::time::timeout(CLOSE_WAIT, self.wait_for_close()).await {
                                Ok(reason) => self.mark_closed(reason),
                                Err(_) => tracing::debug!("uploader did not close in time"),
                            }
                        }
                        self.close().await;
                        return;
                    }
                    RequestOutcome::Interrupted => {
                        self.events.emit(TransferEvent::Disconnect);
                        if let Err(e) = self.send_text(Instruction::Disconnected.to_text()).await {
                            tracing::debug!("disconnect notice not sent: {e}");
                        }
                    }
                    RequestOutcome::Canceled => {
                        self.events.emit(TransferEvent::Cancel);
                        self.close().await;
                        return;
                    }
                    RequestOutcome::Partial => {}
                }
            }
            let _ = request.release.send(());
        }

        self.close().await;
    }
}

impl Transfer for BridgedUpload {
    fn handle_download_request(&self, ctx: HttpContext) -> TransferFuture<'_> {
        Box::pin(self.serve(ctx))
    }

    fn cancel(&self) {
        self.cancel.cancel();
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
