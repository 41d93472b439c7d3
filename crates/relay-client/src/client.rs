use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, broadcast};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use webrelay_protocol::{
    CHUNK_SIZE, HANDSHAKE_TIMEOUT, Handshake, Instruction, ProtocolError, WS_MAX_MESSAGE_SIZE,
    parse_code_reply,
};
use webrelay_transfer::{
    EventBus, ProgressThrottle, RangeCoverage, ShortCode, Source, TransferEvent,
};

use crate::ClientError;

/// Streams a [`Source`] to a relay through a WebSocket tunnel.
///
/// The relay drives the exchange: every `range:` instruction moves the
/// read position, and each blank frame asks for the next chunk.
pub struct BridgedUploadClient {
    shared: Arc<Shared>,
    code: StdMutex<Option<ShortCode>>,
    connecting: Mutex<()>,
}

struct Shared {
    events: EventBus,
    progress: ProgressThrottle,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Default for BridgedUploadClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgedUploadClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                events: EventBus::new(),
                progress: ProgressThrottle::default(),
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
            code: StdMutex::new(None),
            connecting: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Code assigned by the relay, once connected.
    pub fn code(&self) -> Option<ShortCode> {
        self.code.lock().unwrap().clone()
    }

    /// Opens the tunnel at `url` (a `ws://` URL) and starts serving
    /// `source` through it.
    ///
    /// Connecting and the handshake are bounded by [`HANDSHAKE_TIMEOUT`].
    pub async fn connect(
        &self,
        url: &str,
        source: Source,
        filename: Option<&str>,
        mimetype: Option<&str>,
    ) -> Result<ShortCode, ClientError> {
        let _connecting = self.connecting.lock().await;
        if self.code().is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let handshake = Handshake {
            filename: filename.filter(|s| !s.is_empty()).map(str::to_owned),
            filesize: source.len(),
            mimetype: mimetype.filter(|s| !s.is_empty()).map(str::to_owned),
        };

        let (socket, code) = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
            ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
            let (mut socket, _) =
                tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
            let code = announce(&mut socket, &handshake).await?;
            Ok::<_, ClientError>((socket, code))
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        tracing::info!(%code, url, filename = ?handshake.filename, "upload tunnel open");
        *self.code.lock().unwrap() = Some(code.clone());

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { pump(socket, source, shared).await });
        Ok(code)
    }

    /// Stops uploading and closes the tunnel. Cancel fires once the
    /// upload loop has exited.
    pub async fn cancel(&self) {
        self.shared.cancel.cancel();
        self.finished().await;
        self.shared.events.emit(TransferEvent::Cancel);
    }

    /// Resolves once the tunnel is closed. Returns at once if it was
    /// never opened.
    pub async fn finished(&self) {
        if self.code().is_some() {
            self.shared.done.cancelled().await;
        }
    }
}

impl Drop for BridgedUploadClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Sends the handshake frames and waits for the relay's code.
pub(crate) async fn announce<S>(socket: &mut S, handshake: &Handshake) -> Result<ShortCode, ClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    for frame in handshake.to_frames() {
        socket.send(Message::Text(frame.into())).await?;
    }
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                let code = parse_code_reply(text.as_str())?;
                return ShortCode::parse(&code)
                    .ok_or_else(|| ProtocolError::InvalidCodeReply(code).into());
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ProtocolError::Handshake("relay closed the tunnel".into()).into());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Bytes to send next: up to the following chunk boundary, clipped to the
/// window when one applies.
fn chunk_len(position: u64, remaining: Option<u64>) -> usize {
    let aligned = CHUNK_SIZE - (position % CHUNK_SIZE as u64) as usize;
    match remaining {
        Some(remaining) => aligned.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
        None => aligned,
    }
}

enum Step {
    Sent,
    Idle,
    EndOfInput,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("send failed: {0}")]
    Socket(#[source] WsError),
}

/// Read position and what is left of the current `range:` window.
struct Window {
    position: u64,
    remaining: u64,
}

struct Uploader<S> {
    socket: S,
    source: Source,
    sent: RangeCoverage,
    window: Window,
    buf: Vec<u8>,
    shared: Arc<Shared>,
}

impl<S> Uploader<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    fn is_complete(&self) -> bool {
        self.source
            .len()
            .is_some_and(|len| self.sent.downloaded() >= len)
    }

    async fn send_chunk(&mut self) -> Result<Step, StepError> {
        let seekable = self.source.is_seekable();
        let (position, len) = if seekable {
            if self.window.remaining == 0 {
                return Ok(Step::Idle);
            }
            let position = self.window.position;
            (position, chunk_len(position, Some(self.window.remaining)))
        } else {
            let position = self.source.position();
            (position, chunk_len(position, None))
        };

        let read = self
            .source
            .read_at(position, &mut self.buf[..len])
            .await
            .map_err(StepError::Read)?;
        if read == 0 {
            return Ok(Step::EndOfInput);
        }

        self.socket
            .send(Message::Binary(Bytes::copy_from_slice(&self.buf[..read])))
            .await
            .map_err(StepError::Socket)?;

        self.sent.download(position, read as u64);
        if seekable {
            self.window.position += read as u64;
            self.window.remaining = self.window.remaining.saturating_sub(read as u64);
        }
        self.shared
            .progress
            .tick(&self.shared.events, self.sent.downloaded(), self.source.len());
        Ok(Step::Sent)
    }

    async fn close(&mut self) {
        let _ = self.socket.close().await;
    }

    /// The socket failed or closed without `completed`.
    ///
    /// Once every byte of a sized source reached the relay the upload is
    /// reported complete, even if the relay never confirmed it.
    fn lost(&self, clean: bool) {
        let event = if self.is_complete() {
            TransferEvent::Complete
        } else if self.source.is_seekable() || clean {
            TransferEvent::Cancel
        } else {
            TransferEvent::Disconnect
        };
        self.shared.events.emit(event);
    }

    async fn run(mut self) {
        let mut started = false;
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => {
                    self.close().await;
                    self.shared.events.emit(TransferEvent::Cancel);
                    return;
                }
                frame = self.socket.next() => frame,
            };

            let step = match frame {
                Some(Ok(Message::Text(text))) => match Instruction::parse(text.as_str()) {
                    Ok(Instruction::Range { offset, count }) => {
                        tracing::debug!(offset, count, "range requested");
                        if !started {
                            started = true;
                            self.shared.events.emit(TransferEvent::Start);
                        }
                        self.window = Window {
                            position: offset,
                            remaining: count,
                        };
                        self.send_chunk().await
                    }
                    Ok(Instruction::Continue) => self.send_chunk().await,
                    Ok(Instruction::Completed) => {
                        self.close().await;
                        self.shared.events.emit(TransferEvent::Complete);
                        return;
                    }
                    Ok(Instruction::Disconnected) => {
                        tracing::debug!("downloader disconnected");
                        self.shared.events.emit(TransferEvent::Disconnect);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("ignoring relay frame: {e}");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("relay closed the tunnel");
                    self.lost(true);
                    return;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!("tunnel error: {e}");
                    self.lost(false);
                    return;
                }
            };

            match step {
                Ok(Step::Sent | Step::Idle) => {}
                Ok(Step::EndOfInput) => {
                    self.close().await;
                    if self.source.is_seekable() {
                        tracing::warn!(
                            position = self.window.position,
                            "source ended before its length"
                        );
                        self.shared.events.emit(TransferEvent::Cancel);
                    } else {
                        self.shared.events.emit(TransferEvent::Complete);
                    }
                    return;
                }
                Err(StepError::Read(e)) => {
                    tracing::warn!("reading source failed: {e}");
                    self.close().await;
                    self.shared.events.emit(TransferEvent::Cancel);
                    return;
                }
                Err(StepError::Socket(e)) => {
                    tracing::warn!("tunnel error: {e}");
                    self.lost(false);
                    return;
                }
            }
        }
    }
}

async fn pump<S>(socket: S, source: Source, shared: Arc<Shared>)
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let _done = shared.done.clone().drop_guard();
    Uploader {
        socket,
        source,
        sent: RangeCoverage::new(),
        window: Window {
            position: 0,
            remaining: 0,
        },
        buf: vec![0; CHUNK_SIZE],
        shared,
    }
    .run()
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4 * CHUNK_SIZE);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let relay = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, relay)
    }

    fn text(s: &str) -> Message {
        Message::Text(s.to_string().into())
    }

    async fn next_binary(relay: &mut WebSocketStream<DuplexStream>) -> Bytes {
        loop {
            match relay.next().await.unwrap().unwrap() {
                Message::Binary(data) => return data,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    fn spawn_pump(
        client: WebSocketStream<DuplexStream>,
        source: Source,
    ) -> (Arc<Shared>, broadcast::Receiver<TransferEvent>) {
        let shared = Arc::new(Shared {
            events: EventBus::new(),
            progress: ProgressThrottle::default(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        });
        let events = shared.events.subscribe();
        tokio::spawn(pump(client, source, Arc::clone(&shared)));
        (shared, events)
    }

    #[test]
    fn chunks_align_to_boundaries() {
        assert_eq!(chunk_len(0, Some(10)), 10);
        assert_eq!(chunk_len(0, Some(1 << 20)), CHUNK_SIZE);
        assert_eq!(chunk_len(100, Some(1 << 20)), CHUNK_SIZE - 100);
        assert_eq!(chunk_len(CHUNK_SIZE as u64, None), CHUNK_SIZE);
        assert_eq!(chunk_len(CHUNK_SIZE as u64 + 1, None), CHUNK_SIZE - 1);
    }

    #[tokio::test]
    async fn announce_reads_code() {
        let (mut client, mut relay) = socket_pair().await;
        let relay_task = tokio::spawn(async move {
            let mut frames = Vec::new();
            while frames.len() < 3 {
                if let Message::Text(t) = relay.next().await.unwrap().unwrap() {
                    frames.push(t.as_str().to_string());
                }
            }
            relay.send(text("code=9fakr")).await.unwrap();
            frames
        });

        let handshake = Handshake {
            filename: Some("a.bin".into()),
            filesize: Some(3),
            mimetype: None,
        };
        let code = announce(&mut client, &handshake).await.unwrap();
        assert_eq!(code.as_str(), "9fakr");
        assert_eq!(relay_task.await.unwrap(), vec!["a.bin", "3", ""]);
    }

    #[tokio::test]
    async fn announce_rejects_bad_code() {
        let (mut client, mut relay) = socket_pair().await;
        tokio::spawn(async move {
            for _ in 0..3 {
                relay.next().await;
            }
            relay.send(text("code=hello")).await.unwrap();
        });
        let err = announce(&mut client, &Handshake::default()).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ProtocolError::InvalidCodeReply(_))));
    }

    #[tokio::test]
    async fn serves_ranges_and_completes() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (client, mut relay) = socket_pair().await;
        let (_shared, mut events) = spawn_pump(client, Source::seekable(Cursor::new(data.clone()), data.len() as u64));

        relay.send(text("range: 100-70000")).await.unwrap();
        let first = next_binary(&mut relay).await;
        assert_eq!(first.len(), CHUNK_SIZE - 100);
        assert_eq!(&first[..], &data[100..CHUNK_SIZE]);

        relay.send(text("")).await.unwrap();
        let second = next_binary(&mut relay).await;
        assert_eq!(second.len(), 70000 - (CHUNK_SIZE - 100));
        assert_eq!(&second[..], &data[CHUNK_SIZE..70100]);

        relay.send(text("completed")).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Start);
        loop {
            match events.recv().await.unwrap() {
                TransferEvent::Progress { .. } => continue,
                event => {
                    assert_eq!(event, TransferEvent::Complete);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn disconnect_keeps_tunnel_open() {
        let data = vec![7u8; 1000];
        let (client, mut relay) = socket_pair().await;
        let (_shared, mut events) = spawn_pump(client, Source::seekable(Cursor::new(data), 1000));

        relay.send(text("range: 0-1000")).await.unwrap();
        next_binary(&mut relay).await;
        relay.send(text("disconnected")).await.unwrap();
        relay.send(text("range: 500-10")).await.unwrap();
        assert_eq!(next_binary(&mut relay).await.len(), 10);

        assert_eq!(events.recv().await.unwrap(), TransferEvent::Start);
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Disconnect);
    }

    #[tokio::test]
    async fn stream_end_completes() {
        let (client, mut relay) = socket_pair().await;
        let (shared, mut events) = spawn_pump(client, Source::stream(Cursor::new(b"hello".to_vec())));

        relay.send(text(&format!("range: 0-{CHUNK_SIZE}"))).await.unwrap();
        assert_eq!(&next_binary(&mut relay).await[..], b"hello");
        relay.send(text("")).await.unwrap();

        shared.done.cancelled().await;
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Start);
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Complete);
    }

    #[tokio::test]
    async fn relay_close_cancels_incomplete_upload() {
        let (client, mut relay) = socket_pair().await;
        let (shared, mut events) = spawn_pump(client, Source::seekable(Cursor::new(vec![0u8; 10]), 10));

        relay.close(None).await.unwrap();
        shared.done.cancelled().await;
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Cancel);
    }

    #[tokio::test]
    async fn relay_close_after_every_byte_completes() {
        let (client, mut relay) = socket_pair().await;
        let (shared, mut events) = spawn_pump(client, Source::seekable(Cursor::new(vec![3u8; 10]), 10));

        relay.send(text("range: 0-10")).await.unwrap();
        assert_eq!(next_binary(&mut relay).await.len(), 10);
        relay.close(None).await.unwrap();

        shared.done.cancelled().await;
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Start);
        loop {
            match events.recv().await.unwrap() {
                TransferEvent::Progress { .. } => continue,
                event => {
                    assert_eq!(event, TransferEvent::Complete);
                    break;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_relay_never_answers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                return;
            };
            // Reads the handshake but never replies with a code.
            while let Some(Ok(_)) = socket.next().await {}
        });

        let client = BridgedUploadClient::new();
        let started = tokio::time::Instant::now();
        let err = client
            .connect(&url, Source::seekable(Cursor::new(vec![0u8; 4]), 4), Some("a.bin"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout), "{err:?}");
        assert!(started.elapsed() >= HANDSHAKE_TIMEOUT);
        assert!(client.code().is_none());
        relay.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn finished_returns_when_never_connected() {
        let client = BridgedUploadClient::new();
        tokio::time::timeout(std::time::Duration::from_secs(1), client.finished())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_closes_tunnel() {
        let (client, mut relay) = socket_pair().await;
        let (shared, mut events) = spawn_pump(client, Source::seekable(Cursor::new(vec![0u8; 10]), 10));

        shared.cancel.cancel();
        shared.done.cancelled().await;
        assert_eq!(events.recv().await.unwrap(), TransferEvent::Cancel);
        assert!(matches!(relay.next().await, Some(Ok(Message::Close(_)))));
    }
}
