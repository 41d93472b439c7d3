//! Listener, registry and request dispatch.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use futures_util::stream;
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName, HeaderValue, LAST_MODIFIED, LOCATION,
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE, USER_AGENT,
};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use regex::Regex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_util::sync::CancellationToken;
use webrelay_protocol::{WS_MAX_MESSAGE_SIZE, format_code_reply};
use webrelay_transfer::{DownloadRequest, HttpContext, PendingResponse, ShortCode, Transfer};

use crate::bridge::{BridgedUpload, FrameStream, read_handshake};
use crate::config::RouterConfig;
use crate::fallback::{FallbackContent, StaticReply};
use crate::prefix::ListenPrefix;
use crate::registry::Registry;
use crate::throttle::HostThrottle;
use crate::{RelayError, RouteError};

/// Link-preview crawlers must not consume a download.
static LINK_PREVIEW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("(?i)bot|slack|facebook|whatsapp|discord|telegram|skype").unwrap()
});

const BRIDGE_CAPACITY: usize = 16;

type RelayBody = UnsyncBoxBody<Bytes, io::Error>;

/// Why [`RelayRouter::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The producer finished normally.
    Stopped,
    /// The producer gave up.
    Canceled,
}

/// Announced whenever an uploader opens a tunnel.
#[derive(Clone)]
pub struct BridgeRegistration {
    pub code: ShortCode,
    pub filename: Option<String>,
    pub filesize: Option<u64>,
    pub transfer: Arc<dyn Transfer>,
}

impl fmt::Debug for BridgeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRegistration")
            .field("code", &self.code)
            .field("filename", &self.filename)
            .field("filesize", &self.filesize)
            .finish_non_exhaustive()
    }
}

/// Accepts downloaders and uploaders and routes them to transfers.
pub struct RelayRouter {
    config: RouterConfig,
    registry: Arc<Registry>,
    throttle: Arc<HostThrottle>,
    fallback: FallbackContent,
    bridges: broadcast::Sender<BridgeRegistration>,
}

impl RelayRouter {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let (bridges, _) = broadcast::channel(BRIDGE_CAPACITY);
        Arc::new(Self {
            throttle: Arc::new(HostThrottle::new(config.throttle.clone())),
            config,
            registry: Arc::new(Registry::new()),
            fallback: FallbackContent::new(),
            bridges,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn throttle(&self) -> &HostThrottle {
        &self.throttle
    }

    /// Registers `transfer` under a fresh code.
    ///
    /// The entry is removed when the transfer completes or is canceled.
    pub fn register(&self, transfer: Arc<dyn Transfer>) -> ShortCode {
        let code = self.registry.insert(Arc::clone(&transfer));
        let id = Registry::identity_of(&transfer);
        let registry = Arc::downgrade(&self.registry);
        let hook_code = code.clone();
        transfer.events().on_terminal(move |event| {
            if let Some(registry) = registry.upgrade() {
                if registry.remove_by_identity(&hook_code, id) {
                    tracing::debug!(code = %hook_code, ?event, "transfer deregistered");
                }
            }
        });
        tracing::info!(
            %code,
            filename = ?transfer.meta().filename,
            size = ?transfer.size(),
            "transfer registered"
        );
        code
    }

    pub fn get(&self, code: &ShortCode) -> Option<Arc<dyn Transfer>> {
        self.registry.get(code)
    }

    /// Subscribes to tunnel registrations.
    pub fn subscribe_bridges(&self) -> broadcast::Receiver<BridgeRegistration> {
        self.bridges.subscribe()
    }

    /// Binds a listener for `prefix`.
    pub async fn bind(prefix: &ListenPrefix) -> Result<TcpListener, RelayError> {
        TcpListener::bind(prefix.bind_addr())
            .await
            .map_err(|source| RelayError::Bind {
                prefix: prefix.to_string(),
                source,
            })
    }

    /// Binds `prefix` and serves until `stop` resolves.
    pub async fn listen(
        self: &Arc<Self>,
        prefix: ListenPrefix,
        max_concurrent_accepts: usize,
        stop: impl Future<Output = ListenOutcome>,
    ) -> Result<ListenOutcome, RelayError> {
        let listener = Self::bind(&prefix).await?;
        self.serve(listener, prefix, max_concurrent_accepts, stop)
            .await
    }

    /// Serves `listener` until `stop` resolves.
    ///
    /// Keeps exactly `max_concurrent_accepts` accepts pending; each
    /// accepted connection is dispatched and its accept replaced. Accept
    /// failures are fatal. Open connections and tunnels are dropped when
    /// this returns.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        prefix: ListenPrefix,
        max_concurrent_accepts: usize,
        stop: impl Future<Output = ListenOutcome>,
    ) -> Result<ListenOutcome, RelayError> {
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, %prefix, "relay listening");

        let listener = Arc::new(listener);
        let prefix = Arc::new(prefix);
        let shutdown = CancellationToken::new();
        let _shutdown_guard = shutdown.clone().drop_guard();

        {
            let throttle = Arc::clone(&self.throttle);
            let cancel = shutdown.clone();
            tokio::spawn(async move { throttle.run_cleanup(cancel).await });
        }

        let mut accepts = JoinSet::new();
        for _ in 0..max_concurrent_accepts.max(1) {
            let listener = Arc::clone(&listener);
            accepts.spawn(async move { listener.accept().await });
        }

        tokio::pin!(stop);
        loop {
            tokio::select! {
                outcome = &mut stop => {
                    tracing::info!(?outcome, "relay stopping");
                    return Ok(outcome);
                }

                Some(joined) = accepts.join_next() => {
                    let (stream, peer) = match joined {
                        Ok(Ok(accepted)) => accepted,
                        Ok(Err(e)) => return Err(RelayError::Accept(e)),
                        Err(e) => return Err(RelayError::Accept(io::Error::other(e))),
                    };

                    let next = Arc::clone(&listener);
                    accepts.spawn(async move { next.accept().await });

                    let router = Arc::clone(self);
                    let prefix = Arc::clone(&prefix);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        router.serve_connection(stream, peer, prefix, shutdown).await;
                    });
                }
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        prefix: Arc<ListenPrefix>,
        shutdown: CancellationToken,
    ) {
        let router = Arc::clone(&self);
        let conn_shutdown = shutdown.clone();
        let service = service_fn(move |req| {
            let router = Arc::clone(&router);
            let prefix = Arc::clone(&prefix);
            let shutdown = conn_shutdown.clone();
            async move { router.route(req, peer, &prefix, shutdown).await }
        });

        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();

        tokio::select! {
            result = conn => {
                if let Err(e) = result {
                    tracing::debug!(%peer, "connection closed: {e}");
                }
            }
            _ = shutdown.cancelled() => {
                tracing::trace!(%peer, "dropping connection on shutdown");
            }
        }
    }

    async fn route(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
        prefix: &ListenPrefix,
        shutdown: CancellationToken,
    ) -> Result<Response<RelayBody>, RouteError> {
        let remote = peer.ip();
        if self.throttle.is_blocked(remote) {
            tracing::trace!(%peer, "dropping request from throttled host");
            return Err(RouteError::Throttled(remote));
        }

        if is_websocket_upgrade(&req) {
            if !self.config.accept_socket_connections {
                return Ok(status(StatusCode::NOT_FOUND));
            }
            return Ok(self.upgrade(req, peer, shutdown));
        }

        let base = prefix.base_path.as_str();
        let path = req.uri().path();
        if base != "/" && path == base.trim_end_matches('/') {
            let mut response = status(StatusCode::MOVED_PERMANENTLY);
            if let Ok(location) = HeaderValue::from_str(base) {
                response.headers_mut().insert(LOCATION, location);
            }
            return Ok(response);
        }
        let Some(relative) = path.strip_prefix(base) else {
            self.throttle.record(remote);
            return Ok(status(StatusCode::NOT_FOUND));
        };
        let relative = normalize_path(relative);

        let candidate = if relative.is_empty() {
            request_host(&req).and_then(subdomain_label)
        } else {
            Some(relative.clone())
        };

        match candidate.as_deref().and_then(ShortCode::parse) {
            Some(code) => {
                let user_agent = req
                    .headers()
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                match self.registry.get(&code) {
                    Some(transfer) if !LINK_PREVIEW.is_match(user_agent) => {
                        if self.config.pin_downloader_host
                            && req.method() != Method::HEAD
                            && !transfer.host_pin().admit(remote)
                        {
                            tracing::warn!(%peer, %code, "rejecting download from unpinned host");
                            return Ok(status(StatusCode::GONE));
                        }
                        tracing::debug!(%peer, %code, method = %req.method(), "download request");
                        Ok(download(transfer, req, peer).await)
                    }
                    _ => Ok(status(StatusCode::GONE)),
                }
            }
            None => {
                let landing = relative.is_empty();
                if landing
                    && !(self.config.enable_builtin_webclient
                        && self.config.accept_socket_connections)
                {
                    return Ok(status(StatusCode::NOT_FOUND));
                }
                if let Some(reply) = self.fallback.respond(&relative, req.headers()) {
                    return Ok(static_response(reply));
                }
                tracing::debug!(%peer, path, "unknown path");
                self.throttle.record(remote);
                Ok(status(StatusCode::NOT_FOUND))
            }
        }
    }

    /// Answers a WebSocket upgrade and hands the socket to the upload path.
    fn upgrade(
        self: &Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Response<RelayBody> {
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return status(StatusCode::BAD_REQUEST);
        };
        let accept = derive_accept_key(key.as_bytes());
        let on_upgrade = hyper::upgrade::on(&mut req);

        let router = Arc::clone(self);
        tokio::spawn(async move {
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!(%peer, "WebSocket upgrade failed: {e}");
                    return;
                }
            };
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
            ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
            let socket = WebSocketStream::from_raw_socket(
                TokioIo::new(upgraded),
                Role::Server,
                Some(ws_config),
            )
            .await;
            if let Err(e) = router.accept_upload(socket, peer, shutdown).await {
                tracing::debug!(%peer, "upload tunnel ended: {e}");
            }
        });

        let mut response = status(StatusCode::SWITCHING_PROTOCOLS);
        let headers = response.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        if let Ok(accept) = HeaderValue::from_str(&accept) {
            headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
        }
        response
    }

    /// Runs the upload handshake, registers the tunnel and drives it.
    async fn accept_upload<S: FrameStream>(
        &self,
        mut socket: S,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError> {
        use futures_util::SinkExt;

        let timeout = self.config.handshake_timeout;
        let handshake = match tokio::time::timeout(timeout, read_handshake(&mut socket)).await {
            Ok(handshake) => handshake?,
            Err(_) => {
                let _ = socket.close().await;
                return Err(RelayError::HandshakeTimeout);
            }
        };

        let upload = Arc::new(BridgedUpload::new(
            socket,
            handshake.clone(),
            self.config.adaptive.clone(),
        ));
        let transfer: Arc<dyn Transfer> = upload.clone();
        let code = self.register(Arc::clone(&transfer));

        let reply = tokio::time::timeout(timeout, upload.send_text(format_code_reply(code.as_str())))
            .await
            .unwrap_or(Err(RelayError::HandshakeTimeout));
        if let Err(e) = reply {
            self.registry.remove(&code, &transfer);
            return Err(e);
        }
        tracing::info!(%peer, %code, filename = ?handshake.filename, filesize = ?handshake.filesize, "upload tunnel open");

        // Nobody listening is fine.
        let _ = self.bridges.send(BridgeRegistration {
            code: code.clone(),
            filename: handshake.filename,
            filesize: handshake.filesize,
            transfer: Arc::clone(&transfer),
        });

        tokio::select! {
            _ = upload.run() => {}
            _ = shutdown.cancelled() => upload.cancel(),
        }

        self.registry.remove(&code, &transfer);
        tracing::info!(%code, "upload tunnel closed");
        Ok(())
    }
}

/// Serves one download by running the transfer on its own task.
async fn download(
    transfer: Arc<dyn Transfer>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Response<RelayBody> {
    let (parts, _body) = req.into_parts();
    let request = DownloadRequest::new(parts.method, parts.headers, peer.ip());
    let (ctx, pending) = HttpContext::new(request);
    tokio::spawn(async move { transfer.handle_download_request(ctx).await });
    into_response(pending).await
}

async fn into_response(pending: PendingResponse) -> Response<RelayBody> {
    let PendingResponse { head, body } = pending;
    let Ok(head) = head.await else {
        return status(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let chunks = stream::unfold(body, |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((Ok::<_, io::Error>(Frame::data(chunk)), rx))
    });
    let mut response = Response::new(StreamBody::new(chunks).boxed_unsync());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

fn static_response(reply: StaticReply) -> Response<RelayBody> {
    match reply {
        StaticReply::NotModified => status(StatusCode::NOT_MODIFIED),
        StaticReply::Page {
            content_type,
            body,
            last_modified,
        } => {
            let len = body.len();
            let mut response = Response::new(Full::new(body).map_err(|never| match never {}).boxed_unsync());
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            if let Ok(value) = HeaderValue::from_str(&last_modified) {
                headers.insert(LAST_MODIFIED, value);
            }
            response
        }
    }
}

fn status(code: StatusCode) -> Response<RelayBody> {
    let mut response = Response::new(Empty::new().map_err(|never| match never {}).boxed_unsync());
    *response.status_mut() = code;
    response
}

fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let has_token = |name: HeaderName, token: &str| {
        req.headers()
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    has_token(UPGRADE, "websocket") && has_token(CONNECTION, "upgrade")
}

/// Lowercases and strips separators a user may have typed around a code.
fn normalize_path(path: &str) -> String {
    path.trim_matches(['/', '\\', ' ']).to_ascii_lowercase()
}

fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
}

/// `abcde.relay.example` yields `abcde`; other host shapes yield nothing.
fn subdomain_label(host: &str) -> Option<String> {
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let labels: Vec<&str> = host.split('.').collect();
    (labels.len() == 3).then(|| labels[0].to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("ABCDE/"), "abcde");
        assert_eq!(normalize_path("\\ 9fakr "), "9fakr");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn subdomain_codes() {
        assert_eq!(subdomain_label("9fakr.relay.example").as_deref(), Some("9fakr"));
        assert_eq!(subdomain_label("9FAKR.relay.example:8080").as_deref(), Some("9fakr"));
        assert_eq!(subdomain_label("relay.example"), None);
        assert_eq!(subdomain_label("a.b.relay.example"), None);
        assert_eq!(subdomain_label("127.0.0.1:80"), None);
    }

    #[test]
    fn link_preview_agents() {
        assert!(LINK_PREVIEW.is_match("Slackbot-LinkExpanding 1.0"));
        assert!(LINK_PREVIEW.is_match("WhatsApp/2.23"));
        assert!(LINK_PREVIEW.is_match("TelegramBot (like TwitterBot)"));
        assert!(!LINK_PREVIEW.is_match("Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0"));
    }

    #[test]
    fn detects_websocket_upgrades() {
        let req = Request::builder()
            .header(UPGRADE, "WebSocket")
            .header(CONNECTION, "keep-alive, Upgrade")
            .body(())
            .unwrap();
        assert!(is_websocket_upgrade(&req));

        let req = Request::builder().header(UPGRADE, "h2c").body(()).unwrap();
        assert!(!is_websocket_upgrade(&req));
    }
}
