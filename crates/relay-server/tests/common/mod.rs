//! Relay test utilities.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use webrelay_server::{ListenOutcome, ListenPrefix, RelayError, RelayRouter, RouterConfig};
use webrelay_transfer::TransferEvent;

/// A relay listening on an ephemeral loopback port.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestRelay {
    pub router: Arc<RelayRouter>,
    pub addr: SocketAddr,
    pub base_path: String,
    stop: Option<oneshot::Sender<ListenOutcome>>,
    task: JoinHandle<Result<ListenOutcome, RelayError>>,
}

#[allow(dead_code)]
impl TestRelay {
    pub async fn start() -> Self {
        Self::with_config(RouterConfig::default()).await
    }

    pub async fn with_config(config: RouterConfig) -> Self {
        Self::with_prefix(config, "http://127.0.0.1:0/").await
    }

    pub async fn with_prefix(config: RouterConfig, prefix: &str) -> Self {
        let prefix: ListenPrefix = prefix.parse().expect("valid prefix");
        let listener = RelayRouter::bind(&prefix).await.expect("bind relay");
        let addr = listener.local_addr().expect("local addr");
        let base_path = prefix.base_path.clone();
        let router = RelayRouter::new(config);

        let (stop, stopped) = oneshot::channel();
        let serving = Arc::clone(&router);
        let task = tokio::spawn(async move {
            serving
                .serve(listener, prefix, 4, async move {
                    stopped.await.unwrap_or(ListenOutcome::Canceled)
                })
                .await
        });

        Self {
            router,
            addr,
            base_path,
            stop: Some(stop),
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}{}", self.addr, self.base_path, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, self.base_path)
    }

    pub async fn stop(mut self, outcome: ListenOutcome) -> Result<ListenOutcome, RelayError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(outcome);
        }
        (&mut self.task).await.expect("relay task panicked")
    }
}

/// HTTP client that never reuses connections or follows redirects.
#[allow(dead_code)]
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("build client")
}

/// Waits for `expected`, skipping anything else. Panics after 10 s.
#[allow(dead_code)]
pub async fn wait_for(events: &mut broadcast::Receiver<TransferEvent>, expected: TransferEvent) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if event == expected => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    assert_eq!(found, Ok(true), "never saw {expected:?}");
}

/// Collects events until the first terminal one, or until 10 s pass.
#[allow(dead_code)]
pub async fn events_until_terminal(
    events: &mut broadcast::Receiver<TransferEvent>,
) -> Vec<TransferEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        while let Ok(event) = events.recv().await {
            seen.push(event);
            if event.is_terminal() {
                break;
            }
        }
    })
    .await;
    seen
}

/// Deterministic test payload.
#[allow(dead_code)]
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
