//! WebRelay command-line producer.
//!
//! Shares a file (or stdin) through a one-off download link, either by
//! listening locally or by tunneling through a relay. `--serve` runs a
//! relay that other instances can tunnel through.

mod config;
mod status;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use webrelay_client::BridgedUploadClient;
use webrelay_server::{ListenOutcome, ListenPrefix, RelayError, RelayRouter, RouterConfig};
use webrelay_transfer::{LocalTransfer, Source, Transfer, TransferEvent, TransferMeta};

use config::RelayConfig;
use status::StatusLine;

/// How long to wait for a tunnel to close after the transfer ended.
const TUNNEL_CLOSE_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(
    name = "webrelay",
    version,
    about = "Share a file or a pipe through a one-off download link",
    after_help = "Examples:\n  webrelay input.dat\n  cat log.txt | webrelay -c text/plain log.txt\n  webrelay -r ws://relay.example input.dat\n  webrelay --serve -l http://*:8080/"
)]
struct Cli {
    /// File to share. When piping, names the stream instead.
    input: Option<PathBuf>,

    /// Where to listen, e.g. http://*:80/
    #[arg(short, long)]
    listen_prefix: Option<String>,

    /// Relay to tunnel through instead of listening here, e.g. ws://relay.example
    #[arg(short, long)]
    remote_host: Option<String>,

    /// Name for the Content-Disposition header; inline when blank.
    #[arg(short, long)]
    filename: Option<String>,

    /// Value for the Content-Type header.
    #[arg(short, long)]
    content_type: Option<String>,

    /// Concurrent accepts kept pending by the listener.
    #[arg(short, long)]
    max_connections: Option<usize>,

    /// Only serve the first downloader's address.
    #[arg(long)]
    pin_downloader_host: bool,

    /// Run a relay with the landing page and tunnels enabled.
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,webrelay=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::load().unwrap_or_default();

    let prefix = ListenPrefix::parse(cli.listen_prefix.as_deref().unwrap_or(&config.listen_prefix))?;
    let max_connections = cli.max_connections.unwrap_or(config.max_connections).max(1);
    let pin_downloader_host = cli.pin_downloader_host || config.pin_downloader_host;

    if cli.serve {
        let router = RelayRouter::new(RouterConfig {
            pin_downloader_host,
            ..RouterConfig::default()
        });
        return serve(router, prefix, max_connections, &config.hostname).await;
    }

    let Some((source, name)) = open_input(&cli).await? else {
        println!("try --help for examples");
        return Ok(());
    };
    let meta = TransferMeta::new(cli.filename.clone().or(name), cli.content_type.clone());

    let remote_host = cli.remote_host.clone().or(config.remote_host.clone());
    let (share, link_base) = match remote_host {
        Some(remote) => {
            let (ws_url, http_url) = remote_urls(&remote);
            (Share::tunnel(&ws_url, source, &meta).await?, http_url)
        }
        None => match RelayRouter::bind(&prefix).await {
            Ok(listener) => {
                let router = RelayRouter::new(RouterConfig {
                    pin_downloader_host,
                    ..RouterConfig::host()
                });
                let share = Share::local(router, listener, prefix.clone(), max_connections, source, meta);
                (share, prefix.url_base(&config.hostname))
            }
            // Something already listens there; assume it is a relay.
            Err(RelayError::Bind { source: err, .. })
                if err.kind() == std::io::ErrorKind::AddrInUse =>
            {
                let share = Share::tunnel(&prefix.ws_url("127.0.0.1"), source, &meta)
                    .await
                    .with_context(|| {
                        format!(
                            "another process is already listening on {prefix}; try a different port"
                        )
                    })?;
                (share, prefix.url_base(&config.hostname))
            }
            Err(e) => return Err(e.into()),
        },
    };

    println!(
        "Download link: {}/{}",
        link_base.trim_end_matches('/'),
        share.code()
    );
    println!("Press CTRL+C to cancel");
    println!();

    share.run().await
}

/// Picks the byte source: the named file, or stdin when piped.
async fn open_input(cli: &Cli) -> anyhow::Result<Option<(Source, Option<String>)>> {
    match &cli.input {
        Some(path) if path.is_file() => {
            let source = Source::file(path)
                .await
                .with_context(|| format!("cannot open {}", path.display()))?;
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
            Ok(Some((source, name)))
        }
        input if !std::io::stdin().is_terminal() => {
            let name = input.as_ref().map(|p| p.to_string_lossy().into_owned());
            Ok(Some((Source::stdin(), name)))
        }
        Some(path) => anyhow::bail!("{} is not a file", path.display()),
        None => Ok(None),
    }
}

/// Splits a remote relay into its tunnel URL and its public base URL.
fn remote_urls(remote: &str) -> (String, String) {
    let remote = remote.trim().trim_end_matches('/');
    let host = remote
        .strip_prefix("ws://")
        .or_else(|| remote.strip_prefix("http://"))
        .unwrap_or(remote);
    (format!("ws://{host}/"), format!("http://{host}"))
}

async fn serve(
    router: Arc<RelayRouter>,
    prefix: ListenPrefix,
    max_connections: usize,
    hostname: &str,
) -> anyhow::Result<()> {
    let mut bridges = router.subscribe_bridges();
    tokio::spawn(async move {
        loop {
            match bridges.recv().await {
                Ok(bridge) => tracing::info!(
                    code = %bridge.code,
                    filename = ?bridge.filename,
                    filesize = ?bridge.filesize,
                    "tunnel registered"
                ),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    println!("Relaying at {}", prefix.url_base(hostname));
    let outcome = router
        .listen(prefix, max_connections, async {
            let _ = tokio::signal::ctrl_c().await;
            ListenOutcome::Canceled
        })
        .await?;
    tracing::info!(?outcome, "relay stopped");
    Ok(())
}

/// A transfer being offered, either served here or tunneled.
enum Share {
    Local {
        transfer: Arc<LocalTransfer>,
        code: String,
        stop: oneshot::Sender<ListenOutcome>,
        serving: JoinHandle<Result<ListenOutcome, RelayError>>,
    },
    Tunnel {
        client: BridgedUploadClient,
        code: String,
    },
}

impl Share {
    fn local(
        router: Arc<RelayRouter>,
        listener: tokio::net::TcpListener,
        prefix: ListenPrefix,
        max_connections: usize,
        source: Source,
        meta: TransferMeta,
    ) -> Self {
        let transfer = Arc::new(LocalTransfer::new(source, meta));
        let code = router.register(transfer.clone()).to_string();
        let (stop, stopped) = oneshot::channel();
        let serving = tokio::spawn(async move {
            router
                .serve(listener, prefix, max_connections, async move {
                    stopped.await.unwrap_or(ListenOutcome::Canceled)
                })
                .await
        });
        Self::Local {
            transfer,
            code,
            stop,
            serving,
        }
    }

    async fn tunnel(url: &str, source: Source, meta: &TransferMeta) -> anyhow::Result<Self> {
        let client = BridgedUploadClient::new();
        let code = client
            .connect(url, source, meta.filename.as_deref(), meta.mimetype.as_deref())
            .await
            .with_context(|| format!("cannot open a tunnel to {url}"))?
            .to_string();
        Ok(Self::Tunnel { client, code })
    }

    fn code(&self) -> &str {
        match self {
            Self::Local { code, .. } | Self::Tunnel { code, .. } => code,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        match self {
            Self::Local { transfer, .. } => transfer.events().subscribe(),
            Self::Tunnel { client, .. } => client.subscribe(),
        }
    }

    /// Shows status until the transfer ends or Ctrl-C is pressed.
    async fn run(self) -> anyhow::Result<()> {
        let mut status = StatusLine::new();
        let mut events = self.subscribe();
        status.show("waiting for connection..");

        let (mut serving, stop) = match self {
            Self::Local {
                transfer,
                stop,
                serving,
                ..
            } => (Some(serving), Ending::Local { transfer, stop }),
            Self::Tunnel { client, .. } => (None, Ending::Tunnel(client)),
        };

        let completed = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    stop.cancel().await;
                    break false;
                }
                event = events.recv() => match event {
                    Ok(TransferEvent::Start) => status.show("download starting.."),
                    Ok(TransferEvent::Progress { downloaded, total }) => status.progress(downloaded, total),
                    Ok(TransferEvent::Disconnect) => status.show("disconnected, waiting for resume.."),
                    Ok(TransferEvent::Complete) => {
                        status.show("download complete");
                        break true;
                    }
                    Ok(TransferEvent::Cancel) => {
                        status.show("canceled");
                        break false;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break false,
                },
                result = async {
                    match serving.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    status.finish("error");
                    let outcome = result.context("relay task failed")??;
                    anyhow::bail!("relay stopped unexpectedly ({outcome:?})");
                }
            }
        };

        stop.finish(completed, serving).await?;
        status.finish(if completed {
            "completed successfully"
        } else {
            "canceled"
        });
        Ok(())
    }
}

/// What is left to wind down once the status loop ends.
enum Ending {
    Local {
        transfer: Arc<LocalTransfer>,
        stop: oneshot::Sender<ListenOutcome>,
    },
    Tunnel(BridgedUploadClient),
}

impl Ending {
    async fn cancel(&self) {
        match self {
            Self::Local { transfer, .. } => transfer.cancel(),
            Self::Tunnel(client) => client.cancel().await,
        }
    }

    async fn finish(
        self,
        completed: bool,
        serving: Option<JoinHandle<Result<ListenOutcome, RelayError>>>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Local { stop, .. } => {
                let outcome = if completed {
                    ListenOutcome::Stopped
                } else {
                    ListenOutcome::Canceled
                };
                let _ = stop.send(outcome);
                if let Some(serving) = serving {
                    serving.await.context("relay task failed")??;
                }
            }
            Self::Tunnel(client) => {
                let _ = tokio::time::timeout(TUNNEL_CLOSE_WAIT, client.finished()).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_host_forms() {
        assert_eq!(
            remote_urls("ws://relay.example"),
            ("ws://relay.example/".into(), "http://relay.example".into())
        );
        assert_eq!(
            remote_urls("relay.example:8080/"),
            ("ws://relay.example:8080/".into(), "http://relay.example:8080".into())
        );
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::parse_from(["webrelay", "-r", "ws://relay.example", "-c", "text/plain", "a.txt"]);
        assert_eq!(cli.remote_host.as_deref(), Some("ws://relay.example"));
        assert_eq!(cli.content_type.as_deref(), Some("text/plain"));
        assert_eq!(cli.input, Some(PathBuf::from("a.txt")));
        assert!(!cli.serve);
    }
}
