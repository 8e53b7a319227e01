//! Purpose: Run the HTTP and binary RPC transports over one shared `Api`.
//! Exports: `ServeConfig`, `Gateway`, `serve`, `init_tracing`, `http`, `rpc`.
//! Role: Entry point used by `framegate serve` and by in-process tests.
//! Invariants: Both listeners stop on the same shutdown token; shutdown waits at most
//! `SHUTDOWN_GRACE` for in-flight requests.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::Api;
use crate::backends::{IoContext, READ_CHANNEL_CAPACITY};
use crate::config::Config;
use crate::core::codec::{ErrorPayload, Message, encode_frame};
use crate::core::error::{Error, ErrorKind};
use crate::core::request::ReadRequest;

pub mod http;
pub mod rpc;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_RPC_ADDR: &str = "127.0.0.1:8081";
pub const DEFAULT_MAX_BODY_BYTES: usize = 512 * 1024 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub http: Option<SocketAddr>,
    pub rpc: Option<SocketAddr>,
    pub max_body_bytes: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            http: DEFAULT_HTTP_ADDR.parse().ok(),
            rpc: DEFAULT_RPC_ADDR.parse().ok(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Runs until SIGINT/SIGTERM, then drains both transports.
pub async fn serve(config: Config, serve: ServeConfig) -> Result<(), Error> {
    init_tracing(&config.log.level);
    let api = Arc::new(Api::new(Arc::new(config), IoContext::default())?);
    info!(instance = api.instance(), "starting gateway");
    let gateway = Gateway::start(api, &serve).await?;

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested");
        }
        _ = gateway.shutdown.cancelled() => {}
    }
    gateway.stop().await
}

pub fn init_tracing(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Running transports bound to concrete addresses.
pub struct Gateway {
    pub http_addr: Option<SocketAddr>,
    pub rpc_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<Result<(), Error>>>,
}

impl Gateway {
    pub async fn start(api: Arc<Api>, config: &ServeConfig) -> Result<Gateway, Error> {
        if config.http.is_none() && config.rpc.is_none() {
            return Err(Error::new(ErrorKind::BadRequest)
                .with_message("no listener configured")
                .with_hint("Pass --http and/or --rpc."));
        }
        let shutdown = CancellationToken::new();
        let mut gateway = Gateway {
            http_addr: None,
            rpc_addr: None,
            shutdown: shutdown.clone(),
            tasks: Vec::new(),
        };
        if let Some(addr) = config.http {
            let listener = bind(addr).await?;
            gateway.http_addr = Some(local_addr(&listener)?);
            info!(addr = %gateway.http_addr.unwrap_or(addr), "http listening");
            let app = http::router(api.clone(), config.max_body_bytes);
            gateway
                .tasks
                .push(tokio::spawn(http::run(listener, app, shutdown.clone())));
        }
        if let Some(addr) = config.rpc {
            let listener = bind(addr).await?;
            gateway.rpc_addr = Some(local_addr(&listener)?);
            info!(addr = %gateway.rpc_addr.unwrap_or(addr), "rpc listening");
            gateway
                .tasks
                .push(tokio::spawn(rpc::run(listener, api, shutdown.clone())));
        }
        Ok(gateway)
    }

    /// Signals both transports and waits for them to drain.
    pub async fn stop(self) -> Result<(), Error> {
        self.shutdown.cancel();
        let drained = async {
            for task in self.tasks {
                match task.await {
                    Ok(result) => result?,
                    Err(err) => {
                        return Err(Error::new(ErrorKind::Internal)
                            .with_message("server task failed")
                            .with_source(err));
                    }
                }
            }
            Ok(())
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, drained).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::Timeout).with_message("server shutdown timed out")),
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(addr).await.map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message(format!("failed to bind {addr}"))
            .with_source(err)
    })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, Error> {
    listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to read listener address")
            .with_source(err)
    })
}

/// Runs a read and yields `FrameChunk` messages, then a single `Error` message if the
/// read failed. Dropping the receiver cancels the backend read.
pub(crate) fn spawn_read(api: Arc<Api>, request: ReadRequest) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let (frames_tx, mut frames_rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let reading = {
            let cancel = cancel.clone();
            tokio::spawn(async move { api.read(request, frames_tx, cancel).await })
        };
        while let Some(frame) = frames_rx.recv().await {
            if tx.send(Message::FrameChunk(encode_frame(&frame))).await.is_err() {
                cancel.cancel();
                break;
            }
        }
        drop(frames_rx);
        let outcome = match reading.await {
            Ok(outcome) => outcome,
            Err(err) => Err(Error::new(ErrorKind::Internal)
                .with_message("read task failed")
                .with_source(err)),
        };
        if let Err(err) = outcome {
            let _ = tx.send(Message::Error(ErrorPayload::from(&err))).await;
        }
    });
    rx
}
