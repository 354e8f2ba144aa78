//! # Stage: HTTP Server
//!
//! ## Responsibility
//! Accept TCP connections, read one request per connection, run it through
//! [`App::handle`] and write the response back, then close.
//!
//! ## Guarantees
//! - Bounded: the request head is capped at `max_header_bytes` (431 beyond),
//!   its arrival at `read_header_timeout`, the handler at `handler_timeout`
//!   (504 on expiry) and the response write at `write_timeout`.
//! - Graceful: on shutdown the listener closes first, in-flight connections
//!   get `shutdown_timeout` to finish, stragglers are aborted.
//! - One `http request` log event per answered request.
//!
//! ## NOT Responsible For
//! - Keep-alive, pipelining or request bodies
//! - TLS (terminate at a proxy)

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::StartupError;
use crate::http::{read_request, HeadError, Request, Response};
use crate::routes::App;

/// Back-off after a failed `accept` (e.g. file-descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A bound listener plus the application it serves.
pub struct Server {
    listener: TcpListener,
    app: Arc<App>,
}

impl Server {
    /// Bind `app.config().bind_addr()`.
    pub async fn bind(app: App) -> std::io::Result<Self> {
        let listener = TcpListener::bind(app.config().bind_addr()).await?;
        Ok(Self {
            listener,
            app: Arc::new(app),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then drain in-flight connections.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server { listener, app } = self;
        let drain_timeout = app.config().shutdown_timeout;
        info!(addr = %listener.local_addr()?, "listening");

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(Arc::clone(&app), stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(in_flight = connections.len(), "shutting down");
        drop(listener);

        let drained = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "shutdown timeout reached; aborting connections"
            );
            connections.abort_all();
        }

        info!("stopped");
        Ok(())
    }
}

async fn serve_connection(app: Arc<App>, mut stream: TcpStream, peer: SocketAddr) {
    let cfg = app.config();
    let started = Instant::now();

    let head = tokio::time::timeout(
        cfg.read_header_timeout,
        read_request(&mut stream, cfg.max_header_bytes, peer.ip()),
    )
    .await;

    let (req, resp) = match head {
        Ok(Ok(req)) => {
            let resp = match tokio::time::timeout(cfg.handler_timeout, app.handle(&req)).await {
                Ok(resp) => resp,
                Err(_) => {
                    warn!(url = %req.target(), timeout = ?cfg.handler_timeout, "handler timed out");
                    app.gateway_timeout(&req)
                }
            };
            (req, resp)
        }
        Ok(Err(HeadError::TooLarge)) => {
            let req = Request::new("-", "-", peer.ip());
            let resp = app.finish(&req, Response::error(431, "request header fields too large"));
            (req, resp)
        }
        Ok(Err(HeadError::Malformed(detail))) => {
            debug!(%peer, %detail, "malformed request");
            let req = Request::new("-", "-", peer.ip());
            let resp = app.finish(&req, Response::error(400, "malformed request"));
            (req, resp)
        }
        Ok(Err(HeadError::Closed)) => return,
        Ok(Err(HeadError::Io(e))) => {
            debug!(%peer, error = %e, "read failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "request header timeout");
            return;
        }
    };

    let wire = resp.to_bytes();
    let written = tokio::time::timeout(cfg.write_timeout, async {
        stream.write_all(&wire).await?;
        stream.shutdown().await
    })
    .await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%peer, error = %e, "write failed"),
        Err(_) => debug!(%peer, "write timed out"),
    }

    info!(
        method = %req.method,
        url = %req.target(),
        status = resp.status,
        duration_us = started.elapsed().as_micros() as u64,
        request_id = resp.header("X-Request-Id").unwrap_or("-"),
        "http request"
    );
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Connect the stats backend, bind, and serve until a shutdown signal.
pub async fn serve(config: Config) -> Result<(), StartupError> {
    let stats = crate::stats::connect(&config).await?;
    let server = Server::bind(App::new(config, stats)).await?;
    server.run_until(shutdown_signal()).await?;
    Ok(())
}
