mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::BridgeState;

use crate::mcp::{self, McpHttpRequest};
use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Run the MCP server with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight requests to complete before
/// forcibly dropping them.
pub async fn run_mcp_server(
    listen: &str,
    state: BridgeState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: mcp listening, addr={}", addr);

    // Atomic counter for reading active connection count (metrics crate gauges are write-only).
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: mcp: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "bridge_connections_total",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: mcp: accept failed, error={}", e);
                metrics::counter!(
                    "bridge_connections_total",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("bridge_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                async move { serve_mcp(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: mcp: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("bridge_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for all in-flight connections to finish (or timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!(
            "server: mcp: waiting for {} active connections to drain",
            active
        );
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: mcp: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: mcp: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Lower one hyper request into the transport-agnostic handler and lift the
/// reply back, echoing the session header when one was minted.
async fn serve_mcp(
    req: Request<Incoming>,
    state: BridgeState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let authorization = header("authorization");
    let session_id = header("mcp-session-id");
    let accept = header("accept");
    let mode_override = header("x-search-source-mode");

    let body = req.into_body().collect().await?.to_bytes();

    let reply = mcp::handle_http(
        &state,
        McpHttpRequest {
            method,
            authorization,
            session_id,
            accept,
            mode_override,
            body,
        },
    )
    .await;

    let mut builder = Response::builder()
        .status(reply.status)
        .header("content-type", reply.content_type);
    if let Some(session) = &reply.session_id {
        builder = builder.header("mcp-session-id", session);
    }
    Ok(builder
        .body(full_body(reply.body))
        .expect("static response parts are valid"))
}

/// Run a simple admin server for health/readiness checks, metrics, and the
/// selection-strategy hook.
pub async fn run_admin_server(listen: &str, state: BridgeState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
