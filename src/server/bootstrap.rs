use crate::config::BridgeConfig;
use crate::metrics::Metrics;
use crate::server::{self, BridgeState};
use crate::store::MemoryStore;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments and runtime facts forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
    /// Worker-pool size chosen before the runtime was built, and where it
    /// came from — detection runs pre-subscriber, so it is logged here.
    pub worker_threads: usize,
    pub cpu_source: &'static str,
}

/// Bridge lifecycle: init → import → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    tracing::info!(
        "runtime: worker pool sized, threads={}, source={}",
        args.worker_threads,
        args.cpu_source
    );

    // Phase 1: config + state. Key and token import happens inside
    // `BridgeState::new`, so the pools are populated before traffic.
    let config = BridgeConfig::load(&args.config_path)?;
    let metrics = Metrics::install();
    let store = Arc::new(MemoryStore::new());
    let state = BridgeState::new(config, store).await?.with_metrics(metrics);

    // Phase 2: background sweepers.
    state.sessions.start_gc();

    // Phase 3: admin + mcp servers.
    start_admin_server(&state, &args);
    tracing::info!(
        "server: starting bridge, listen={}, started_at={}",
        args.listen,
        humantime::format_rfc3339_seconds(std::time::SystemTime::now())
    );

    let shutdown = Arc::new(Notify::new());
    let mcp_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_mcp_server(&listen, state, shutdown).await }
    });

    // Phase 4: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    if let Err(e) = mcp_handle.await {
        tracing::error!("server: mcp task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_admin_server(state: &BridgeState, args: &BootstrapArgs) {
    let listen = args.admin_listen.clone();
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&listen, state).await {
            tracing::error!("server: admin failed: {}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("sigterm handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("server: received ctrl-c"),
            _ = sigterm.recv() => tracing::info!("server: received sigterm"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("server: received ctrl-c");
    }

    shutdown.notify_waiters();
}
