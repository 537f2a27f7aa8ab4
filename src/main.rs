#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tavily_bridge::server;

#[derive(Parser)]
#[command(name = "tavily-bridge", about = "Multi-provider MCP search bridge")]
struct Cli {
    /// Path to bridge config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// MCP listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (for health/metrics/strategy)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (worker_threads, cpu_source) = server::runtime::worker_threads();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
        worker_threads,
        cpu_source,
    }))
}
