
#![forbid(unsafe_code)]

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod admin;
mod auth;
mod breaker;
mod cache;
mod config;
mod cost;
mod dispatch;
mod keys;
mod metrics;
mod pipeline;
mod ratelimit;
mod recorder;
mod server;
mod state;
mod storage;
mod store;
mod tokens;
mod transform;
mod util;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "Reverse proxy and API gateway for AI inference endpoints: auth, rate limiting, caching, transformation, cost accounting, load balancing")]
struct Cli {
    /// Path to YAML config (hot-reloaded on change)
    #[arg(long, default_value = "configs/config.yaml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let config = config::ConfigStore::load(&cli.config)?;
    config.watch()?;

    let cfg = config.get();
    let worker_threads = cfg.server.worker_threads.unwrap_or_else(num_cpus::get);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(worker_threads)
        .thread_name("relay-worker")
        .build()?;

    rt.block_on(async move {
        let addr = cfg.listen_addr()?;
        let state = Arc::new(state::AppState::new(config).await?);
        tracing::info!(%addr, "listening");
        server::serve_http(addr, state).await
    })
}
