//! WebSocket audio-to-face inference server binary.

use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use a2f_server::config::ServerConfig;
use a2f_server::server::Server;
use a2f_server::session::pool::SessionPool;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = ServerConfig::parse();
    if let Err(err) = run(&config) {
        eprintln!("Fatal error: {err:#}");
        process::exit(1);
    }
}

fn run(config: &ServerConfig) -> Result<()> {
    info!("starting inference server on ws://{}:{}", config.host, config.port);
    info!(model = %config.model_json_path, diffusion = config.diffusion, "model");
    info!(max_sessions = config.max_sessions, "initializing session pool");

    let pool = SessionPool::init(config)?;
    let server = Server::bind(config, pool)?;

    let shutdown = server.shutdown_flag();
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown)?;

    info!("listening on ws://{}:{}", config.host, config.port);
    server.run()
}
