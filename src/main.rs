#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use hive::api;
use hive::cli::Cli;
use hive::config::RuntimeConfig;
use hive::domains::agent::OpencodeRuntime;
use hive::domains::templates::Registry;
use hive::engine::Engine;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LOG_LEVEL", "info"))
        .init();

    let config = RuntimeConfig::from_env(cli.bind, cli.data_dir, cli.config.clone())?;
    let registry = if config.registry_path.exists() {
        Registry::load(&config.registry_path)?
    } else {
        warn!(
            "Registry file {} not found; starting with no workspaces or templates",
            config.registry_path.display()
        );
        Registry::default()
    };

    let agent = Arc::new(OpencodeRuntime::new(config.clone()));
    let engine = Engine::new(config.clone(), registry, agent)?;

    // Pick up interrupted provisioning and deletion runs from a previous
    // process before accepting traffic.
    engine.resume_interrupted().await?;

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!("hive listening on http://{}", config.bind);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {e}");
                        continue;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        api::handle_request(req, engine.clone())
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Connection from {remote} ended: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
