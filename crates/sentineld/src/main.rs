use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod adaptive;
mod audit;
mod authenticator;
mod blacklist;
mod config;
mod engine;
mod enrollment;
mod gallery;
mod npy;
mod rpc;
mod service;

use config::Config;
use engine::spawn_engine;
use service::SentinelService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("sentineld starting");

    // 1. Load the configuration snapshot
    let config = Arc::new(Config::from_env());
    tracing::info!(
        socket = %config.socket_path.display(),
        state_dir = %config.state_dir.display(),
        model_dir = %config.model_dir.display(),
        "configuration loaded"
    );

    // 2. Spawn the engine thread (opens stores fail-fast; models load on
    //    first initialize)
    let engine = spawn_engine(Arc::clone(&config))?;

    // 3. Warm models in the background so the first client does not pay
    //    the load time
    let warmup = engine.clone();
    tokio::spawn(async move {
        match warmup.initialize().await {
            Ok(_) => tracing::info!("model warmup complete"),
            Err(e) => tracing::error!(error = %e, "model warmup failed"),
        }
    });

    // 4. Serve the control socket until shutdown
    let service = Arc::new(SentinelService::new(Arc::clone(&config), engine));
    let socket_path = config.socket_path.clone();

    tokio::select! {
        result = rpc::serve(&socket_path, service) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("sentineld shutting down");
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
