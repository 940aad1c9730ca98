use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use userop_pipeline::pipeline::{run_persister, spawn_signal_handler};
use userop_pipeline::utils::{init_tracing, load_persister_config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    println!();
    info!("=========================== INITIALIZING ===========================");

    let config = match load_persister_config() {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(anyhow!(e));
        }
    };

    info!("Consuming from queue `{}`", config.relay.queue);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    run_persister(config, shutdown).await
}
