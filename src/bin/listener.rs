use anyhow::{Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use userop_pipeline::pipeline::{run_listener, spawn_signal_handler};
use userop_pipeline::utils::{init_tracing, load_listener_config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    println!();
    info!("=========================== INITIALIZING ===========================");

    // Configuration errors are fatal before any connection is attempted
    let config = match load_listener_config() {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(anyhow!(e));
        }
    };

    info!(
        "Watching EntryPoint {} every {}ms (max range {}, tip buffer {})",
        config.entry_point_address,
        config.poll_interval.as_millis(),
        config.max_block_range,
        config.chain_tip_buffer
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    run_listener(config, shutdown).await
}
