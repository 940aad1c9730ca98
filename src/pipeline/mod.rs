//! Process lifecycle for the two daemons: warm-up, dependency connection with backoff,
//! the core loop, and draining on SIGINT/SIGTERM.

pub mod lifecycle;

use alloy_provider::ProviderBuilder;
use alloy_rpc_client::RpcClient;
use alloy_transport_http::Http;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::listener::rpc::{LedgerClient, RpcLedger};
use crate::listener::{EventSource, SourceSettings};
use crate::metrics::Metrics;
use crate::models::common::{ListenerConfig, MetricsConfig, PersisterConfig};
use crate::persister::Persister;
use crate::pipeline::lifecycle::{Lifecycle, PipelineState};
use crate::relay::RelayPublisher;
use crate::relay::amqp::{AmqpConsumer, AmqpPublisher};
use crate::storage::EventStore;
use crate::storage::postgres::PgStore;
use crate::utils::retry::{RetryConfig, retry};

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
                info!("Received Ctrl+C signal, initiating shutdown...");
            }
            _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
        }
        shutdown.cancel();
    });
}

/// Waits out the startup delay. Returns `false` if shutdown arrived first.
pub async fn warm_up(delay: Duration, shutdown: &CancellationToken) -> bool {
    if delay.is_zero() {
        return true;
    }
    info!("Waiting {}s for dependencies to come up...", delay.as_secs());
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

async fn start_metrics(config: &MetricsConfig, component: &str) -> Result<Option<Arc<Metrics>>> {
    if !config.enabled {
        info!("Metrics are disabled");
        return Ok(None);
    }
    let metrics = Arc::new(Metrics::new(component)?);
    metrics
        .start_metrics_server(&config.address, config.port)
        .await?;
    Ok(Some(metrics))
}

/// Runs `connect` unless shutdown arrives first, in which case `None` is returned.
async fn until_shutdown<T>(
    shutdown: &CancellationToken,
    connect: impl Future<Output = Result<T>>,
) -> Result<Option<T>> {
    tokio::select! {
        _ = shutdown.cancelled() => Ok(None),
        result = connect => result.map(Some),
    }
}

fn stop(lifecycle: &mut Lifecycle) -> Result<()> {
    lifecycle.drain()?;
    lifecycle.transition(PipelineState::Stopped)?;
    Ok(())
}

pub async fn run_listener(config: ListenerConfig, shutdown: CancellationToken) -> Result<()> {
    let mut lifecycle = Lifecycle::new("listener");
    let metrics = start_metrics(&config.metrics, "listener").await?;

    lifecycle.transition(PipelineState::WaitingForDependencies)?;
    if !warm_up(config.startup_delay, &shutdown).await {
        return stop(&mut lifecycle);
    }

    let startup = RetryConfig::default();
    let contract = config.entry_point_address;

    let dependencies = until_shutdown(&shutdown, async {
        info!("RPC URL: {}", config.rpc_url);
        let http = reqwest::Client::builder()
            .timeout(config.rpc_timeout)
            .build()
            .context("failed to build HTTP client")?;
        let client = RpcClient::new(Http::with_client(http, config.rpc_url.clone()), false);
        let provider = ProviderBuilder::new().connect_client(client);
        let ledger = RpcLedger::new(provider, contract, metrics.clone());

        let chain_id = retry(|| ledger.chain_id(), &startup, "eth_chainId").await?;
        info!("Chain ID: {}", chain_id);

        let deployed = retry(|| ledger.contract_deployed(), &startup, "eth_getCode").await?;
        if !deployed {
            return Err(anyhow!(
                "no contract code at ENTRY_POINT_ADDRESS {} on chain {}",
                contract,
                chain_id
            ));
        }

        let store = retry(|| PgStore::connect(&config.storage), &startup, "postgres_connect").await?;
        retry(|| store.ensure_schema(), &startup, "ensure_schema").await?;

        let publisher = retry(|| AmqpPublisher::connect(&config.relay), &startup, "amqp_connect").await?;

        Ok::<_, anyhow::Error>((ledger, store, publisher))
    })
    .await?;

    let Some((ledger, store, publisher)) = dependencies else {
        return stop(&mut lifecycle);
    };

    let settings = SourceSettings::from_config(&config);
    let source = EventSource::new(ledger, publisher, store, settings, metrics);

    lifecycle.transition(PipelineState::Running)?;
    println!();
    info!("========================= STARTING LISTENER ========================");

    let result = source.run(&shutdown).await;
    if let Err(e) = &result {
        error!("Listener stopped with error: {:#}", e);
    }

    lifecycle.drain()?;
    close_listener(source).await;
    stop(&mut lifecycle)?;
    result
}

async fn close_listener<L: LedgerClient>(source: EventSource<L, AmqpPublisher, PgStore>) {
    let (publisher, store) = source.into_parts();
    if let Err(e) = publisher.close().await {
        warn!("Error closing relay publisher: {}", e);
    }
    store.close().await;
}

pub async fn run_persister(config: PersisterConfig, shutdown: CancellationToken) -> Result<()> {
    let mut lifecycle = Lifecycle::new("persister");
    let metrics = start_metrics(&config.metrics, "persister").await?;

    lifecycle.transition(PipelineState::WaitingForDependencies)?;
    if !warm_up(config.startup_delay, &shutdown).await {
        return stop(&mut lifecycle);
    }

    let startup = RetryConfig::default();

    let dependencies = until_shutdown(&shutdown, async {
        let store = retry(|| PgStore::connect(&config.storage), &startup, "postgres_connect").await?;
        retry(|| store.ensure_schema(), &startup, "ensure_schema").await?;

        if let Some(path) = &config.bundlers_csv {
            store
                .load_bundlers(path)
                .await
                .with_context(|| format!("failed to import bundlers from {}", path.display()))?;
        }

        let consumer = retry(|| AmqpConsumer::connect(&config.relay), &startup, "amqp_connect").await?;

        Ok::<_, anyhow::Error>((store, consumer))
    })
    .await?;

    let Some((store, consumer)) = dependencies else {
        return stop(&mut lifecycle);
    };

    let mut persister = Persister::new(store, consumer, metrics);

    lifecycle.transition(PipelineState::Running)?;
    println!();
    info!("======================== STARTING PERSISTER ========================");

    let result = persister.run(&shutdown).await;
    if let Err(e) = &result {
        error!("Persister stopped with error: {:#}", e);
    }

    lifecycle.drain()?;
    persister.close().await;
    stop(&mut lifecycle)?;
    result
}
