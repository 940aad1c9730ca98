use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use axum::{Router, http::StatusCode, routing::get};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;

pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,
    pub component: String,

    // Event source
    pub poll_cycles: Counter<u64>,
    pub events_captured: Counter<u64>,
    pub events_skipped: Counter<u64>,
    pub publish_failures: Counter<u64>,
    pub cursor_block: Gauge<u64>,
    pub chain_tip_block: Gauge<u64>,

    // RPC
    pub rpc_requests: Counter<u64>,
    pub rpc_errors: Counter<u64>,
    pub rpc_latency: Histogram<f64>,

    // Persister
    pub events_persisted: Counter<u64>,
    pub events_deduplicated: Counter<u64>,
    pub events_rejected: Counter<u64>,
    pub events_requeued: Counter<u64>,
    pub insert_latency: Histogram<f64>,
}

impl Metrics {
    pub fn new(component: &str) -> Result<Self, MetricError> {
        let registry = prometheus::Registry::new();

        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("userop_pipeline");

        let poll_cycles = meter
            .u64_counter("pipeline_poll_cycles")
            .with_description("Number of completed ledger poll cycles")
            .build();

        let events_captured = meter
            .u64_counter("pipeline_events_captured")
            .with_description("User operation events published to the relay")
            .build();

        let events_skipped = meter
            .u64_counter("pipeline_events_skipped")
            .with_description("Ledger logs skipped because they could not be decoded")
            .build();

        let publish_failures = meter
            .u64_counter("pipeline_publish_failures")
            .with_description("Failed publish attempts to the relay")
            .build();

        let cursor_block = meter
            .u64_gauge("pipeline_cursor_block_number")
            .with_description("Last block fully scanned and published")
            .build();

        let chain_tip_block = meter
            .u64_gauge("pipeline_chain_tip_block_number")
            .with_description("Latest block number reported by the ledger")
            .build();

        let rpc_requests = meter
            .u64_counter("pipeline_rpc_requests")
            .with_description("Number of RPC requests made")
            .build();

        let rpc_errors = meter
            .u64_counter("pipeline_rpc_errors")
            .with_description("Number of RPC errors encountered")
            .build();

        let rpc_latency = meter
            .f64_histogram("pipeline_rpc_latency")
            .with_description("RPC request latency")
            .with_boundaries(vec![
                0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 5.0, 10.0,
            ])
            .with_unit("s")
            .build();

        let events_persisted = meter
            .u64_counter("pipeline_events_persisted")
            .with_description("Rows inserted into raw_user_operations")
            .build();

        let events_deduplicated = meter
            .u64_counter("pipeline_events_deduplicated")
            .with_description("Redelivered events that already had a row")
            .build();

        let events_rejected = meter
            .u64_counter("pipeline_events_rejected")
            .with_description("Messages dropped as malformed or unstorable")
            .build();

        let events_requeued = meter
            .u64_counter("pipeline_events_requeued")
            .with_description("Messages returned to the queue after a storage failure")
            .build();

        let insert_latency = meter
            .f64_histogram("pipeline_insert_latency")
            .with_description("Latency of one insert transaction")
            .with_boundaries(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
            .with_unit("s")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            component: component.to_string(),
            poll_cycles,
            events_captured,
            events_skipped,
            publish_failures,
            cursor_block,
            chain_tip_block,
            rpc_requests,
            rpc_errors,
            rpc_latency,
            events_persisted,
            events_deduplicated,
            events_rejected,
            events_requeued,
            insert_latency,
        })
    }

    pub fn labels(&self) -> [KeyValue; 1] {
        [KeyValue::new("component", self.component.clone())]
    }

    pub fn rpc_labels(&self, method: &'static str) -> [KeyValue; 2] {
        [
            KeyValue::new("component", self.component.clone()),
            KeyValue::new("method", method),
        ]
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}")
            .parse::<SocketAddr>()
            .context("invalid metrics address")?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Only used for logging
        let access_url = if addr.ip().is_unspecified() {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics server to {addr}"))?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        });

        Ok(())
    }
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_export() {
        let metrics = Metrics::new("listener").unwrap();
        metrics.events_captured.add(2, &metrics.labels());
        metrics
            .rpc_requests
            .add(1, &metrics.rpc_labels("eth_getLogs"));
        assert_eq!(metrics.labels()[0].value.as_str(), "listener");
    }
}
