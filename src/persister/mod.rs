use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::models::events::{EventRecord, hex_string};
use crate::relay::{Delivery, RelayConsumer};
use crate::storage::{EventStore, InsertOutcome};
use crate::utils::retry::{RetryConfig, jittered};

/// How a delivery was settled with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Stored { observed_at: DateTime<Utc> },
    Duplicate,
    Rejected,
    Requeued,
}

pub struct Persister<S, C> {
    store: S,
    consumer: C,
    /// Backoff applied before handing a message back after a transient storage failure,
    /// and between attempts to re-establish a lost relay session.
    backoff: RetryConfig,
    consecutive_failures: u32,
    metrics: Option<Arc<Metrics>>,
}

impl<S, C> Persister<S, C>
where
    S: EventStore,
    C: RelayConsumer,
{
    pub fn new(store: S, consumer: C, metrics: Option<Arc<Metrics>>) -> Self {
        Self::with_backoff(store, consumer, RetryConfig::default(), metrics)
    }

    pub fn with_backoff(
        store: S,
        consumer: C,
        backoff: RetryConfig,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            store,
            consumer,
            backoff,
            consecutive_failures: 0,
            metrics,
        }
    }

    /// Consumes until `shutdown` is cancelled. A relay session that cannot be
    /// re-established within the backoff budget is an error.
    pub async fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        while self.process_next(shutdown).await?.is_some() {}
        info!("Shutting down consumer loop...");
        Ok(())
    }

    /// Waits for one delivery and settles it. `None` once shutdown is requested.
    ///
    /// A lost relay session is replaced transparently. A delivery that was in flight when
    /// the session dropped comes back from the broker and is settled on the new session.
    pub async fn process_next(&mut self, shutdown: &CancellationToken) -> Result<Option<Settlement>> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            let received = tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                received = self.consumer.recv() => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    warn!("Relay channel closed by the broker, reconnecting");
                    self.reconnect(shutdown).await?;
                    continue;
                }
                Err(e) => {
                    warn!("Relay consumer failed: {}. Reconnecting", e);
                    self.reconnect(shutdown).await?;
                    continue;
                }
            };

            match self.handle(delivery, shutdown).await {
                Ok(settlement) => return Ok(Some(settlement)),
                Err(e) => {
                    warn!(
                        "Could not settle delivery, the broker will redeliver it: {:#}. Reconnecting",
                        e
                    );
                    self.reconnect(shutdown).await?;
                }
            }
        }
    }

    /// Replaces the consumer session, backing off between attempts. Returns early without
    /// error once shutdown is requested.
    async fn reconnect(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut attempt = 1;
        loop {
            let error = match self.consumer.reconnect().await {
                Ok(()) => {
                    info!("Relay session re-established after {} attempt(s)", attempt);
                    return Ok(());
                }
                Err(e) => e,
            };
            if attempt >= self.backoff.max_attempts {
                return Err(anyhow!(
                    "relay session lost and not re-established after {} attempts: {}",
                    attempt,
                    error
                ));
            }

            let delay = jittered(self.backoff.backoff_ceiling(attempt));
            warn!(
                "Reconnect attempt {}/{} failed: {}. Retrying in {}ms",
                attempt,
                self.backoff.max_attempts,
                error,
                delay.as_millis()
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Persists one delivery and settles it: ack once stored or already present, reject
    /// data errors, requeue after a backoff on anything transient.
    async fn handle(&mut self, delivery: Delivery, shutdown: &CancellationToken) -> Result<Settlement> {
        let record = match EventRecord::from_json(&delivery.payload) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "Rejecting malformed message: {}. Payload: {}",
                    e,
                    String::from_utf8_lossy(&delivery.payload)
                );
                self.consumer.reject(delivery.tag).await?;
                self.count(|m| &m.events_rejected);
                return Ok(Settlement::Rejected);
            }
        };

        let start = Instant::now();
        let result = self.store.insert_event(&record).await;
        if let Some(metrics) = &self.metrics {
            metrics
                .insert_latency
                .record(start.elapsed().as_secs_f64(), &metrics.labels());
        }

        match result {
            Ok(InsertOutcome::Inserted { observed_at }) => {
                self.consumer.ack(delivery.tag).await?;
                self.consecutive_failures = 0;
                self.count(|m| &m.events_persisted);
                info!(
                    "Stored user operation {} (tx {}, log index {}, block {}) observed at {}",
                    hex_string(&record.user_op_hash),
                    hex_string(&record.transaction_hash),
                    record.log_index,
                    record.block_number,
                    observed_at
                );
                Ok(Settlement::Stored { observed_at })
            }
            Ok(InsertOutcome::Duplicate) => {
                self.consumer.ack(delivery.tag).await?;
                self.consecutive_failures = 0;
                self.count(|m| &m.events_deduplicated);
                info!(
                    "Event {} already stored, acknowledging redelivery",
                    record.key()
                );
                Ok(Settlement::Duplicate)
            }
            Err(e) if !e.is_transient() => {
                error!(
                    "Rejecting event {} that cannot be stored: {}. Payload: {}",
                    record.key(),
                    e,
                    String::from_utf8_lossy(&delivery.payload)
                );
                self.consumer.reject(delivery.tag).await?;
                self.count(|m| &m.events_rejected);
                Ok(Settlement::Rejected)
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = jittered(self.backoff.backoff_ceiling(self.consecutive_failures));
                warn!(
                    "Failed to store event {} (failure {} in a row): {}. Requeueing in {}ms",
                    record.key(),
                    self.consecutive_failures,
                    e,
                    delay.as_millis()
                );

                // The delivery is settled either way so the broker keeps its position
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(delay) => {}
                }
                self.consumer.requeue(delivery.tag).await?;
                self.count(|m| &m.events_requeued);
                Ok(Settlement::Requeued)
            }
        }
    }

    fn count(&self, counter: impl Fn(&Metrics) -> &opentelemetry::metrics::Counter<u64>) {
        if let Some(metrics) = &self.metrics {
            counter(metrics).add(1, &metrics.labels());
        }
    }

    /// Closes the consumer session, handing back anything unsettled, then the store.
    pub async fn close(&mut self) {
        if let Err(e) = self.consumer.close().await {
            warn!("Error closing relay consumer: {}", e);
        }
        self.store.close().await;
    }
}
