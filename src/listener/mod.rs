//! Event source: polls the ledger for `UserOperationEvent` logs emitted by the EntryPoint
//! and hands each one to the relay before the cursor is allowed to move past it.

pub mod rpc;
pub mod transform;

use alloy_primitives::Address;
use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::listener::rpc::LedgerClient;
use crate::listener::transform::transform_log;
use crate::metrics::Metrics;
use crate::models::common::ListenerConfig;
use crate::models::errors::TransformError;
use crate::models::events::{EventRecord, hex_string};
use crate::relay::RelayPublisher;
use crate::storage::CursorStore;
use crate::utils::retry::{RetryConfig, retry};

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub contract: Address,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub chain_tip_buffer: u64,
    /// Ledger calls within one cycle.
    pub poll_retry: RetryConfig,
    /// Publishing one record.
    pub publish_retry: RetryConfig,
    /// Reading or anchoring the cursor at startup.
    pub startup_retry: RetryConfig,
}

impl SourceSettings {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            contract: config.entry_point_address,
            poll_interval: config.poll_interval,
            max_block_range: config.max_block_range,
            chain_tip_buffer: config.chain_tip_buffer,
            poll_retry: RetryConfig::poll(),
            publish_retry: RetryConfig::publish(),
            startup_retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The range up to `cursor` was scanned and everything in it published.
    Advanced { cursor: u64, published: usize },
    /// Nothing new below the tip buffer.
    Idle,
    /// The ledger could not be read; the cursor is unchanged.
    LedgerUnavailable,
    /// Shutdown arrived while the ledger or the relay was being waited on; the cursor is
    /// unchanged.
    Interrupted,
}

pub struct EventSource<L, P, C> {
    ledger: L,
    publisher: P,
    cursors: C,
    settings: SourceSettings,
    /// Width of the next `eth_getLogs` request. Halved after a failed request and grown
    /// back towards `max_block_range` after each success.
    block_range: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl<L, P, C> EventSource<L, P, C>
where
    L: LedgerClient,
    P: RelayPublisher,
    C: CursorStore,
{
    pub fn new(
        ledger: L,
        publisher: P,
        cursors: C,
        settings: SourceSettings,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            ledger,
            publisher,
            cursors,
            block_range: AtomicU64::new(settings.max_block_range.max(1)),
            settings,
            metrics,
        }
    }

    /// Hands back the publisher and cursor store so the caller can close them.
    pub fn into_parts(self) -> (P, C) {
        (self.publisher, self.cursors)
    }

    /// Restores the saved cursor, or anchors a new one at the buffered chain tip and saves
    /// it before any polling happens. Blocks before the anchor are never scanned.
    pub async fn resume_cursor(&self) -> Result<u64> {
        let contract = self.settings.contract;
        let saved = retry(
            || self.cursors.load_cursor(contract),
            &self.settings.startup_retry,
            "load_cursor",
        )
        .await?;

        if let Some(cursor) = saved {
            info!("Resuming {} from saved cursor at block {}", contract, cursor);
            return Ok(cursor);
        }

        let tip = retry(
            || self.ledger.latest_block_number(),
            &self.settings.startup_retry,
            "eth_blockNumber",
        )
        .await?;
        let anchor = tip.saturating_sub(self.settings.chain_tip_buffer);

        retry(
            || self.cursors.save_cursor(contract, anchor),
            &self.settings.startup_retry,
            "save_cursor",
        )
        .await?;

        info!(
            "No saved cursor for {}, anchored at block {} (tip {})",
            contract, anchor, tip
        );
        Ok(anchor)
    }

    /// One poll cycle starting after `cursor`.
    ///
    /// Only publish exhaustion is returned as an error. Ledger failures leave the cursor
    /// where it was so the next cycle starts from the same block, with a narrower range if
    /// the log query itself failed.
    pub async fn poll_once(&self, cursor: u64, shutdown: &CancellationToken) -> Result<PollOutcome> {
        if let Some(metrics) = &self.metrics {
            metrics.poll_cycles.add(1, &metrics.labels());
        }

        let tip = tokio::select! {
            _ = shutdown.cancelled() => return Ok(PollOutcome::Interrupted),
            result = retry(
                || self.ledger.latest_block_number(),
                &self.settings.poll_retry,
                "eth_blockNumber",
            ) => result,
        };
        let tip = match tip {
            Ok(tip) => tip,
            Err(e) => {
                warn!("Ledger unavailable, retrying next cycle: {:#}", e);
                return Ok(PollOutcome::LedgerUnavailable);
            }
        };

        let target = tip.saturating_sub(self.settings.chain_tip_buffer);
        if target <= cursor {
            debug!(
                "No new blocks below the tip buffer (cursor {}, tip {}, buffer {})",
                cursor, tip, self.settings.chain_tip_buffer
            );
            return Ok(PollOutcome::Idle);
        }

        let from_block = cursor + 1;
        let block_range = self.block_range.load(Ordering::Relaxed);
        let to_block = target.min(cursor.saturating_add(block_range));

        let logs = tokio::select! {
            _ = shutdown.cancelled() => return Ok(PollOutcome::Interrupted),
            result = retry(
                || self.ledger.user_operation_logs(from_block, to_block),
                &self.settings.poll_retry,
                "eth_getLogs",
            ) => result,
        };
        let logs = match logs {
            Ok(logs) => {
                self.widen_block_range(block_range);
                logs
            }
            Err(e) => {
                let narrowed = (block_range / 2).max(1);
                self.block_range.store(narrowed, Ordering::Relaxed);
                warn!(
                    "Failed to fetch logs for blocks {}..={}, retrying next cycle with a range of {} blocks: {:#}",
                    from_block, to_block, narrowed, e
                );
                return Ok(PollOutcome::LedgerUnavailable);
            }
        };

        debug!(
            "Fetched {} logs for blocks {}..={}",
            logs.len(),
            from_block,
            to_block
        );

        let mut published = 0;
        for log in &logs {
            let record = match transform_log(log) {
                Ok(record) => record,
                Err(TransformError::Removed) => {
                    warn!("Skipping log removed by reorg: {:?}", log);
                    self.record_skip();
                    continue;
                }
                Err(e) => {
                    error!("Skipping undecodable log: {}. Payload: {:?}", e, log);
                    self.record_skip();
                    continue;
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!(
                        "Shutdown while publishing {}, cursor stays at block {}",
                        record.key(),
                        cursor
                    );
                    return Ok(PollOutcome::Interrupted);
                }
                result = self.publish_with_retry(&record) => result?,
            }

            info!(
                "Relayed user operation {} (tx {}, log index {}, block {})",
                hex_string(&record.user_op_hash),
                hex_string(&record.transaction_hash),
                record.log_index,
                record.block_number
            );
            published += 1;
        }

        if let Err(e) = self
            .cursors
            .save_cursor(self.settings.contract, to_block)
            .await
        {
            warn!(
                "Failed to save cursor at block {}, a restart will rescan from the last saved position: {}",
                to_block, e
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.cursor_block.record(to_block, &metrics.labels());
        }

        Ok(PollOutcome::Advanced {
            cursor: to_block,
            published,
        })
    }

    async fn publish_with_retry(&self, record: &EventRecord) -> Result<()> {
        retry(
            || async move {
                let result = self.publisher.publish(record).await;
                if let Some(metrics) = &self.metrics {
                    match &result {
                        Ok(()) => metrics.events_captured.add(1, &metrics.labels()),
                        Err(_) => metrics.publish_failures.add(1, &metrics.labels()),
                    }
                }
                result
            },
            &self.settings.publish_retry,
            "publish",
        )
        .await
    }

    fn widen_block_range(&self, current: u64) {
        let max = self.settings.max_block_range.max(1);
        if current < max {
            let widened = current.saturating_mul(2).min(max);
            self.block_range.store(widened, Ordering::Relaxed);
            debug!("Log query range widened to {} blocks", widened);
        }
    }

    fn record_skip(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.events_skipped.add(1, &metrics.labels());
        }
    }

    /// Polls until `shutdown` is cancelled. Returns an error only when a record could not be
    /// published after every retry.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut cursor = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown before the cursor was resumed");
                return Ok(());
            }
            cursor = self.resume_cursor() => cursor?,
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down poll loop at block {}", cursor);
                    return Ok(());
                }
                _ = sleep(self.settings.poll_interval) => {}
            }

            match self.poll_once(cursor, shutdown).await? {
                PollOutcome::Advanced {
                    cursor: next,
                    published,
                } => {
                    if published > 0 {
                        info!(
                            "Scanned blocks {}..={}, relayed {} events",
                            cursor + 1,
                            next,
                            published
                        );
                    }
                    cursor = next;
                }
                PollOutcome::Idle | PollOutcome::LedgerUnavailable => {}
                PollOutcome::Interrupted => {
                    info!("Shutting down poll loop at block {}", cursor);
                    return Ok(());
                }
            }
        }
    }
}
