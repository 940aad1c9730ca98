pub mod memory;
pub mod postgres;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::errors::PersistError;
use crate::models::events::{EventRecord, StoredEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted { observed_at: DateTime<Utc> },
    /// A row for the same (transaction hash, log index) already exists.
    Duplicate,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates the namespace and tables if missing. Safe to repeat and to run concurrently.
    async fn ensure_schema(&self) -> Result<(), PersistError>;

    /// Inserts one record in its own transaction, stamping the observation time.
    async fn insert_event(&self, record: &EventRecord) -> Result<InsertOutcome, PersistError>;

    /// All rows stored for one log entry. More than one would mean deduplication failed.
    async fn fetch_events(
        &self,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<Vec<StoredEvent>, PersistError>;

    async fn close(&self);
}

/// Durable position of the listener, one per watched contract.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, contract: Address) -> Result<Option<u64>, PersistError>;

    async fn save_cursor(&self, contract: Address, block_number: u64) -> Result<(), PersistError>;
}
