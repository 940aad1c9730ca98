use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::errors::PersistError;
use crate::models::events::{EventRecord, StoredEvent};
use crate::storage::{CursorStore, EventStore, InsertOutcome};

#[derive(Debug, Default)]
struct State {
    schema_ready: bool,
    rows: Vec<StoredEvent>,
    cursors: HashMap<Address, u64>,
    insert_failures: usize,
    cursor_failures: usize,
}

/// Store with the same uniqueness rule as the relational schema, for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` inserts fail as if the database were unreachable.
    pub async fn fail_next_inserts(&self, count: usize) {
        self.state.lock().await.insert_failures = count;
    }

    pub async fn fail_next_cursor_writes(&self, count: usize) {
        self.state.lock().await.cursor_failures = count;
    }

    /// Rows in insertion order.
    pub async fn rows(&self) -> Vec<StoredEvent> {
        self.state.lock().await.rows.clone()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn ensure_schema(&self) -> Result<(), PersistError> {
        self.state.lock().await.schema_ready = true;
        Ok(())
    }

    async fn insert_event(&self, record: &EventRecord) -> Result<InsertOutcome, PersistError> {
        record
            .validate_for_storage()
            .map_err(|reason| PersistError::InvalidRecord { reason })?;

        let mut state = self.state.lock().await;
        if state.insert_failures > 0 {
            state.insert_failures -= 1;
            return Err(PersistError::Unavailable {
                reason: "connection refused".to_string(),
            });
        }
        if !state.schema_ready {
            return Err(PersistError::Unavailable {
                reason: "relation \"pipeline.raw_user_operations\" does not exist".to_string(),
            });
        }

        let exists = state.rows.iter().any(|row| {
            row.record.transaction_hash == record.transaction_hash
                && row.record.log_index == record.log_index
        });
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }

        let observed_at = Utc::now();
        state.rows.push(StoredEvent {
            record: record.clone(),
            observed_at,
        });
        Ok(InsertOutcome::Inserted { observed_at })
    }

    async fn fetch_events(
        &self,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<Vec<StoredEvent>, PersistError> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .iter()
            .filter(|row| {
                row.record.transaction_hash == transaction_hash && row.record.log_index == log_index
            })
            .cloned()
            .collect())
    }

    async fn close(&self) {}
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, contract: Address) -> Result<Option<u64>, PersistError> {
        Ok(self.state.lock().await.cursors.get(&contract).copied())
    }

    async fn save_cursor(&self, contract: Address, block_number: u64) -> Result<(), PersistError> {
        let mut state = self.state.lock().await;
        if state.cursor_failures > 0 {
            state.cursor_failures -= 1;
            return Err(PersistError::Unavailable {
                reason: "connection reset".to_string(),
            });
        }
        state.cursors.insert(contract, block_number);
        Ok(())
    }
}
