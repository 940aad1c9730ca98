pub mod schema;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::models::bundlers::{BundlerEntity, parse_bundlers_csv};
use crate::models::common::StorageConfig;
use crate::models::errors::PersistError;
use crate::models::events::{EventRecord, StoredEvent, hex_string};
use crate::models::uint::parse_uint;
use crate::storage::postgres::schema::{
    BUNDLERS_TABLE, COUNT_BUNDLERS, CURSORS_TABLE, DDL, EVENTS_TABLE, INSERT_BUNDLER,
    INSERT_EVENT, SCHEMA, SCHEMA_LOCK_KEY, SELECT_CURSOR, SELECT_EVENTS, UPSERT_CURSOR,
};
use crate::storage::{CursorStore, EventStore, InsertOutcome};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct EventRow {
    observed_at: DateTime<Utc>,
    user_op_hash: String,
    sender: String,
    paymaster: String,
    nonce: String,
    success: bool,
    actual_gas_cost: String,
    actual_gas_used: String,
    event: String,
    log_index: i64,
    transaction_index: i64,
    transaction_hash: String,
    address: String,
    block_hash: String,
    block_number: i64,
}

impl EventRow {
    fn into_stored(self) -> Result<StoredEvent, PersistError> {
        let invalid = |column: &str, reason: String| PersistError::InvalidRecord {
            reason: format!("stored column {column}: {reason}"),
        };
        let hash = |column: &str, value: &str| {
            B256::from_str(value).map_err(|e| invalid(column, e.to_string()))
        };
        let address = |column: &str, value: &str| {
            Address::from_str(value).map_err(|e| invalid(column, e.to_string()))
        };
        let uint = |column: &str, value: &str| parse_uint(value).map_err(|e| invalid(column, e));
        let unsigned = |column: &str, value: i64| {
            u64::try_from(value).map_err(|e| invalid(column, e.to_string()))
        };

        Ok(StoredEvent {
            observed_at: self.observed_at,
            record: EventRecord {
                user_op_hash: hash("user_op_hash", &self.user_op_hash)?,
                sender: address("sender", &self.sender)?,
                paymaster: address("paymaster", &self.paymaster)?,
                nonce: uint("nonce", &self.nonce)?,
                success: self.success,
                actual_gas_cost: uint("actual_gas_cost", &self.actual_gas_cost)?,
                actual_gas_used: uint("actual_gas_used", &self.actual_gas_used)?,
                event_name: self.event,
                log_index: unsigned("log_index", self.log_index)?,
                transaction_index: unsigned("transaction_index", self.transaction_index)?,
                transaction_hash: hash("transaction_hash", &self.transaction_hash)?,
                contract_address: address("address", &self.address)?,
                block_hash: hash("block_hash", &self.block_hash)?,
                block_number: unsigned("block_number", self.block_number)?,
            },
        })
    }
}

/// Callers run [`EventRecord::validate_for_storage`] first; this only converts.
fn to_bigint(value: u64) -> Result<i64, PersistError> {
    i64::try_from(value).map_err(|_| PersistError::InvalidRecord {
        reason: format!("{value} exceeds BIGINT range"),
    })
}

impl PgStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self, PersistError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        info!(
            "Connected to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(Self { pool })
    }

    /// Wraps an existing pool, e.g. one built from a connection URL in tests.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Imports the bundler reference file unless the table already holds rows.
    /// Returns the number of rows inserted.
    pub async fn load_bundlers(&self, path: &Path) -> anyhow::Result<usize> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("failed to read bundler file {}: {}", path.display(), e)
        })?;
        let entities = parse_bundlers_csv(&contents)?;
        let inserted = self.insert_bundlers(&entities).await?;
        Ok(inserted)
    }

    pub async fn insert_bundlers(&self, entities: &[BundlerEntity]) -> Result<usize, PersistError> {
        let mut tx = self.pool.begin().await?;

        // Same lock as schema provisioning so two persisters cannot both see an empty table
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let existing: i64 = sqlx::query_scalar(COUNT_BUNDLERS)
            .fetch_one(&mut *tx)
            .await?;
        if existing > 0 {
            info!(
                "Table {} already holds {} rows, skipping import",
                BUNDLERS_TABLE, existing
            );
            tx.rollback().await?;
            return Ok(0);
        }

        for entity in entities {
            let [ethereum, polygon, arbitrum, optimism, bnb, avalanche, base] = entity.chains;
            sqlx::query(INSERT_BUNDLER)
                .bind(&entity.entity_name)
                .bind(&entity.address)
                .bind(ethereum)
                .bind(polygon)
                .bind(arbitrum)
                .bind(optimism)
                .bind(bnb)
                .bind(avalanche)
                .bind(base)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!("Loaded {} rows into {}", entities.len(), BUNDLERS_TABLE);
        Ok(entities.len())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;

        // CREATE ... IF NOT EXISTS is not safe against itself running concurrently
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        for statement in DDL {
            if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                error!("Schema statement failed: {}\n{}", e, statement.trim());
                tx.rollback().await?;
                return Err(e.into());
            }
        }
        tx.commit().await?;

        info!(
            "Schema `{}` ready ({}, {}, {})",
            SCHEMA, EVENTS_TABLE, BUNDLERS_TABLE, CURSORS_TABLE
        );
        Ok(())
    }

    async fn insert_event(&self, record: &EventRecord) -> Result<InsertOutcome, PersistError> {
        record
            .validate_for_storage()
            .map_err(|reason| PersistError::InvalidRecord { reason })?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query_scalar::<_, DateTime<Utc>>(INSERT_EVENT)
            .bind(hex_string(&record.user_op_hash))
            .bind(record.sender.to_checksum(None))
            .bind(record.paymaster.to_checksum(None))
            .bind(record.nonce.to_string())
            .bind(record.success)
            .bind(record.actual_gas_cost.to_string())
            .bind(record.actual_gas_used.to_string())
            .bind(&record.event_name)
            .bind(to_bigint(record.log_index)?)
            .bind(to_bigint(record.transaction_index)?)
            .bind(hex_string(&record.transaction_hash))
            .bind(record.contract_address.to_checksum(None))
            .bind(hex_string(&record.block_hash))
            .bind(to_bigint(record.block_number)?)
            .fetch_optional(&mut *tx)
            .await;

        let observed_at = match result {
            Ok(observed_at) => observed_at,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback after failed insert also failed: {}", rollback_err);
                }
                return Err(e.into());
            }
        };
        tx.commit().await?;

        Ok(match observed_at {
            Some(observed_at) => InsertOutcome::Inserted { observed_at },
            None => InsertOutcome::Duplicate,
        })
    }

    async fn fetch_events(
        &self,
        transaction_hash: B256,
        log_index: u64,
    ) -> Result<Vec<StoredEvent>, PersistError> {
        let rows: Vec<EventRow> = sqlx::query_as(SELECT_EVENTS)
            .bind(hex_string(&transaction_hash))
            .bind(to_bigint(log_index)?)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(EventRow::into_stored).collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Connection pool to PostgreSQL closed");
    }
}

#[async_trait]
impl CursorStore for PgStore {
    async fn load_cursor(&self, contract: Address) -> Result<Option<u64>, PersistError> {
        let block: Option<i64> = sqlx::query_scalar(SELECT_CURSOR)
            .bind(contract.to_checksum(None))
            .fetch_optional(&self.pool)
            .await?;
        block
            .map(|b| {
                u64::try_from(b).map_err(|_| PersistError::InvalidRecord {
                    reason: format!("negative cursor {b} for {contract}"),
                })
            })
            .transpose()
    }

    async fn save_cursor(&self, contract: Address, block_number: u64) -> Result<(), PersistError> {
        sqlx::query(UPSERT_CURSOR)
            .bind(contract.to_checksum(None))
            .bind(to_bigint(block_number)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
