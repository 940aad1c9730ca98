pub const SCHEMA: &str = "pipeline";
pub const EVENTS_TABLE: &str = "pipeline.raw_user_operations";
pub const BUNDLERS_TABLE: &str = "pipeline.bundlers";
pub const CURSORS_TABLE: &str = "pipeline.source_cursors";

/// Key for the transaction-scoped advisory lock serialising schema provisioning.
pub const SCHEMA_LOCK_KEY: i64 = 0x7573_6572_6f70; // "userop"

pub const CREATE_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS pipeline";

/// Column names are kept from the original deployment; dashboards query them directly.
/// `snapshot_timestamp` is the observation time assigned by the persister.
pub const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline.raw_user_operations (
    snapshot_timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
    user_op_hash VARCHAR(66) NOT NULL,
    sender VARCHAR(42) NOT NULL,
    paymaster VARCHAR(42) NOT NULL,
    nonce NUMERIC NOT NULL,
    success BOOLEAN NOT NULL,
    actual_gas_cost NUMERIC(35, 0) NOT NULL,
    actual_gas_used NUMERIC(35, 0) NOT NULL,
    event VARCHAR(255) NOT NULL,
    log_index BIGINT NOT NULL,
    transaction_index BIGINT NOT NULL,
    transaction_hash VARCHAR(66) NOT NULL,
    address VARCHAR(42) NOT NULL,
    block_hash VARCHAR(66) NOT NULL,
    block_number BIGINT NOT NULL
)
"#;

/// Also applied to tables created before deduplication existed. Fails if such a table
/// already holds duplicate rows, which then have to be removed by hand.
pub const CREATE_EVENTS_UNIQUE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS raw_user_operations_tx_log_idx
    ON pipeline.raw_user_operations (transaction_hash, log_index)
"#;

pub const CREATE_EVENTS_TIME_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS raw_user_operations_snapshot_idx
    ON pipeline.raw_user_operations (snapshot_timestamp)
"#;

pub const CREATE_BUNDLERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline.bundlers (
    entity_name VARCHAR(255),
    address VARCHAR(255),
    ethereum BOOLEAN,
    polygon BOOLEAN,
    arbitrum BOOLEAN,
    optimism BOOLEAN,
    bnb BOOLEAN,
    avalanche BOOLEAN,
    base BOOLEAN
)
"#;

pub const CREATE_CURSORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline.source_cursors (
    contract_address VARCHAR(42) PRIMARY KEY,
    block_number BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Applied in order inside one transaction.
pub const DDL: [&str; 6] = [
    CREATE_SCHEMA,
    CREATE_EVENTS_TABLE,
    CREATE_EVENTS_UNIQUE_INDEX,
    CREATE_EVENTS_TIME_INDEX,
    CREATE_BUNDLERS_TABLE,
    CREATE_CURSORS_TABLE,
];

pub const INSERT_EVENT: &str = r#"
INSERT INTO pipeline.raw_user_operations (
    snapshot_timestamp, user_op_hash, sender, paymaster, nonce, success,
    actual_gas_cost, actual_gas_used, event, log_index, transaction_index,
    transaction_hash, address, block_hash, block_number
)
VALUES (now(), $1, $2, $3, $4::NUMERIC, $5, $6::NUMERIC, $7::NUMERIC, $8, $9, $10, $11, $12, $13, $14)
ON CONFLICT (transaction_hash, log_index) DO NOTHING
RETURNING snapshot_timestamp::TIMESTAMPTZ AS observed_at
"#;

pub const SELECT_EVENTS: &str = r#"
SELECT
    snapshot_timestamp::TIMESTAMPTZ AS observed_at,
    user_op_hash, sender, paymaster,
    nonce::TEXT AS nonce,
    success,
    actual_gas_cost::TEXT AS actual_gas_cost,
    actual_gas_used::TEXT AS actual_gas_used,
    event,
    log_index::BIGINT AS log_index,
    transaction_index::BIGINT AS transaction_index,
    transaction_hash, address, block_hash, block_number
FROM pipeline.raw_user_operations
WHERE transaction_hash = $1 AND log_index = $2
ORDER BY snapshot_timestamp
"#;

pub const SELECT_CURSOR: &str =
    "SELECT block_number FROM pipeline.source_cursors WHERE contract_address = $1";

pub const UPSERT_CURSOR: &str = r#"
INSERT INTO pipeline.source_cursors (contract_address, block_number, updated_at)
VALUES ($1, $2, now())
ON CONFLICT (contract_address)
DO UPDATE SET block_number = EXCLUDED.block_number, updated_at = now()
"#;

pub const COUNT_BUNDLERS: &str = "SELECT COUNT(*) FROM pipeline.bundlers";

pub const INSERT_BUNDLER: &str = r#"
INSERT INTO pipeline.bundlers (
    entity_name, address, ethereum, polygon, arbitrum, optimism, bnb, avalanche, base
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;
