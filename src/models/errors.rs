use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing mandatory setting: {name}")]
    Missing { name: &'static str },
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("Failed to read configuration sources: {0}")]
    Source(#[from] config::ConfigError),
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Missing required field in log: {field}")]
    MissingField { field: &'static str },
    #[error("Log was removed by a chain reorganization")]
    Removed,
    #[error("Failed to decode UserOperationEvent: {reason}")]
    Decode { reason: String },
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("Failed to encode event record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Broker did not acknowledge the published message")]
    NotAcknowledged,
    #[error("Relay channel unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Unknown delivery tag: {tag}")]
    UnknownDelivery { tag: u64 },
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Record cannot be stored: {reason}")]
    InvalidRecord { reason: String },
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistError {
    /// Transient failures are retried through redelivery; everything else is a data error
    /// that would fail identically on every attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            PersistError::InvalidRecord { .. } => false,
            PersistError::Unavailable { .. } => true,
            PersistError::Database(sqlx::Error::Database(db_err)) => {
                // SQLSTATE class 22 is a data exception, class 23 an integrity violation
                !db_err
                    .code()
                    .is_some_and(|code| code.starts_with("22") || code.starts_with("23"))
            }
            PersistError::Database(sqlx::Error::ColumnDecode { .. })
            | PersistError::Database(sqlx::Error::Decode(_))
            | PersistError::Database(sqlx::Error::TypeNotFound { .. }) => false,
            PersistError::Database(_) => true,
        }
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Illegal lifecycle transition for {component}: {from} -> {to}")]
    IllegalTransition {
        component: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum ReferenceDataError {
    #[error("Bundler CSV line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}
