use alloy_primitives::Address;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::models::errors::ConfigError;

const DEFAULT_POSTGRES_PORT: u16 = 5432;
const DEFAULT_POSTGRES_MAX_CONNECTIONS: u32 = 2;
const DEFAULT_RABBITMQ_PORT: u16 = 5672;
const DEFAULT_RABBITMQ_CREDENTIAL: &str = "guest";
const DEFAULT_QUEUE_NAME: &str = "user_operations";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_MAX_BLOCK_RANGE: u64 = 500;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STARTUP_DELAY_SECS: u64 = 10;
const DEFAULT_METRICS_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LISTENER_METRICS_PORT: u16 = 9100;
pub const DEFAULT_PERSISTER_METRICS_PORT: u16 = 9101;

/// Every setting either process understands, as read from the file and environment
/// layers. Nothing is validated here.
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub rpc_url: Option<String>,
    pub rpc_timeout_secs: Option<u64>,
    pub entry_point_address: Option<String>,
    pub postgres_host: Option<String>,
    pub postgres_port: Option<u16>,
    pub postgres_db: Option<String>,
    pub postgres_user: Option<String>,
    pub postgres_password: Option<String>,
    pub postgres_max_connections: Option<u32>,
    pub rabbitmq_host: Option<String>,
    pub rabbitmq_port: Option<u16>,
    pub rabbitmq_user: Option<String>,
    pub rabbitmq_password: Option<String>,
    pub queue_name: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub max_block_range: Option<u64>,
    pub chain_tip_buffer: Option<u64>,
    pub startup_delay_secs: Option<u64>,
    pub bundlers_csv: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_address: Option<String>,
    pub metrics_port: Option<u16>,
}

fn require(name: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing { name }),
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl StorageConfig {
    fn from_raw(raw: &mut RawConfig) -> Result<Self, ConfigError> {
        let max_connections = raw
            .postgres_max_connections
            .unwrap_or(DEFAULT_POSTGRES_MAX_CONNECTIONS);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "POSTGRES_MAX_CONNECTIONS",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            host: require("POSTGRES_HOST", raw.postgres_host.take())?,
            port: raw.postgres_port.unwrap_or(DEFAULT_POSTGRES_PORT),
            database: require("POSTGRES_DB", raw.postgres_db.take())?,
            user: require("POSTGRES_USER", raw.postgres_user.take())?,
            password: require("POSTGRES_PASSWORD", raw.postgres_password.take())?,
            max_connections,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub queue: String,
}

impl RelayConfig {
    fn from_raw(raw: &mut RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            host: require("RABBITMQ_HOST", raw.rabbitmq_host.take())?,
            port: raw.rabbitmq_port.unwrap_or(DEFAULT_RABBITMQ_PORT),
            user: raw
                .rabbitmq_user
                .take()
                .unwrap_or_else(|| DEFAULT_RABBITMQ_CREDENTIAL.to_string()),
            password: raw
                .rabbitmq_password
                .take()
                .unwrap_or_else(|| DEFAULT_RABBITMQ_CREDENTIAL.to_string()),
            queue: raw
                .queue_name
                .take()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
        })
    }

    /// AMQP URI on the default vhost. Credentials are percent-encoded by `url`.
    pub fn uri(&self) -> Result<String, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            name: "RABBITMQ_HOST",
            reason,
        };
        let mut uri = Url::parse(&format!("amqp://{}:{}/%2f", self.host, self.port))
            .map_err(|e| invalid(e.to_string()))?;
        uri.set_username(&self.user)
            .map_err(|_| invalid("cannot carry credentials".to_string()))?;
        uri.set_password(Some(&self.password))
            .map_err(|_| invalid("cannot carry credentials".to_string()))?;
        Ok(uri.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl MetricsConfig {
    fn from_raw(raw: &mut RawConfig, default_port: u16) -> Self {
        Self {
            enabled: raw.metrics_enabled.unwrap_or(false),
            address: raw
                .metrics_address
                .take()
                .unwrap_or_else(|| DEFAULT_METRICS_ADDRESS.to_string()),
            port: raw.metrics_port.unwrap_or(default_port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub rpc_url: Url,
    /// Upper bound on a single JSON-RPC round trip.
    pub rpc_timeout: Duration,
    pub entry_point_address: Address,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub chain_tip_buffer: u64,
    pub startup_delay: Duration,
    pub storage: StorageConfig,
    pub relay: RelayConfig,
    pub metrics: MetricsConfig,
}

impl ListenerConfig {
    /// Validates the ledger settings first so a missing contract address is reported before
    /// anything else is looked at.
    pub fn from_raw(mut raw: RawConfig) -> Result<Self, ConfigError> {
        let rpc_url = require("RPC_URL", raw.rpc_url.take())?;
        let rpc_url = Url::parse(rpc_url.trim()).map_err(|e| ConfigError::Invalid {
            name: "RPC_URL",
            reason: e.to_string(),
        })?;
        if !matches!(rpc_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: "RPC_URL",
                reason: format!("unsupported scheme '{}'", rpc_url.scheme()),
            });
        }

        let rpc_timeout_secs = raw.rpc_timeout_secs.unwrap_or(DEFAULT_RPC_TIMEOUT_SECS);
        if rpc_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "RPC_TIMEOUT_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let address = require("ENTRY_POINT_ADDRESS", raw.entry_point_address.take())?;
        let entry_point_address =
            Address::from_str(address.trim()).map_err(|e| ConfigError::Invalid {
                name: "ENTRY_POINT_ADDRESS",
                reason: e.to_string(),
            })?;
        if entry_point_address.is_zero() {
            return Err(ConfigError::Invalid {
                name: "ENTRY_POINT_ADDRESS",
                reason: "zero address".to_string(),
            });
        }

        let poll_interval_ms = raw.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "POLL_INTERVAL_MS",
                reason: "must be greater than zero".to_string(),
            });
        }
        let max_block_range = raw.max_block_range.unwrap_or(DEFAULT_MAX_BLOCK_RANGE);
        if max_block_range == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_BLOCK_RANGE",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            rpc_url,
            rpc_timeout: Duration::from_secs(rpc_timeout_secs),
            entry_point_address,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_block_range,
            chain_tip_buffer: raw.chain_tip_buffer.unwrap_or(0),
            startup_delay: Duration::from_secs(
                raw.startup_delay_secs.unwrap_or(DEFAULT_STARTUP_DELAY_SECS),
            ),
            storage: StorageConfig::from_raw(&mut raw)?,
            relay: RelayConfig::from_raw(&mut raw)?,
            metrics: MetricsConfig::from_raw(&mut raw, DEFAULT_LISTENER_METRICS_PORT),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PersisterConfig {
    pub startup_delay: Duration,
    pub bundlers_csv: Option<PathBuf>,
    pub storage: StorageConfig,
    pub relay: RelayConfig,
    pub metrics: MetricsConfig,
}

impl PersisterConfig {
    pub fn from_raw(mut raw: RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            startup_delay: Duration::from_secs(
                raw.startup_delay_secs.unwrap_or(DEFAULT_STARTUP_DELAY_SECS),
            ),
            bundlers_csv: raw
                .bundlers_csv
                .take()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            storage: StorageConfig::from_raw(&mut raw)?,
            relay: RelayConfig::from_raw(&mut raw)?,
            metrics: MetricsConfig::from_raw(&mut raw, DEFAULT_PERSISTER_METRICS_PORT),
        })
    }
}
