use alloy_primitives::{Address, B256, U256, hex};
use alloy_sol_types::sol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::uint;

pub const USER_OPERATION_EVENT: &str = "UserOperationEvent";

sol! {
    /// Emitted by the ERC-4337 EntryPoint once per settled user operation.
    #[derive(Debug, PartialEq, Eq)]
    event UserOperationEvent(
        bytes32 indexed userOpHash,
        address indexed sender,
        address indexed paymaster,
        uint256 nonce,
        bool success,
        uint256 actualGasCost,
        uint256 actualGasUsed
    );
}

/// One settled user operation as it travels over the relay channel.
///
/// Carries no observation time; the persister stamps one on insert (see [`StoredEvent`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub user_op_hash: B256,
    pub sender: Address,
    #[serde(default, deserialize_with = "address_or_zero")]
    pub paymaster: Address,
    #[serde(with = "uint::integer")]
    pub nonce: U256,
    pub success: bool,
    #[serde(with = "uint::decimal")]
    pub actual_gas_cost: U256,
    #[serde(with = "uint::decimal")]
    pub actual_gas_used: U256,
    #[serde(rename = "event", alias = "eventName")]
    pub event_name: String,
    pub log_index: u64,
    pub transaction_index: u64,
    pub transaction_hash: B256,
    #[serde(rename = "address", alias = "contractAddress")]
    pub contract_address: Address,
    pub block_hash: B256,
    pub block_number: u64,
}

fn address_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
    Ok(Option::<Address>::deserialize(deserializer)?.unwrap_or(Address::ZERO))
}

impl EventRecord {
    pub fn from_json(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Rejects values the relational schema cannot hold. Gas columns are NUMERIC(35, 0)
    /// and the index/height columns are BIGINT.
    pub fn validate_for_storage(&self) -> Result<(), String> {
        let gas_limit = U256::from(10u8).pow(U256::from(35u8));
        if self.actual_gas_cost >= gas_limit {
            return Err(format!(
                "actualGasCost {} exceeds 35 decimal digits",
                self.actual_gas_cost
            ));
        }
        if self.actual_gas_used >= gas_limit {
            return Err(format!(
                "actualGasUsed {} exceeds 35 decimal digits",
                self.actual_gas_used
            ));
        }
        for (name, value) in [
            ("blockNumber", self.block_number),
            ("logIndex", self.log_index),
            ("transactionIndex", self.transaction_index),
        ] {
            if i64::try_from(value).is_err() {
                return Err(format!("{name} {value} exceeds BIGINT range"));
            }
        }
        Ok(())
    }

    /// Short identifier used in logs: `<tx hash>:<log index>`.
    pub fn key(&self) -> String {
        format!("{}:{}", hex_string(&self.transaction_hash), self.log_index)
    }
}

/// A persisted row, read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub record: EventRecord,
    pub observed_at: DateTime<Utc>,
}

/// Lowercase, `0x`-prefixed hex, the form hashes take on the wire and in storage.
pub fn hex_string(hash: &B256) -> String {
    hex::encode_prefixed(hash)
}
