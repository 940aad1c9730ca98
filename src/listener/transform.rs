use alloy_rpc_types_eth::Log;
use alloy_sol_types::SolEvent;

use crate::models::errors::TransformError;
use crate::models::events::{EventRecord, USER_OPERATION_EVENT, UserOperationEvent};

/// Turns one `UserOperationEvent` log into the record published on the relay.
///
/// Logs from reorged-out blocks and pending logs lacking their position fields are
/// refused rather than published with holes in the deduplication key.
pub fn transform_log(log: &Log) -> Result<EventRecord, TransformError> {
    if log.removed {
        return Err(TransformError::Removed);
    }

    // Position fields make up the storage key, none of them may be missing
    let block_number = log
        .block_number
        .ok_or(TransformError::MissingField { field: "blockNumber" })?;
    let block_hash = log
        .block_hash
        .ok_or(TransformError::MissingField { field: "blockHash" })?;
    let transaction_hash = log
        .transaction_hash
        .ok_or(TransformError::MissingField { field: "transactionHash" })?;
    let transaction_index = log
        .transaction_index
        .ok_or(TransformError::MissingField { field: "transactionIndex" })?;
    let log_index = log
        .log_index
        .ok_or(TransformError::MissingField { field: "logIndex" })?;

    let event = UserOperationEvent::decode_log_data(&log.inner.data).map_err(|e| {
        TransformError::Decode {
            reason: e.to_string(),
        }
    })?;

    Ok(EventRecord {
        user_op_hash: event.userOpHash,
        sender: event.sender,
        paymaster: event.paymaster,
        nonce: event.nonce,
        success: event.success,
        actual_gas_cost: event.actualGasCost,
        actual_gas_used: event.actualGasUsed,
        event_name: USER_OPERATION_EVENT.to_string(),
        log_index,
        transaction_index,
        transaction_hash,
        contract_address: log.inner.address,
        block_hash,
        block_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, LogData, U256};

    fn sample_event() -> UserOperationEvent {
        UserOperationEvent {
            userOpHash: B256::repeat_byte(0xab),
            sender: Address::repeat_byte(0x11),
            paymaster: Address::ZERO,
            nonce: U256::from(7u64),
            success: true,
            actualGasCost: U256::from(21_000u64),
            actualGasUsed: U256::from(20_000u64),
        }
    }

    fn sample_log(data: LogData) -> Log {
        Log {
            inner: alloy_primitives::Log {
                address: Address::repeat_byte(0x22),
                data,
            },
            block_hash: Some(B256::repeat_byte(0xbe)),
            block_number: Some(100),
            block_timestamp: None,
            transaction_hash: Some(B256::repeat_byte(0xde)),
            transaction_index: Some(3),
            log_index: Some(9),
            removed: false,
        }
    }

    #[test]
    fn test_transform_copies_every_field() {
        let log = sample_log(sample_event().encode_log_data());
        let record = transform_log(&log).unwrap();

        assert_eq!(record.user_op_hash, B256::repeat_byte(0xab));
        assert_eq!(record.sender, Address::repeat_byte(0x11));
        assert_eq!(record.paymaster, Address::ZERO);
        assert_eq!(record.nonce, U256::from(7u64));
        assert!(record.success);
        assert_eq!(record.actual_gas_cost, U256::from(21_000u64));
        assert_eq!(record.actual_gas_used, U256::from(20_000u64));
        assert_eq!(record.event_name, "UserOperationEvent");
        assert_eq!(record.log_index, 9);
        assert_eq!(record.transaction_index, 3);
        assert_eq!(record.transaction_hash, B256::repeat_byte(0xde));
        assert_eq!(record.contract_address, Address::repeat_byte(0x22));
        assert_eq!(record.block_hash, B256::repeat_byte(0xbe));
        assert_eq!(record.block_number, 100);
    }

    #[test]
    fn test_removed_and_pending_logs_are_refused() {
        let mut log = sample_log(sample_event().encode_log_data());
        log.removed = true;
        assert!(matches!(transform_log(&log), Err(TransformError::Removed)));

        let mut log = sample_log(sample_event().encode_log_data());
        log.log_index = None;
        assert!(matches!(
            transform_log(&log),
            Err(TransformError::MissingField { field: "logIndex" })
        ));
    }

    #[test]
    fn test_undecodable_payload() {
        let mut data = sample_event().encode_log_data();
        data = LogData::new_unchecked(data.topics().to_vec(), vec![0u8; 4].into());
        assert!(matches!(
            transform_log(&sample_log(data)),
            Err(TransformError::Decode { .. })
        ));
    }
}
