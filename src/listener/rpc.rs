use alloy_eips::BlockNumberOrTag;
use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_rpc_types_eth::{Filter, Log};
use alloy_sol_types::SolEvent;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::metrics::Metrics;
use crate::models::events::UserOperationEvent;

/// The slice of the ledger's JSON-RPC API the listener needs.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn latest_block_number(&self) -> Result<u64>;

    /// Whether any contract code is deployed at the watched address.
    async fn contract_deployed(&self) -> Result<bool>;

    /// `UserOperationEvent` logs emitted by the watched contract in
    /// `[from_block, to_block]`, in the order the node returns them.
    async fn user_operation_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>>;
}

pub struct RpcLedger<P> {
    provider: P,
    contract: Address,
    metrics: Option<Arc<Metrics>>,
}

impl<P: Provider> RpcLedger<P> {
    pub fn new(provider: P, contract: Address, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            provider,
            contract,
            metrics,
        }
    }

    pub fn filter(&self, from_block: u64, to_block: u64) -> Filter {
        Filter::new()
            .address(self.contract)
            .event_signature(UserOperationEvent::SIGNATURE_HASH)
            .from_block(BlockNumberOrTag::Number(from_block))
            .to_block(BlockNumberOrTag::Number(to_block))
    }

    fn record_request(&self, method: &'static str) -> Instant {
        if let Some(metrics) = &self.metrics {
            metrics.rpc_requests.add(1, &metrics.rpc_labels(method));
        }
        Instant::now()
    }

    fn record_response(&self, method: &'static str, start: Instant, failed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics
                .rpc_latency
                .record(start.elapsed().as_secs_f64(), &metrics.rpc_labels(method));
            if failed {
                metrics.rpc_errors.add(1, &metrics.rpc_labels(method));
            }
        }
    }
}

#[async_trait]
impl<P: Provider + Send + Sync> LedgerClient for RpcLedger<P> {
    async fn chain_id(&self) -> Result<u64> {
        let start = self.record_request("eth_chainId");
        let result = self.provider.get_chain_id().await;
        self.record_response("eth_chainId", start, result.is_err());

        result.map_err(|e| {
            warn!("Failed to get chain ID. Error details:\n{:#?}", e);
            anyhow!("RPC error: {}", e)
        })
    }

    async fn latest_block_number(&self) -> Result<u64> {
        let start = self.record_request("eth_blockNumber");
        let result = self.provider.get_block_number().await;
        self.record_response("eth_blockNumber", start, result.is_err());

        if let (Ok(block), Some(metrics)) = (&result, &self.metrics) {
            metrics.chain_tip_block.record(*block, &metrics.labels());
        }

        result.map_err(|e| {
            warn!("Failed to get latest block number. Error details:\n{:#?}", e);
            anyhow!("RPC error: {}", e)
        })
    }

    async fn contract_deployed(&self) -> Result<bool> {
        let start = self.record_request("eth_getCode");
        let result = self.provider.get_code_at(self.contract).await;
        self.record_response("eth_getCode", start, result.is_err());

        result.map(|code| !code.is_empty()).map_err(|e| {
            warn!("Failed to get code at {}. Error details:\n{:#?}", self.contract, e);
            anyhow!("RPC error: {}", e)
        })
    }

    async fn user_operation_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let filter = self.filter(from_block, to_block);

        let start = self.record_request("eth_getLogs");
        let result = self.provider.get_logs(&filter).await;
        self.record_response("eth_getLogs", start, result.is_err());

        result.map_err(|e| {
            warn!(
                "Failed to get logs for blocks {}..={}. Error details:\n{:#?}",
                from_block, to_block, e
            );
            anyhow!("RPC error: {}", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_provider::ProviderBuilder;
    use std::str::FromStr;

    #[test]
    fn test_filter_targets_contract_and_event() {
        let provider = ProviderBuilder::new()
            .connect_http("http://localhost:8545".parse().unwrap());
        let contract = Address::from_str("0x5ff137d4b0fdcd49dca30c7cf57e578a026d2789").unwrap();
        let ledger = RpcLedger::new(provider, contract, None);

        let filter = ledger.filter(100, 150);
        assert_eq!(filter.get_from_block(), Some(100));
        assert_eq!(filter.get_to_block(), Some(150));
        assert!(filter.address.matches(&contract));
        assert!(filter.topics[0].matches(&UserOperationEvent::SIGNATURE_HASH));
        assert_eq!(
            UserOperationEvent::SIGNATURE,
            "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)"
        );
    }
}
