// JSON-RPC Ledger
//
// alloy HTTP provider behind the Ledger trait.

use super::{Ledger, LogFilter};
use crate::types::{BlockInfo, LogRecord};
use alloy_consensus::BlockHeader;
use alloy_primitives::{Address, Bytes};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{BlockId, BlockNumberOrTag, Filter, TransactionRequest};
use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use tracing::info;
use url::Url;

pub struct RpcLedger {
    provider: DynProvider,
}

impl RpcLedger {
    pub fn connect(rpc_url: &str) -> eyre::Result<Self> {
        let url: Url = rpc_url
            .parse()
            .wrap_err_with(|| format!("invalid RPC_URL '{rpc_url}'"))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();

        info!("Connected to RPC: {}", rpc_url);
        Ok(Self { provider })
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn latest_block_number(&self) -> eyre::Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block(&self, number: u64) -> eyre::Result<BlockInfo> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?
            .ok_or_else(|| eyre!("block {number} not found"))?;

        Ok(BlockInfo {
            number: block.header.number(),
            timestamp: block.header.timestamp(),
        })
    }

    async fn logs(&self, filter: &LogFilter) -> eyre::Result<Vec<LogRecord>> {
        let mut rpc_filter = Filter::new()
            .event_signature(filter.topic0)
            .from_block(filter.range.from)
            .to_block(filter.range.to);
        if !filter.addresses.is_empty() {
            rpc_filter = rpc_filter.address(filter.addresses.clone());
        }

        let logs = self.provider.get_logs(&rpc_filter).await?;

        logs.into_iter()
            .map(|log| {
                // Pending logs carry no position; get_logs over a mined range never returns them
                let block_number = log
                    .block_number
                    .ok_or_else(|| eyre!("log without block number"))?;
                let tx_hash = log
                    .transaction_hash
                    .ok_or_else(|| eyre!("log without transaction hash at block {block_number}"))?;
                let log_index = log
                    .log_index
                    .ok_or_else(|| eyre!("log without index at block {block_number}"))?;

                Ok(LogRecord {
                    block_number,
                    tx_hash,
                    log_index,
                    log: log.inner,
                })
            })
            .collect()
    }

    async fn call(
        &self,
        to: Address,
        calldata: Bytes,
        block: Option<u64>,
    ) -> eyre::Result<Bytes> {
        let tx = TransactionRequest::default().to(to).input(calldata.into());
        let block_id = match block {
            Some(number) => BlockId::number(number),
            None => BlockId::latest(),
        };

        Ok(self.provider.call(tx).block(block_id).await?)
    }
}
