use std::borrow::Cow;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::ClientBuilder;
use alloy::rpc::types::{BlockTransactionsKind, EIP1186AccountProofResponse};
use alloy::transports::http::Http;
#[cfg(not(target_arch = "wasm32"))]
use alloy::transports::layers::{RetryBackoffLayer, RetryBackoffService};
use async_trait::async_trait;
use eyre::Result;
use reqwest::Client;
use serde_json::Value;

use mirage_common::errors::RpcError;

use super::{ChainRpc, RemoteBlock};

/// [`ChainRpc`] over an HTTP JSON-RPC endpoint.
pub struct HttpRpc {
    url: String,
    #[cfg(not(target_arch = "wasm32"))]
    provider: RootProvider<RetryBackoffService<Http<Client>>>,
    #[cfg(target_arch = "wasm32")]
    provider: RootProvider<Http<Client>>,
}

impl HttpRpc {
    pub fn new(rpc: &str) -> Result<Self> {
        #[cfg(not(target_arch = "wasm32"))]
        let client = ClientBuilder::default()
            .layer(RetryBackoffLayer::new(100, 50, 300))
            .http(rpc.parse()?);

        #[cfg(target_arch = "wasm32")]
        let client = ClientBuilder::default().http(rpc.parse()?);

        let provider = RootProvider::new(client);

        Ok(HttpRpc {
            url: rpc.to_string(),
            provider,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Clone for HttpRpc {
    fn clone(&self) -> Self {
        Self::new(&self.url).unwrap()
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl ChainRpc for HttpRpc {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self
            .provider
            .get_chain_id()
            .await
            .map_err(|e| RpcError::new("chain_id", e))?)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self
            .provider
            .get_block_number()
            .await
            .map_err(|e| RpcError::new("block_number", e))?)
    }

    async fn get_block(&self, block: BlockNumberOrTag) -> Result<Option<RemoteBlock>> {
        let block = self
            .provider
            .get_block_by_number(block, BlockTransactionsKind::Hashes)
            .await
            .map_err(|e| RpcError::new("get_block", e))?;

        Ok(block.map(|block| RemoteBlock {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
            gas_limit: block.header.gas_limit,
            base_fee_per_gas: block.header.base_fee_per_gas,
        }))
    }

    async fn get_balance(&self, address: Address, block: u64) -> Result<U256> {
        Ok(self
            .provider
            .get_balance(address)
            .block_id(block.into())
            .await
            .map_err(|e| RpcError::new("get_balance", e))?)
    }

    async fn get_transaction_count(&self, address: Address, block: u64) -> Result<u64> {
        Ok(self
            .provider
            .get_transaction_count(address)
            .block_id(block.into())
            .await
            .map_err(|e| RpcError::new("get_transaction_count", e))?)
    }

    async fn get_code(&self, address: Address, block: BlockNumberOrTag) -> Result<Bytes> {
        Ok(self
            .provider
            .get_code_at(address)
            .block_id(block.into())
            .await
            .map_err(|e| RpcError::new("get_code", e))?)
    }

    async fn get_storage_at(&self, address: Address, slot: U256, block: u64) -> Result<U256> {
        Ok(self
            .provider
            .get_storage_at(address, slot)
            .block_id(block.into())
            .await
            .map_err(|e| RpcError::new("get_storage_at", e))?)
    }

    async fn get_proof(
        &self,
        address: Address,
        slots: &[B256],
        block: u64,
    ) -> Result<EIP1186AccountProofResponse> {
        Ok(self
            .provider
            .get_proof(address, slots.to_vec())
            .block_id(block.into())
            .await
            .map_err(|e| RpcError::new("get_proof", e))?)
    }

    async fn raw_request(&self, method: String, params: Value) -> Result<Value> {
        Ok(self
            .provider
            .raw_request::<_, Value>(Cow::Owned(method), params)
            .await
            .map_err(|e| RpcError::new("raw_request", e))?)
    }
}
