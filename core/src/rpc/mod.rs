use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::EIP1186AccountProofResponse;
use async_trait::async_trait;
use eyre::Result;
use serde_json::Value;

pub mod http_rpc;
pub mod mock_rpc;

pub use http_rpc::HttpRpc;

/// The header fields of a remote block the simulator actually consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u64>,
}

/// The remote chain adapter contract.
///
/// Everything the simulator knows about the forked chain comes through this
/// trait: account state pinned at the fork height, headers, and a raw
/// passthrough for methods the simulator does not answer itself.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn block_number(&self) -> Result<u64>;

    async fn get_block(&self, block: BlockNumberOrTag) -> Result<Option<RemoteBlock>>;

    async fn get_balance(&self, address: Address, block: u64) -> Result<U256>;

    async fn get_transaction_count(&self, address: Address, block: u64) -> Result<u64>;

    async fn get_code(&self, address: Address, block: BlockNumberOrTag) -> Result<Bytes>;

    async fn get_storage_at(&self, address: Address, slot: U256, block: u64) -> Result<U256>;

    /// Proof-based account retrieval. Implementations whose endpoint does not
    /// support `eth_getProof` return an error; callers fall back to the
    /// balance/nonce/code triplet.
    async fn get_proof(
        &self,
        address: Address,
        slots: &[B256],
        block: u64,
    ) -> Result<EIP1186AccountProofResponse>;

    /// Forward an arbitrary JSON-RPC request to the remote endpoint.
    async fn raw_request(&self, method: String, params: Value) -> Result<Value>;
}
