use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use alloy::rpc::types::EIP1186AccountProofResponse;
use async_trait::async_trait;
use eyre::{eyre, Result};
use serde_json::Value;

use mirage_common::types::EMPTY_CODE_HASH;

use super::{ChainRpc, RemoteBlock};

/// In-memory [`ChainRpc`] used by the test suites. Fixtures are registered
/// up front; every raw forward is recorded so tests can assert routing.
#[derive(Default)]
pub struct MockRpc {
    chain_id: u64,
    head: RemoteBlock,
    blocks: HashMap<u64, RemoteBlock>,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    codes: HashMap<Address, Bytes>,
    storage: HashMap<(Address, U256), U256>,
    zero_code_hash: HashSet<Address>,
    supports_proof: bool,
    raw_calls: Mutex<Vec<String>>,
}

impl MockRpc {
    pub fn new(chain_id: u64, head_number: u64) -> Self {
        let head = RemoteBlock {
            number: head_number,
            hash: keccak256(head_number.to_be_bytes()),
            parent_hash: B256::repeat_byte(0xfe),
            timestamp: 1_700_000_000,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(7),
        };

        let mut blocks = HashMap::new();
        blocks.insert(head_number, head);

        Self {
            chain_id,
            head,
            blocks,
            supports_proof: true,
            ..Default::default()
        }
    }

    pub fn with_account(mut self, address: Address, balance: U256, nonce: u64) -> Self {
        self.balances.insert(address, balance);
        self.nonces.insert(address, nonce);
        self
    }

    pub fn with_code(mut self, address: Address, code: Bytes) -> Self {
        self.codes.insert(address, code);
        self
    }

    pub fn with_storage(mut self, address: Address, slot: U256, value: U256) -> Self {
        self.storage.insert((address, slot), value);
        self
    }

    /// Report the all-zero code hash for `address`, as some endpoints do.
    pub fn with_zero_code_hash(mut self, address: Address) -> Self {
        self.zero_code_hash.insert(address);
        self
    }

    /// Simulate an endpoint without `eth_getProof`.
    pub fn without_proof(mut self) -> Self {
        self.supports_proof = false;
        self
    }

    pub fn raw_calls(&self) -> Vec<String> {
        self.raw_calls.lock().unwrap().clone()
    }

    fn code_hash(&self, address: Address) -> B256 {
        if self.zero_code_hash.contains(&address) {
            return B256::ZERO;
        }
        match self.codes.get(&address) {
            Some(code) => keccak256(code),
            None => EMPTY_CODE_HASH,
        }
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl ChainRpc for MockRpc {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.head.number)
    }

    async fn get_block(&self, block: BlockNumberOrTag) -> Result<Option<RemoteBlock>> {
        Ok(match block {
            BlockNumberOrTag::Number(number) => self.blocks.get(&number).copied(),
            _ => Some(self.head),
        })
    }

    async fn get_balance(&self, address: Address, _block: u64) -> Result<U256> {
        Ok(self.balances.get(&address).copied().unwrap_or_default())
    }

    async fn get_transaction_count(&self, address: Address, _block: u64) -> Result<u64> {
        Ok(self.nonces.get(&address).copied().unwrap_or_default())
    }

    async fn get_code(&self, address: Address, _block: BlockNumberOrTag) -> Result<Bytes> {
        Ok(self.codes.get(&address).cloned().unwrap_or_default())
    }

    async fn get_storage_at(&self, address: Address, slot: U256, _block: u64) -> Result<U256> {
        Ok(self
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }

    async fn get_proof(
        &self,
        address: Address,
        _slots: &[B256],
        _block: u64,
    ) -> Result<EIP1186AccountProofResponse> {
        if !self.supports_proof {
            return Err(eyre!("the method eth_getProof does not exist"));
        }

        Ok(EIP1186AccountProofResponse {
            address,
            balance: self.balances.get(&address).copied().unwrap_or_default(),
            nonce: self.nonces.get(&address).copied().unwrap_or_default(),
            code_hash: self.code_hash(address),
            storage_hash: EMPTY_CODE_HASH,
            account_proof: Vec::new(),
            storage_proof: Vec::new(),
        })
    }

    async fn raw_request(&self, method: String, _params: Value) -> Result<Value> {
        self.raw_calls.lock().unwrap().push(method);
        Ok(Value::Null)
    }
}
