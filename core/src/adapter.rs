use std::sync::Arc;

use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, Bloom, Bytes, B256, U256, U64};
use alloy::rpc::types::TransactionRequest;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use mirage_common::errors::{EvmError, SimulationError};
use mirage_common::types::{BlockTag, ExecutionStatus, TxResult};

use crate::engine::{SimulatedBlock, Simulator};
use crate::rpc::ChainRpc;

/// Internal routing signal: the request targets forked history and must be
/// answered by the remote provider. Never serialized onto the wire.
pub const FALLBACK_TO_REMOTE_CODE: i64 = 32552225;

#[derive(Debug, Error)]
pub enum RpcHandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("{message}")]
    Execution {
        message: String,
        data: Option<String>,
    },
    #[error("fall back to remote provider")]
    FallbackToRemote,
    #[error("{0}")]
    Internal(String),
}

impl RpcHandlerError {
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => -32602,
            Self::Execution { .. } => -32000,
            Self::FallbackToRemote => FALLBACK_TO_REMOTE_CODE,
            Self::Internal(_) => -32603,
        }
    }
}

/// Adapts the engine to the `eth_` JSON-RPC surface.
///
/// [`RpcAdapter::handle`] answers what the simulator owns and signals
/// [`RpcHandlerError::FallbackToRemote`] for everything else;
/// [`RpcAdapter::dispatch`] resolves that signal by forwarding the request
/// to the remote provider verbatim.
pub struct RpcAdapter {
    engine: Arc<Simulator>,
    remote: Arc<dyn ChainRpc>,
}

impl RpcAdapter {
    pub fn new(engine: Arc<Simulator>) -> Self {
        let remote = engine.remote();
        Self { engine, remote }
    }

    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcHandlerError> {
        match self.handle(method, params.clone()).await {
            Err(RpcHandlerError::FallbackToRemote) => {
                debug!(target: "mirage::rpc", method, "forwarding to remote provider");
                self.remote
                    .raw_request(method.to_string(), params)
                    .await
                    .map_err(|err| RpcHandlerError::Internal(err.to_string()))
            }
            other => other,
        }
    }

    pub async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcHandlerError> {
        match method {
            "eth_blockNumber" => Ok(json!(U64::from(self.engine.block_number()))),
            "eth_call" => {
                let request: TransactionRequest = param(&params, 0, "transaction")?;
                let result = self.engine.call(&request).await.map_err(classify)?;
                Ok(json!(result.value))
            }
            "eth_estimateGas" => {
                let request: TransactionRequest = param(&params, 0, "transaction")?;
                let gas = self.engine.estimate_gas(&request).await.map_err(classify)?;
                Ok(json!(U64::from(gas)))
            }
            // the block tag is ignored on the three state reads in this
            // release; they always answer from the current overlay
            "eth_getBalance" => {
                let address: Address = param(&params, 0, "address")?;
                let balance = self.engine.get_balance(address).await.map_err(classify)?;
                Ok(json!(balance))
            }
            "eth_getCode" => {
                let address: Address = param(&params, 0, "address")?;
                let code = self.engine.get_code(address).await.map_err(classify)?;
                Ok(json!(code))
            }
            "eth_getStorageAt" => {
                let address: Address = param(&params, 0, "address")?;
                let slot: U256 = param(&params, 1, "slot")?;
                let value = self
                    .engine
                    .get_storage_at(address, B256::from(slot.to_be_bytes::<32>()))
                    .await
                    .map_err(classify)?;
                Ok(json!(value))
            }
            "eth_getTransactionCount" => {
                let address: Address = param(&params, 0, "address")?;
                let nonce = self.engine.get_nonce(address).await.map_err(classify)?;
                Ok(json!(U64::from(nonce)))
            }
            "eth_getBlockByNumber" => {
                let tag: BlockTag = param(&params, 0, "block tag")?;
                let full: bool = opt_param(&params, 1).unwrap_or(false);
                match self.resolve_tag(tag)? {
                    Some(block) => Ok(self.wire_block(&block, full)),
                    None => Ok(Value::Null),
                }
            }
            "eth_getBlockByHash" => {
                let hash: B256 = param(&params, 0, "block hash")?;
                let full: bool = opt_param(&params, 1).unwrap_or(false);
                match self.engine.simulated_block_by_hash(hash) {
                    Some(block) => Ok(self.wire_block(&block, full)),
                    None => Err(RpcHandlerError::FallbackToRemote),
                }
            }
            "eth_getBlockTransactionCountByNumber" => {
                let tag: BlockTag = param(&params, 0, "block tag")?;
                match self.resolve_tag(tag)? {
                    Some(block) => Ok(json!(U64::from(block.transactions.len() as u64))),
                    None => Ok(Value::Null),
                }
            }
            "eth_getBlockTransactionCountByHash" => {
                let hash: B256 = param(&params, 0, "block hash")?;
                match self.engine.simulated_block_by_hash(hash) {
                    Some(block) => Ok(json!(U64::from(block.transactions.len() as u64))),
                    None => Err(RpcHandlerError::FallbackToRemote),
                }
            }
            "eth_getTransactionByHash" => {
                let hash: B256 = param(&params, 0, "transaction hash")?;
                match self.engine.get_transaction(&hash.to_string()) {
                    Some(_) => Ok(self.wire_transaction(&hash.to_string())),
                    None => Err(RpcHandlerError::FallbackToRemote),
                }
            }
            "eth_getTransactionByBlockNumberAndIndex" => {
                let tag: BlockTag = param(&params, 0, "block tag")?;
                let index: U64 = param(&params, 1, "index")?;
                match self.resolve_tag(tag)? {
                    Some(block) => Ok(self.transaction_at(&block, index.to::<u64>() as usize)),
                    None => Ok(Value::Null),
                }
            }
            "eth_getTransactionByBlockHashAndIndex" => {
                let hash: B256 = param(&params, 0, "block hash")?;
                let index: U64 = param(&params, 1, "index")?;
                match self.engine.simulated_block_by_hash(hash) {
                    Some(block) => Ok(self.transaction_at(&block, index.to::<u64>() as usize)),
                    None => Err(RpcHandlerError::FallbackToRemote),
                }
            }
            "eth_getTransactionReceipt" => {
                let hash: B256 = param(&params, 0, "transaction hash")?;
                match self.engine.get_transaction_result(&hash.to_string()) {
                    Some(result) => Ok(self.wire_receipt(&result)),
                    None => Err(RpcHandlerError::FallbackToRemote),
                }
            }
            "eth_sendTransaction" => {
                let request: TransactionRequest = param(&params, 0, "transaction")?;
                let result = self.engine.execute(&request).await.map_err(classify)?;
                Ok(json!(result.hash))
            }
            "eth_sendRawTransaction" => {
                let raw: Bytes = param(&params, 0, "raw transaction")?;
                let envelope = TxEnvelope::decode_2718(&mut raw.as_ref()).map_err(|err| {
                    RpcHandlerError::InvalidParams(format!("could not decode transaction: {err}"))
                })?;
                let result = self
                    .engine
                    .execute_typed_transaction(envelope)
                    .await
                    .map_err(classify)?;
                Ok(json!(result.hash))
            }
            _ => Err(RpcHandlerError::FallbackToRemote),
        }
    }

    /// Map a block tag onto the simulated chain, signalling remote fallback
    /// for forked history.
    fn resolve_tag(&self, tag: BlockTag) -> Result<Option<SimulatedBlock>, RpcHandlerError> {
        match tag {
            BlockTag::Latest | BlockTag::Pending | BlockTag::Safe | BlockTag::Finalized => self
                .engine
                .latest_simulated_block()
                .map(Some)
                .ok_or(RpcHandlerError::FallbackToRemote),
            BlockTag::Earliest => Err(RpcHandlerError::FallbackToRemote),
            BlockTag::Number(number) if self.engine.is_simulated_block_number(number) => {
                Ok(self.engine.simulated_block_by_number(number))
            }
            BlockTag::Number(_) => Err(RpcHandlerError::FallbackToRemote),
        }
    }

    fn wire_block(&self, block: &SimulatedBlock, full: bool) -> Value {
        let transactions: Vec<Value> = if full {
            block
                .transactions
                .iter()
                .map(|hash| self.wire_transaction(hash))
                .collect()
        } else {
            block.transactions.iter().map(|hash| json!(hash)).collect()
        };

        json!(WireBlock {
            number: U64::from(block.number),
            hash: block.hash,
            parent_hash: block.parent_hash,
            nonce: "0x0000000000000000".to_string(),
            sha3_uncles: B256::ZERO,
            logs_bloom: Bloom::default(),
            transactions_root: B256::ZERO,
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            miner: Address::ZERO,
            difficulty: U256::ZERO,
            total_difficulty: U256::ZERO,
            extra_data: Bytes::new(),
            size: U64::ZERO,
            gas_limit: U64::from(block.gas_limit),
            gas_used: U64::from(block.gas_used),
            timestamp: U64::from(block.timestamp),
            base_fee_per_gas: U64::from(block.base_fee),
            transactions,
            uncles: Vec::new(),
        })
    }

    fn transaction_at(&self, block: &SimulatedBlock, index: usize) -> Value {
        match block.transactions.get(index) {
            Some(hash) => self.wire_transaction(hash),
            None => Value::Null,
        }
    }

    fn wire_transaction(&self, hash: &str) -> Value {
        let Some(entry) = self.engine.get_transaction(hash) else {
            return Value::Null;
        };

        let tx = &entry.transaction;
        let from = tx
            .caller(self.engine.signature_matcher())
            .unwrap_or_default();
        let block = entry
            .result
            .block_number
            .and_then(|number| self.engine.simulated_block_by_number(number));
        let index = block.as_ref().and_then(|block| {
            block
                .transactions
                .iter()
                .position(|candidate| candidate == hash)
        });

        json!(WireTransaction {
            hash: entry.result.hash.clone(),
            nonce: U64::from(tx.nonce()),
            block_hash: block.as_ref().map(|block| block.hash),
            block_number: entry.result.block_number.map(U64::from),
            transaction_index: index.map(|index| U64::from(index as u64)),
            from,
            to: tx.to().to().copied(),
            value: tx.value(),
            gas: U64::from(tx.gas_limit()),
            gas_price: U256::from(tx.gas_price()),
            input: tx.input(),
            transaction_type: U64::from(tx.tx_type()),
        })
    }

    fn wire_receipt(&self, result: &TxResult) -> Value {
        let entry = self.engine.get_transaction(&result.hash);
        let (from, to) = entry
            .map(|entry| {
                let tx = entry.transaction;
                (
                    tx.caller(self.engine.signature_matcher()).unwrap_or_default(),
                    tx.to().to().copied(),
                )
            })
            .unwrap_or_default();
        let block = result
            .block_number
            .and_then(|number| self.engine.simulated_block_by_number(number));

        let logs: Vec<Value> = result
            .receipt
            .logs
            .iter()
            .enumerate()
            .map(|(index, log)| {
                json!({
                    "address": log.address,
                    "topics": log.topics,
                    "data": log.data,
                    "blockNumber": result.block_number.map(U64::from),
                    "blockHash": block.as_ref().map(|block| block.hash),
                    "transactionHash": result.hash,
                    "transactionIndex": "0x0",
                    "logIndex": U64::from(index as u64),
                    "removed": false,
                })
            })
            .collect();

        json!({
            "transactionHash": result.hash,
            "transactionIndex": "0x0",
            "blockHash": block.as_ref().map(|block| block.hash).unwrap_or_default(),
            "blockNumber": U64::from(result.block_number.unwrap_or_default()),
            "from": from,
            "to": to,
            "cumulativeGasUsed": U64::from(result.receipt.cumulative_gas_used),
            "gasUsed": U64::from(result.receipt.gas_used),
            "contractAddress": result.receipt.created_address,
            "logs": logs,
            "logsBloom": result.receipt.logs_bloom.unwrap_or_default(),
            "status": match result.receipt.status {
                ExecutionStatus::Success => "0x1",
                ExecutionStatus::Failure => "0x0",
            },
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireBlock {
    number: U64,
    hash: B256,
    parent_hash: B256,
    nonce: String,
    sha3_uncles: B256,
    logs_bloom: Bloom,
    transactions_root: B256,
    state_root: B256,
    receipts_root: B256,
    miner: Address,
    difficulty: U256,
    total_difficulty: U256,
    extra_data: Bytes,
    size: U64,
    gas_limit: U64,
    gas_used: U64,
    timestamp: U64,
    base_fee_per_gas: U64,
    transactions: Vec<Value>,
    uncles: Vec<B256>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTransaction {
    hash: String,
    nonce: U64,
    block_hash: Option<B256>,
    block_number: Option<U64>,
    transaction_index: Option<U64>,
    from: Address,
    to: Option<Address>,
    value: U256,
    gas: U64,
    gas_price: U256,
    input: Bytes,
    #[serde(rename = "type")]
    transaction_type: U64,
}

fn param<T: DeserializeOwned>(
    params: &Value,
    index: usize,
    name: &str,
) -> Result<T, RpcHandlerError> {
    let value = params.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|err| RpcHandlerError::InvalidParams(format!("{name}: {err}")))
}

fn opt_param<T: DeserializeOwned>(params: &Value, index: usize) -> Option<T> {
    params
        .get(index)
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
}

fn classify(err: eyre::Report) -> RpcHandlerError {
    if let Some(sim) = err.downcast_ref::<SimulationError>() {
        return match sim {
            SimulationError::InvalidArgument(message) => {
                RpcHandlerError::InvalidParams(message.clone())
            }
            _ => RpcHandlerError::Internal(err.to_string()),
        };
    }

    if let Some(evm) = err.downcast_ref::<EvmError>() {
        return match evm {
            EvmError::Revert { data, .. } => RpcHandlerError::Execution {
                message: evm.to_string(),
                data: Some(data.to_string()),
            },
            EvmError::Generic(message) => RpcHandlerError::Execution {
                message: message.clone(),
                data: None,
            },
        };
    }

    RpcHandlerError::Internal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_the_wire_contract() {
        assert_eq!(
            RpcHandlerError::InvalidParams("bad".into()).code(),
            -32602
        );
        assert_eq!(
            RpcHandlerError::Execution {
                message: "reverted".into(),
                data: None
            }
            .code(),
            -32000
        );
        assert_eq!(RpcHandlerError::FallbackToRemote.code(), 32552225);
    }
}
