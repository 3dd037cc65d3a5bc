use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use alloy::consensus::{Header, TxEnvelope};
use alloy::primitives::{Address, Bloom, Bytes, TxKind, B256, U256};
use alloy::rpc::types::TransactionRequest;
use eyre::{eyre, Result};
use rand::Rng;
use revm::primitives::{ExecutionResult, TxEnv};
use tracing::{debug, info};

use mirage_common::errors::{EvmError, SimulationError};
use mirage_common::types::{CallResult, ExecutionStatus, LogEntry, Receipt, TxResult};

use crate::evm::{BlockContext, EvmDriver, ExecFlags, TransactError};
use crate::prepare::{PreparedTransaction, TransactionPreparer};
use crate::revert::decode_revert_reason;
use crate::rpc::{ChainRpc, HttpRpc, RemoteBlock};
use crate::signer::SignatureMatcher;
use crate::state::OverlayState;
use crate::time;

/// A block synthesized for a fully signed bundle. Its external number is
/// `fork_block_number + k` for the k-th simulated block.
#[derive(Debug, Clone)]
pub struct SimulatedBlock {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee: u64,
    /// Hashes of the transactions the block carries, in execution order.
    pub transactions: Vec<String>,
}

#[derive(Default)]
struct SimulatedChain {
    /// 0-based delta above the fork height, bumped once per synthesized block.
    counter: u64,
    last_timestamp: u64,
    blocks: Vec<SimulatedBlock>,
}

/// An executed transaction as kept in the hash-keyed index.
#[derive(Debug, Clone)]
pub struct IndexedTransaction {
    pub transaction: PreparedTransaction,
    pub result: TxResult,
}

/// The simulation engine: forks a live chain at a block height and executes
/// transactions and calls against a mutable overlay on top of it.
///
/// One logical caller at a time; every `execute*` is an all-or-nothing
/// checkpoint over the whole bundle, and `call` never leaves state behind.
pub struct Simulator {
    remote: Arc<dyn ChainRpc>,
    state: OverlayState,
    matcher: SignatureMatcher,
    preparer: TransactionPreparer,
    driver: EvmDriver,
    chain_id: u64,
    fork_block_number: u64,
    fork_header: RemoteBlock,
    chain: RwLock<SimulatedChain>,
    index: RwLock<HashMap<String, IndexedTransaction>>,
}

impl Simulator {
    /// Fork `remote` at `fork_block` (the remote head when `None`). The
    /// chain id and fork header are fetched eagerly; everything else is
    /// pulled in lazily as executions touch it.
    pub async fn create(remote: Arc<dyn ChainRpc>, fork_block: Option<u64>) -> Result<Self> {
        let chain_id = remote.chain_id().await?;
        let fork_block_number = match fork_block {
            Some(number) => number,
            None => remote.block_number().await?,
        };
        let fork_header = remote
            .get_block(fork_block_number.into())
            .await?
            .ok_or_else(|| eyre!("fork block {fork_block_number} not found"))?;

        let state = OverlayState::new(remote.clone(), fork_block_number);
        state.insert_block_hash(fork_block_number, fork_header.hash);

        let matcher = SignatureMatcher::default();
        let preparer = TransactionPreparer::new(state.clone(), matcher.clone(), chain_id);
        let driver = EvmDriver::new(state.clone(), chain_id);

        let chain = SimulatedChain {
            counter: 0,
            last_timestamp: time::now().max(fork_header.timestamp),
            blocks: Vec::new(),
        };

        info!(
            target: "mirage::engine",
            chain_id,
            fork_block_number,
            "forked remote chain"
        );

        Ok(Self {
            remote,
            state,
            matcher,
            preparer,
            driver,
            chain_id,
            fork_block_number,
            fork_header,
            chain: RwLock::new(chain),
            index: RwLock::new(HashMap::new()),
        })
    }

    /// Convenience constructor over an HTTP endpoint.
    pub async fn connect(url: &str, fork_block: Option<u64>) -> Result<Self> {
        let remote = Arc::new(HttpRpc::new(url)?);
        Self::create(remote, fork_block).await
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn fork_block_number(&self) -> u64 {
        self.fork_block_number
    }

    pub fn remote(&self) -> Arc<dyn ChainRpc> {
        self.remote.clone()
    }

    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    // block numbering

    /// Translate a simulated delta into an external block number.
    pub fn resolve_block_number(&self, number: u64) -> u64 {
        self.fork_block_number + number
    }

    /// Translate an external block number back into a simulated delta.
    pub fn reverse_block_number(&self, external: u64) -> u64 {
        external - self.fork_block_number
    }

    /// External numbers above the fork height belong to simulated blocks;
    /// everything at or below it is forked history served by the remote.
    pub fn is_simulated_block_number(&self, external: u64) -> bool {
        external > self.fork_block_number
    }

    /// The current external head number, `fork + counter`.
    pub fn block_number(&self) -> u64 {
        self.fork_block_number + self.chain.read().unwrap().counter
    }

    pub fn latest_simulated_block(&self) -> Option<SimulatedBlock> {
        self.chain.read().unwrap().blocks.last().cloned()
    }

    pub fn simulated_block_by_number(&self, external: u64) -> Option<SimulatedBlock> {
        self.chain
            .read()
            .unwrap()
            .blocks
            .iter()
            .find(|block| block.number == external)
            .cloned()
    }

    pub fn simulated_block_by_hash(&self, hash: B256) -> Option<SimulatedBlock> {
        self.chain
            .read()
            .unwrap()
            .blocks
            .iter()
            .find(|block| block.hash == hash)
            .cloned()
    }

    // account helpers

    /// Register a public key for impersonation and hand back the synthetic
    /// private key transactions from that address will be signed with.
    pub fn impersonate_account(&self, public_key: &[u8]) -> Result<B256> {
        let address = self.matcher.register_public_key(public_key)?;
        self.matcher.simulation_private_key(address)
    }

    pub fn signature_matcher(&self) -> &SignatureMatcher {
        &self.matcher
    }

    pub async fn set_balance(&self, address: Address, balance: U256) -> Result<()> {
        self.state.set_balance(address, balance).await
    }

    pub async fn set_storage(&self, address: Address, key: B256, value: B256) -> Result<()> {
        self.state
            .set_storage(address, U256::from_be_bytes(key.0), U256::from_be_bytes(value.0))
            .await
    }

    pub async fn get_balance(&self, address: Address) -> Result<U256> {
        Ok(self.state.account(address).await?.balance)
    }

    pub async fn get_nonce(&self, address: Address) -> Result<u64> {
        Ok(self.state.account(address).await?.nonce)
    }

    pub async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.state.code(address).await
    }

    pub async fn get_storage_at(&self, address: Address, key: B256) -> Result<B256> {
        let value = self
            .state
            .storage_slot(address, U256::from_be_bytes(key.0))
            .await?;
        Ok(B256::from(value.to_be_bytes::<32>()))
    }

    // execution

    /// Static read-only call. Runs between a checkpoint and an unconditional
    /// revert, so nothing it does survives.
    pub async fn call(&self, request: &TransactionRequest) -> Result<CallResult> {
        let Some(TxKind::Call(to)) = request.to else {
            return Err(SimulationError::InvalidArgument(
                "call requires a destination address".to_string(),
            )
            .into());
        };

        let head = self.head_context();
        let tx = TxEnv {
            caller: request.from.unwrap_or_default(),
            gas_limit: request.gas.unwrap_or(head.gas_limit),
            gas_price: U256::from(request.gas_price.unwrap_or_default()),
            transact_to: TxKind::Call(to),
            value: request.value.unwrap_or_default(),
            data: request.input.input().cloned().unwrap_or_default(),
            nonce: None,
            chain_id: Some(self.chain_id),
            access_list: request
                .access_list
                .clone()
                .map(|list| list.0)
                .unwrap_or_default(),
            gas_priority_fee: None,
            ..TxEnv::default()
        };

        self.state.checkpoint();
        let res = self.driver.transact(tx, &head, ExecFlags::relaxed()).await;
        self.state.revert();

        let out = match res {
            Ok(out) => out,
            Err(TransactError::State(err)) => return Err(err),
            Err(TransactError::Invalid(message)) => {
                return Err(EvmError::Generic(message).into())
            }
        };

        match out.result {
            ExecutionResult::Success {
                gas_used, output, ..
            } => Ok(CallResult {
                value: output.into_data(),
                gas_used,
            }),
            ExecutionResult::Revert { output, .. } => Err(EvmError::Revert {
                reason: decode_revert_reason(&output),
                data: output,
            }
            .into()),
            ExecutionResult::Halt { reason, .. } => {
                Err(EvmError::Generic(format!("{reason:?}")).into())
            }
        }
    }

    pub async fn estimate_gas(&self, request: &TransactionRequest) -> Result<u64> {
        self.preparer
            .estimate_gas(request, &self.head_context(), &self.driver)
            .await
    }

    pub async fn execute(&self, request: &TransactionRequest) -> Result<TxResult> {
        let mut results = self.execute_bundle(std::slice::from_ref(request)).await?;
        Ok(results.remove(0))
    }

    /// Execute an ordered group of transactions atomically: either every
    /// transaction's effects commit, or the whole bundle is rolled back.
    /// Per-transaction failures ride inside the returned receipts.
    pub async fn execute_bundle(&self, requests: &[TransactionRequest]) -> Result<Vec<TxResult>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let head = self.head_context();
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            prepared.push(self.preparer.prepare(request, &head, &self.driver).await?);
        }

        self.execute_prepared(prepared).await
    }

    /// The raw-transaction path: execute an already-signed envelope without
    /// going through the preparer.
    pub async fn execute_typed_transaction(&self, envelope: TxEnvelope) -> Result<TxResult> {
        let mut results = self
            .execute_prepared(vec![PreparedTransaction::Signed(envelope)])
            .await?;
        Ok(results.remove(0))
    }

    pub async fn execute_prepared(
        &self,
        transactions: Vec<PreparedTransaction>,
    ) -> Result<Vec<TxResult>> {
        if transactions.is_empty() {
            return Ok(Vec::new());
        }

        let fully_signed = transactions.iter().all(PreparedTransaction::is_signed);

        self.state.checkpoint();
        let run = self.run_bundle(&transactions, fully_signed).await;

        let (results, block) = match run {
            Ok(out) => out,
            Err(err) => {
                self.state.revert();
                return Err(err);
            }
        };

        let failed = results.iter().any(|result| result.error.is_some());
        if failed {
            self.state.revert();
            debug!(target: "mirage::engine", "bundle reverted");
        } else {
            self.state.commit();
            if let Some(block) = block {
                self.state.insert_block_hash(block.number, block.hash);
                self.chain.write().unwrap().blocks.push(block);
            }
        }

        let mut index = self.index.write().unwrap();
        for (transaction, result) in transactions.into_iter().zip(results.iter()) {
            index.insert(
                result.hash.clone(),
                IndexedTransaction {
                    transaction,
                    result: result.clone(),
                },
            );
        }

        Ok(results)
    }

    async fn run_bundle(
        &self,
        transactions: &[PreparedTransaction],
        fully_signed: bool,
    ) -> Result<(Vec<TxResult>, Option<SimulatedBlock>)> {
        let (context, mut block) = if fully_signed {
            let parent = self.head_context();
            let parent_hash = self.head_hash();

            let mut chain = self.chain.write().unwrap();
            chain.counter += 1;
            chain.last_timestamp += 1;

            let bundle_gas: u64 = transactions.iter().map(PreparedTransaction::gas_limit).sum();
            let gas_limit = parent.gas_limit.max(bundle_gas);
            let number = self.fork_block_number + chain.counter;
            let timestamp = chain.last_timestamp;

            let header = Header {
                parent_hash,
                number,
                gas_limit,
                timestamp,
                base_fee_per_gas: Some(parent.base_fee),
                ..Default::default()
            };
            let hash = header.hash_slow();

            let context = BlockContext {
                number,
                timestamp,
                gas_limit,
                base_fee: parent.base_fee,
                coinbase: Address::ZERO,
                prevrandao: B256::ZERO,
            };
            let block = SimulatedBlock {
                number,
                hash,
                parent_hash,
                timestamp,
                gas_limit,
                gas_used: 0,
                base_fee: parent.base_fee,
                transactions: Vec::new(),
            };

            (context, Some(block))
        } else {
            (self.head_context(), None)
        };

        let flags = if fully_signed {
            ExecFlags {
                skip_balance: true,
                ..ExecFlags::default()
            }
        } else {
            ExecFlags {
                skip_balance: true,
                skip_nonce: true,
                skip_block_gas_limit: true,
                skip_base_fee: false,
            }
        };

        let mut results = Vec::with_capacity(transactions.len());
        let mut cumulative_gas = 0u64;

        for transaction in transactions {
            let caller = transaction.caller(&self.matcher)?;
            let tx_env = transaction.to_tx_env(caller, flags.skip_nonce);

            let (receipt, error) = match self.driver.transact(tx_env, &context, flags).await {
                Ok(out) => {
                    self.state.apply_evm_state(out.state);
                    cumulative_gas += out.result.gas_used();
                    build_receipt(&out.result, cumulative_gas)
                }
                Err(TransactError::Invalid(message)) => (
                    Receipt {
                        status: ExecutionStatus::Failure,
                        cumulative_gas_used: cumulative_gas,
                        gas_used: 0,
                        logs: Vec::new(),
                        created_address: None,
                        state_root: None,
                        logs_bloom: None,
                        revert_data: Bytes::new(),
                    },
                    Some(message),
                ),
                Err(TransactError::State(err)) => {
                    return Err(SimulationError::Upstream(err).into())
                }
            };

            let hash = transaction
                .tx_hash()
                .map(|hash| hash.to_string())
                .unwrap_or_else(placeholder_hash);

            results.push(TxResult {
                hash,
                block_number: block.as_ref().map(|block| block.number),
                receipt,
                error,
            });
        }

        if let Some(block) = block.as_mut() {
            block.gas_used = cumulative_gas;
            block.transactions = results.iter().map(|result| result.hash.clone()).collect();
        }

        Ok((results, block))
    }

    // transaction index

    pub fn get_transaction(&self, hash: &str) -> Option<IndexedTransaction> {
        self.index.read().unwrap().get(&hash.to_lowercase()).cloned()
    }

    pub fn get_transaction_result(&self, hash: &str) -> Option<TxResult> {
        self.get_transaction(hash).map(|entry| entry.result)
    }

    // head bookkeeping

    fn head_context(&self) -> BlockContext {
        match self.chain.read().unwrap().blocks.last() {
            Some(block) => BlockContext {
                number: block.number,
                timestamp: block.timestamp,
                gas_limit: block.gas_limit,
                base_fee: block.base_fee,
                coinbase: Address::ZERO,
                prevrandao: B256::ZERO,
            },
            None => BlockContext {
                number: self.fork_header.number,
                timestamp: self.fork_header.timestamp,
                gas_limit: self.fork_header.gas_limit,
                base_fee: self.fork_header.base_fee_per_gas.unwrap_or_default(),
                coinbase: Address::ZERO,
                prevrandao: B256::ZERO,
            },
        }
    }

    fn head_hash(&self) -> B256 {
        self.chain
            .read()
            .unwrap()
            .blocks
            .last()
            .map(|block| block.hash)
            .unwrap_or(self.fork_header.hash)
    }
}

fn build_receipt(result: &ExecutionResult, cumulative_gas: u64) -> (Receipt, Option<String>) {
    match result {
        ExecutionResult::Success {
            gas_used,
            logs,
            output,
            ..
        } => {
            let entries = logs
                .iter()
                .map(|log| LogEntry {
                    address: log.address,
                    topics: log.data.topics().to_vec(),
                    data: log.data.data.clone(),
                })
                .collect();

            let mut bloom = Bloom::default();
            for log in logs {
                bloom.accrue_log(log);
            }

            (
                Receipt {
                    status: ExecutionStatus::Success,
                    cumulative_gas_used: cumulative_gas,
                    gas_used: *gas_used,
                    logs: entries,
                    created_address: output.address().copied(),
                    state_root: None,
                    logs_bloom: Some(bloom),
                    revert_data: Bytes::new(),
                },
                None,
            )
        }
        ExecutionResult::Revert { gas_used, output } => (
            Receipt {
                status: ExecutionStatus::Failure,
                cumulative_gas_used: cumulative_gas,
                gas_used: *gas_used,
                logs: Vec::new(),
                created_address: None,
                state_root: None,
                logs_bloom: None,
                revert_data: output.clone(),
            },
            Some(format!(
                "execution reverted: {}",
                decode_revert_reason(output)
            )),
        ),
        ExecutionResult::Halt { reason, gas_used } => (
            Receipt {
                status: ExecutionStatus::Failure,
                cumulative_gas_used: cumulative_gas,
                gas_used: *gas_used,
                logs: Vec::new(),
                created_address: None,
                state_root: None,
                logs_bloom: None,
                revert_data: Bytes::new(),
            },
            Some(format!("evm halted: {reason:?}")),
        ),
    }
}

/// 32-byte stand-in for transactions that cannot be hashed: twelve zero
/// bytes followed by twenty random ones.
fn placeholder_hash() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[12..]);
    B256::from(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock_rpc::MockRpc;

    #[tokio::test]
    async fn block_number_helpers_are_inverses() {
        let remote = Arc::new(MockRpc::new(1, 2_000_000));
        let engine = Simulator::create(remote, None).await.unwrap();

        assert_eq!(engine.fork_block_number(), 2_000_000);
        assert_eq!(engine.block_number(), 2_000_000);

        for delta in [0, 1, 17, 123_456] {
            let external = engine.resolve_block_number(delta);
            assert_eq!(engine.reverse_block_number(external), delta);
            assert_eq!(engine.is_simulated_block_number(external), delta > 0);
        }
    }

    #[test]
    fn placeholder_hash_shape() {
        let hash = placeholder_hash();
        assert!(hash.starts_with("0x"));
        assert_eq!(hash.len(), 66);
        // first twelve bytes are zero
        assert_eq!(&hash[2..26], "0".repeat(24));
    }
}
