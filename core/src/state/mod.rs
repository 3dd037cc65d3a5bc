use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use eyre::Result;
use revm::primitives::EvmState;
use tracing::{trace, warn};

use mirage_common::errors::SimulationError;
use mirage_common::types::{Account, EMPTY_CODE_HASH};

use crate::rpc::ChainRpc;

pub(crate) mod db;

/// Copy-on-write account, code and storage state layered over a remote
/// chain pinned at the fork height.
///
/// Reads fall through to the remote provider and are cached locally; writes
/// stay local. Checkpoints nest: every write is journaled into the innermost
/// open frame, `commit` folds a frame into its parent, `revert` undoes the
/// frame and then replays the deployed-code registry so simulated contract
/// deployments survive reverts of unrelated transactions.
#[derive(Clone)]
pub struct OverlayState {
    inner: Arc<RwLock<Overlay>>,
    remote: Arc<dyn ChainRpc>,
    fork_block: u64,
}

#[derive(Default)]
struct Overlay {
    accounts: HashMap<Address, Account>,
    code: HashMap<Address, Bytes>,
    code_by_hash: HashMap<B256, Bytes>,
    storage: HashMap<Address, HashMap<U256, U256>>,
    block_hashes: HashMap<u64, B256>,
    deployed_contracts: HashMap<Address, Bytes>,
    frames: Vec<Vec<Undo>>,
    proof_support: Option<bool>,
}

enum Undo {
    Account(Address, Option<Account>),
    Code(Address, Option<Bytes>),
    Storage(Address, U256, Option<U256>),
}

impl OverlayState {
    pub fn new(remote: Arc<dyn ChainRpc>, fork_block: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Overlay::default())),
            remote,
            fork_block,
        }
    }

    pub fn fork_block(&self) -> u64 {
        self.fork_block
    }

    // local reads

    pub fn account_local(&self, address: Address) -> Option<Account> {
        self.inner.read().unwrap().accounts.get(&address).copied()
    }

    pub fn code_local(&self, address: Address) -> Option<Bytes> {
        self.inner.read().unwrap().code.get(&address).cloned()
    }

    pub fn code_by_hash_local(&self, hash: B256) -> Option<Bytes> {
        self.inner.read().unwrap().code_by_hash.get(&hash).cloned()
    }

    pub fn storage_local(&self, address: Address, slot: U256) -> Option<U256> {
        self.inner
            .read()
            .unwrap()
            .storage
            .get(&address)
            .and_then(|slots| slots.get(&slot))
            .copied()
    }

    pub fn block_hash_local(&self, number: u64) -> Option<B256> {
        self.inner
            .read()
            .unwrap()
            .block_hashes
            .get(&number)
            .copied()
    }

    /// The deployed-code registry entry for `address`, if a simulated
    /// deployment wrote code there.
    pub fn deployed_code(&self, address: Address) -> Option<Bytes> {
        self.inner
            .read()
            .unwrap()
            .deployed_contracts
            .get(&address)
            .cloned()
    }

    // fall-through reads

    /// The account for `address`, fetched from the remote provider on a
    /// local miss. The returned account never carries the all-zero code
    /// hash; the empty-code marker is substituted before caching.
    pub async fn account(&self, address: Address) -> Result<Account> {
        if let Some(account) = self.account_local(address) {
            return Ok(account);
        }

        let (account, code) = self.fetch_account(address).await?;

        let mut overlay = self.inner.write().unwrap();
        if let Some(cached) = overlay.accounts.get(&address) {
            return Ok(*cached);
        }

        Overlay::insert_account(&mut overlay, address, account);
        if let Some(code) = code {
            if !code.is_empty() {
                Overlay::insert_code(&mut overlay, address, code);
            }
        }

        Ok(account)
    }

    /// Contract code for `address`, fetched alongside the account on a miss.
    pub async fn code(&self, address: Address) -> Result<Bytes> {
        if let Some(code) = self.code_local(address) {
            return Ok(code);
        }

        let account = self.account(address).await?;
        if account.code_hash == EMPTY_CODE_HASH {
            return Ok(Bytes::new());
        }

        Ok(self.code_local(address).unwrap_or_default())
    }

    pub async fn storage_slot(&self, address: Address, slot: U256) -> Result<U256> {
        if let Some(value) = self.storage_local(address, slot) {
            return Ok(value);
        }

        trace!(target: "mirage::state", %address, %slot, "fetching storage slot");
        let value = self
            .remote
            .get_storage_at(address, slot, self.fork_block)
            .await
            .map_err(SimulationError::upstream)?;

        let mut overlay = self.inner.write().unwrap();
        if let Some(existing) = overlay
            .storage
            .get(&address)
            .and_then(|slots| slots.get(&slot))
        {
            return Ok(*existing);
        }
        Overlay::insert_storage(&mut overlay, address, slot, value);

        Ok(value)
    }

    pub async fn block_hash(&self, number: u64) -> Result<B256> {
        if let Some(hash) = self.block_hash_local(number) {
            return Ok(hash);
        }

        let block = self
            .remote
            .get_block(BlockNumberOrTag::Number(number))
            .await
            .map_err(SimulationError::upstream)?
            .ok_or_else(|| SimulationError::upstream(eyre::eyre!("block {number} not found")))?;

        self.insert_block_hash(number, block.hash);
        Ok(block.hash)
    }

    /// Record the hash of a synthesized block so `BLOCKHASH` resolves it.
    pub fn insert_block_hash(&self, number: u64, hash: B256) {
        self.inner
            .write()
            .unwrap()
            .block_hashes
            .insert(number, hash);
    }

    // writes

    pub fn set_account(&self, address: Address, account: Account) {
        let mut overlay = self.inner.write().unwrap();
        Overlay::insert_account(&mut overlay, address, account);
    }

    pub async fn set_balance(&self, address: Address, balance: U256) -> Result<()> {
        let mut account = self.account(address).await?;
        account.balance = balance;
        self.set_account(address, account);
        Ok(())
    }

    pub async fn set_storage(&self, address: Address, slot: U256, value: U256) -> Result<()> {
        // touch the account so the EVM sees it exist
        self.account(address).await?;
        let mut overlay = self.inner.write().unwrap();
        Overlay::insert_storage(&mut overlay, address, slot, value);
        Ok(())
    }

    /// Write contract code and record it in the deployed-code registry.
    pub fn put_code(&self, address: Address, code: Bytes) {
        let mut overlay = self.inner.write().unwrap();
        Overlay::insert_deployed_code(&mut overlay, address, code);
    }

    /// Fold the outcome of an executed transaction into the overlay. All
    /// writes are journaled; code written by deployments enters the
    /// deployed-code registry.
    pub fn apply_evm_state(&self, changes: EvmState) {
        let mut overlay = self.inner.write().unwrap();

        for (address, change) in changes {
            if !change.is_touched() {
                continue;
            }

            if change.is_selfdestructed() {
                Overlay::insert_account(&mut overlay, address, Account::default());
                let prev = overlay.code.remove(&address);
                Overlay::journal(&mut overlay, Undo::Code(address, prev));
                continue;
            }

            let info = change.info;
            let mut account = overlay.accounts.get(&address).copied().unwrap_or_default();
            account.balance = info.balance;
            account.nonce = info.nonce;
            account.code_hash = if info.code_hash == B256::ZERO {
                EMPTY_CODE_HASH
            } else {
                info.code_hash
            };
            Overlay::insert_account(&mut overlay, address, account);

            if let Some(code) = info.code {
                if !code.is_empty() {
                    let bytes = code.original_bytes();
                    if overlay.code.get(&address) != Some(&bytes) {
                        Overlay::insert_deployed_code(&mut overlay, address, bytes);
                    }
                }
            }

            for (slot, value) in change.storage {
                if value.present_value != value.original_value {
                    Overlay::insert_storage(&mut overlay, address, slot, value.present_value);
                }
            }
        }
    }

    // checkpoints

    pub fn checkpoint(&self) {
        self.inner.write().unwrap().frames.push(Vec::new());
    }

    pub fn commit(&self) {
        let mut overlay = self.inner.write().unwrap();
        if let Some(frame) = overlay.frames.pop() {
            if let Some(parent) = overlay.frames.last_mut() {
                parent.extend(frame);
            }
        }
    }

    /// Undo the innermost frame, then replay every recorded contract
    /// deployment back into the overlay. The registry itself is never
    /// cleared; deployments outlive reverts of unrelated transactions.
    pub fn revert(&self) {
        let mut overlay = self.inner.write().unwrap();

        if let Some(frame) = overlay.frames.pop() {
            for undo in frame.into_iter().rev() {
                Overlay::undo(&mut overlay, undo);
            }
        }

        let deployed: Vec<(Address, Bytes)> = overlay
            .deployed_contracts
            .iter()
            .map(|(address, code)| (*address, code.clone()))
            .collect();
        for (address, code) in deployed {
            Overlay::insert_code(&mut overlay, address, code);
        }
    }

    pub fn checkpoint_depth(&self) -> usize {
        self.inner.read().unwrap().frames.len()
    }

    // remote account retrieval

    async fn fetch_account(&self, address: Address) -> Result<(Account, Option<Bytes>)> {
        let proof_support = self.inner.read().unwrap().proof_support;

        if proof_support != Some(false) {
            match self
                .remote
                .get_proof(address, &[], self.fork_block)
                .await
            {
                Ok(proof) => {
                    self.inner.write().unwrap().proof_support = Some(true);

                    let account = Account {
                        balance: proof.balance,
                        nonce: proof.nonce,
                        code_hash: sanitize_code_hash(proof.code_hash),
                        storage_root: proof.storage_hash,
                    };

                    let code = if account.code_hash != EMPTY_CODE_HASH {
                        Some(
                            self.remote
                                .get_code(address, BlockNumberOrTag::Number(self.fork_block))
                                .await
                                .map_err(SimulationError::upstream)?,
                        )
                    } else {
                        None
                    };

                    return Ok((account, code));
                }
                Err(err) if proof_unsupported(&err) => {
                    warn!(
                        target: "mirage::state",
                        "eth_getProof unsupported by endpoint, falling back to balance/nonce/code"
                    );
                    self.inner.write().unwrap().proof_support = Some(false);
                }
                Err(err) => return Err(SimulationError::Upstream(err).into()),
            }
        }

        self.fetch_account_fallback(address).await
    }

    /// Synthesize an account from three concurrent point queries. The true
    /// storage root is unrecoverable on this path; `keccak256("")` stands in
    /// and the result is best-effort for contract accounts.
    async fn fetch_account_fallback(&self, address: Address) -> Result<(Account, Option<Bytes>)> {
        let (balance, nonce, code) = tokio::try_join!(
            self.remote.get_balance(address, self.fork_block),
            self.remote.get_transaction_count(address, self.fork_block),
            self.remote.get_code(address, BlockNumberOrTag::Latest),
        )
        .map_err(SimulationError::upstream)?;

        let code_hash = if code.is_empty() {
            EMPTY_CODE_HASH
        } else {
            keccak256(&code)
        };

        let account = Account {
            balance,
            nonce,
            code_hash,
            storage_root: EMPTY_CODE_HASH,
        };

        Ok((account, Some(code)))
    }
}

impl Overlay {
    fn journal(overlay: &mut Overlay, undo: Undo) {
        if let Some(frame) = overlay.frames.last_mut() {
            frame.push(undo);
        }
    }

    fn insert_account(overlay: &mut Overlay, address: Address, account: Account) {
        let prev = overlay.accounts.insert(address, account);
        Overlay::journal(overlay, Undo::Account(address, prev));
    }

    fn insert_storage(overlay: &mut Overlay, address: Address, slot: U256, value: U256) {
        let prev = overlay
            .storage
            .entry(address)
            .or_default()
            .insert(slot, value);
        Overlay::journal(overlay, Undo::Storage(address, slot, prev));
    }

    fn insert_code(overlay: &mut Overlay, address: Address, code: Bytes) {
        let hash = keccak256(&code);
        overlay.code_by_hash.insert(hash, code.clone());
        let prev = overlay.code.insert(address, code);
        Overlay::journal(overlay, Undo::Code(address, prev));

        let mut account = overlay.accounts.get(&address).copied().unwrap_or_default();
        account.code_hash = hash;
        Overlay::insert_account(overlay, address, account);
    }

    fn insert_deployed_code(overlay: &mut Overlay, address: Address, code: Bytes) {
        overlay.deployed_contracts.insert(address, code.clone());
        Overlay::insert_code(overlay, address, code);
    }

    fn undo(overlay: &mut Overlay, undo: Undo) {
        match undo {
            Undo::Account(address, prev) => match prev {
                Some(account) => {
                    overlay.accounts.insert(address, account);
                }
                None => {
                    overlay.accounts.remove(&address);
                }
            },
            Undo::Code(address, prev) => match prev {
                Some(code) => {
                    overlay.code.insert(address, code);
                }
                None => {
                    overlay.code.remove(&address);
                }
            },
            Undo::Storage(address, slot, prev) => {
                let slots = overlay.storage.entry(address).or_default();
                match prev {
                    Some(value) => {
                        slots.insert(slot, value);
                    }
                    None => {
                        slots.remove(&slot);
                    }
                }
            }
        }
    }
}

fn sanitize_code_hash(code_hash: B256) -> B256 {
    if code_hash == B256::ZERO {
        EMPTY_CODE_HASH
    } else {
        code_hash
    }
}

fn proof_unsupported(err: &eyre::Report) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("method not found")
        || message.contains("does not exist")
        || message.contains("not supported")
        || message.contains("-32601")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock_rpc::MockRpc;
    use alloy::primitives::address;

    fn state_with(mock: MockRpc) -> OverlayState {
        OverlayState::new(Arc::new(mock), 100)
    }

    #[tokio::test]
    async fn sanitizes_zero_code_hash() {
        let owner = address!("00000000000000000000000000000000000000aa");
        let mock = MockRpc::new(1, 100)
            .with_account(owner, U256::from(10), 3)
            .with_zero_code_hash(owner);

        let state = state_with(mock);
        let account = state.account(owner).await.unwrap();

        assert_eq!(account.code_hash, EMPTY_CODE_HASH);
        assert_eq!(account.nonce, 3);
    }

    #[tokio::test]
    async fn fallback_synthesizes_account_without_proof() {
        let owner = address!("00000000000000000000000000000000000000bb");
        let code = Bytes::from_static(&[0x60, 0x00]);
        let mock = MockRpc::new(1, 100)
            .with_account(owner, U256::from(42), 7)
            .with_code(owner, code.clone())
            .without_proof();

        let state = state_with(mock);
        let account = state.account(owner).await.unwrap();

        assert_eq!(account.balance, U256::from(42));
        assert_eq!(account.nonce, 7);
        assert_eq!(account.code_hash, keccak256(&code));
        assert_eq!(account.storage_root, EMPTY_CODE_HASH);
        assert_eq!(state.code_local(owner), Some(code));
    }

    #[tokio::test]
    async fn nested_checkpoints_commit_into_parent() {
        let owner = address!("00000000000000000000000000000000000000cc");
        let state = state_with(MockRpc::new(1, 100));

        state.checkpoint();
        state.set_account(owner, Account::default());
        state.checkpoint();
        state
            .set_storage(owner, U256::from(1), U256::from(9))
            .await
            .unwrap();
        state.commit();

        // inner writes folded into the outer frame; outer revert undoes both
        state.revert();

        assert_eq!(state.account_local(owner), None);
        assert_eq!(state.storage_local(owner, U256::from(1)), None);
    }

    #[tokio::test]
    async fn deployed_code_survives_revert() {
        let contract = address!("00000000000000000000000000000000000000dd");
        let code = Bytes::from_static(&[0x34, 0x33, 0x55, 0x00]);
        let state = state_with(MockRpc::new(1, 100));

        state.checkpoint();
        state.put_code(contract, code.clone());
        state.revert();

        assert_eq!(state.code_local(contract), Some(code.clone()));
        assert_eq!(state.deployed_code(contract), Some(code));
    }

    #[tokio::test]
    async fn revert_restores_written_storage() {
        let owner = address!("00000000000000000000000000000000000000ee");
        let mock = MockRpc::new(1, 100).with_storage(owner, U256::from(5), U256::from(11));
        let state = state_with(mock);

        let before = state.storage_slot(owner, U256::from(5)).await.unwrap();
        assert_eq!(before, U256::from(11));

        state.checkpoint();
        state
            .set_storage(owner, U256::from(5), U256::from(99))
            .await
            .unwrap();
        state.revert();

        assert_eq!(state.storage_local(owner, U256::from(5)), Some(U256::from(11)));
    }
}
