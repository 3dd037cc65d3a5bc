use alloy::primitives::{address, Address, B256, U256};
use eyre::{eyre, Report, Result};
use revm::primitives::{AccountInfo, Bytecode};
use revm::Database;
use tracing::trace;

use mirage_common::types::EMPTY_CODE_HASH;

use super::OverlayState;

/// A single piece of state the EVM tried to read before it was cached.
pub(crate) enum StateAccess {
    Basic(Address),
    Storage(Address, U256),
    BlockHash(u64),
}

/// revm [`Database`] over the overlay.
///
/// The `Database` trait is synchronous while remote fetches are not, so
/// reads only ever serve the local overlay. A miss records the access and
/// fails the transact; the driver awaits [`OverlayDb::update`] and retries
/// until the EVM runs against fully cached state.
pub(crate) struct OverlayDb {
    state: OverlayState,
    access: Option<StateAccess>,
}

impl OverlayDb {
    pub(crate) fn new(state: OverlayState) -> Self {
        Self {
            state,
            access: None,
        }
    }

    pub(crate) fn needs_update(&self) -> bool {
        self.access.is_some()
    }

    pub(crate) async fn update(&mut self) -> Result<()> {
        if let Some(access) = self.access.take() {
            match access {
                StateAccess::Basic(address) => {
                    self.state.account(address).await?;
                    self.state.code(address).await?;
                }
                StateAccess::Storage(address, slot) => {
                    self.state.storage_slot(address, slot).await?;
                }
                StateAccess::BlockHash(number) => {
                    self.state.block_hash(number).await?;
                }
            }
        }

        Ok(())
    }
}

impl Database for OverlayDb {
    type Error = Report;

    fn basic(&mut self, address: Address) -> Result<Option<AccountInfo>, Report> {
        if is_precompile(&address) {
            return Ok(Some(AccountInfo::default()));
        }

        let Some(account) = self.state.account_local(address) else {
            trace!(target: "mirage::state", %address, "account miss during execution");
            self.access = Some(StateAccess::Basic(address));
            return Err(eyre!("state missing: account {address}"));
        };

        let code = if account.code_hash == EMPTY_CODE_HASH {
            Bytecode::default()
        } else {
            match self.state.code_local(address) {
                Some(code) => Bytecode::new_raw(code),
                None => {
                    self.access = Some(StateAccess::Basic(address));
                    return Err(eyre!("state missing: code {address}"));
                }
            }
        };

        Ok(Some(AccountInfo {
            balance: account.balance,
            nonce: account.nonce,
            code_hash: account.code_hash,
            code: Some(code),
        }))
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Report> {
        if code_hash == EMPTY_CODE_HASH {
            return Ok(Bytecode::default());
        }

        self.state
            .code_by_hash_local(code_hash)
            .map(Bytecode::new_raw)
            .ok_or_else(|| eyre!("missing bytecode for code hash {code_hash}"))
    }

    fn storage(&mut self, address: Address, index: U256) -> Result<U256, Report> {
        match self.state.storage_local(address, index) {
            Some(value) => Ok(value),
            None => {
                trace!(target: "mirage::state", %address, slot = %index, "storage miss during execution");
                self.access = Some(StateAccess::Storage(address, index));
                Err(eyre!("state missing: storage {address} {index}"))
            }
        }
    }

    fn block_hash(&mut self, number: u64) -> Result<B256, Report> {
        match self.state.block_hash_local(number) {
            Some(hash) => Ok(hash),
            None => {
                self.access = Some(StateAccess::BlockHash(number));
                Err(eyre!("state missing: block hash {number}"))
            }
        }
    }
}

fn is_precompile(address: &Address) -> bool {
    address.le(&address!("0000000000000000000000000000000000000009")) && address.gt(&Address::ZERO)
}
