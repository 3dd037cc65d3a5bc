use alloy::primitives::{Address, B256, U256};
use eyre::Report;
use revm::primitives::{
    BlobExcessGasAndPrice, BlockEnv, CfgEnv, Env, EVMError, ResultAndState, SpecId, TxEnv,
};
use revm::Evm;
use thiserror::Error;
use tracing::trace;

use crate::state::db::OverlayDb;
use crate::state::OverlayState;

/// The block an execution runs inside: either the current head or a block
/// synthesized for a fully signed bundle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockContext {
    /// External block number (fork height plus simulated delta).
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub base_fee: u64,
    pub coinbase: Address,
    pub prevrandao: B256,
}

/// Validation the caller asked the EVM to skip.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ExecFlags {
    pub skip_balance: bool,
    pub skip_nonce: bool,
    pub skip_block_gas_limit: bool,
    pub skip_base_fee: bool,
}

impl ExecFlags {
    /// Everything off; used by `call` and gas estimation.
    pub fn relaxed() -> Self {
        Self {
            skip_balance: true,
            skip_nonce: true,
            skip_block_gas_limit: true,
            skip_base_fee: true,
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum TransactError {
    /// The transaction failed the EVM's own pre-execution validation.
    #[error("{0}")]
    Invalid(String),
    /// The overlay could not serve the state the execution needed.
    #[error(transparent)]
    State(#[from] Report),
}

/// Runs transactions against the overlay.
///
/// revm's `Database` is synchronous, so executions run in a loop: a state
/// miss aborts the transact, the missing piece is fetched from the remote
/// provider, and the transaction restarts against the richer cache.
pub(crate) struct EvmDriver {
    state: OverlayState,
    chain_id: u64,
}

impl EvmDriver {
    pub(crate) fn new(state: OverlayState, chain_id: u64) -> Self {
        Self { state, chain_id }
    }

    pub(crate) async fn transact(
        &self,
        tx: TxEnv,
        block: &BlockContext,
        flags: ExecFlags,
    ) -> Result<ResultAndState, TransactError> {
        let env = Box::new(Env {
            cfg: self.cfg_env(flags),
            block: block_env(block),
            tx,
        });

        let evm = Evm::builder()
            .with_db(OverlayDb::new(self.state.clone()))
            .with_env(env)
            .with_spec_id(SpecId::SHANGHAI)
            .build();
        let mut ctx = evm.into_context_with_handler_cfg();

        loop {
            if ctx.context.evm.db.needs_update() {
                ctx.context
                    .evm
                    .db
                    .update()
                    .await
                    .map_err(TransactError::State)?;
            }

            let mut evm = Evm::builder().with_context_with_handler_cfg(ctx).build();
            let res = evm.transact();
            ctx = evm.into_context_with_handler_cfg();

            match res {
                Ok(out) => {
                    trace!(
                        target: "mirage::evm",
                        gas_used = out.result.gas_used(),
                        success = out.result.is_success(),
                        "transaction executed"
                    );
                    break Ok(out);
                }
                Err(_) if ctx.context.evm.db.needs_update() => continue,
                Err(EVMError::Database(err)) => break Err(TransactError::State(err)),
                Err(err) => break Err(TransactError::Invalid(err.to_string())),
            }
        }
    }

    fn cfg_env(&self, flags: ExecFlags) -> CfgEnv {
        let mut cfg = CfgEnv::default();
        cfg.chain_id = self.chain_id;
        // impersonated senders may be contracts
        cfg.disable_eip3607 = true;
        cfg.disable_balance_check = flags.skip_balance;
        cfg.disable_block_gas_limit = flags.skip_block_gas_limit;
        cfg.disable_base_fee = flags.skip_base_fee;
        cfg
    }
}

fn block_env(block: &BlockContext) -> BlockEnv {
    BlockEnv {
        number: U256::from(block.number),
        coinbase: block.coinbase,
        timestamp: U256::from(block.timestamp),
        gas_limit: U256::from(block.gas_limit),
        basefee: U256::from(block.base_fee),
        difficulty: U256::ZERO,
        prevrandao: Some(block.prevrandao),
        blob_excess_gas_and_price: Some(BlobExcessGasAndPrice::new(0)),
    }
}
