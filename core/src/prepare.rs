use alloy::consensus::{
    SignableTransaction, TxEip1559, TxEip2930, TxEnvelope, TxLegacy, TypedTransaction,
};
use alloy::primitives::{Address, Bytes, TxKind, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use eyre::{eyre, Result};
use revm::primitives::{AccessListItem, TxEnv};
use tracing::trace;

use mirage_common::errors::SimulationError;

use crate::evm::{BlockContext, EvmDriver, ExecFlags, TransactError};
use crate::revert::decode_revert_reason;
use crate::signer::SignatureMatcher;
use crate::state::OverlayState;

const GWEI: u128 = 1_000_000_000;

/// Gas assigned to contract creations without an explicit limit, and the
/// ceiling used by the estimation probe.
const CREATE_GAS_LIMIT: u64 = 10_000_000;

/// A transaction ready for execution: either genuinely signed (with a
/// synthetic key when the sender is impersonated) or a sender-proxied
/// variant carrying no signature at all.
#[derive(Debug, Clone)]
pub enum PreparedTransaction {
    Signed(TxEnvelope),
    Unsigned { tx: TypedTransaction, from: Address },
}

struct TxParts {
    nonce: u64,
    gas_limit: u64,
    gas_price: u128,
    priority_fee: Option<u128>,
    to: TxKind,
    value: U256,
    input: Bytes,
    access_list: Vec<AccessListItem>,
    chain_id: Option<u64>,
}

impl PreparedTransaction {
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed(_))
    }

    /// The real transaction hash, when one exists. Unsigned proxied
    /// transactions have none; the engine fabricates a placeholder.
    pub fn tx_hash(&self) -> Option<B256> {
        match self {
            Self::Signed(envelope) => Some(*envelope.tx_hash()),
            Self::Unsigned { .. } => None,
        }
    }

    /// The sender the EVM observes. Signed transactions go through the
    /// signature matcher's recovery, which is where impersonation happens;
    /// unsigned transactions carry their sender literally.
    pub fn caller(&self, matcher: &SignatureMatcher) -> Result<Address> {
        match self {
            Self::Signed(envelope) => match envelope {
                TxEnvelope::Legacy(signed) => {
                    matcher.recover_caller(signed.signature_hash(), signed.signature())
                }
                TxEnvelope::Eip2930(signed) => {
                    matcher.recover_caller(signed.signature_hash(), signed.signature())
                }
                TxEnvelope::Eip1559(signed) => {
                    matcher.recover_caller(signed.signature_hash(), signed.signature())
                }
                _ => Err(SimulationError::InvalidArgument(
                    "unsupported signed transaction type".to_string(),
                )
                .into()),
            },
            Self::Unsigned { from, .. } => Ok(*from),
        }
    }

    pub fn gas_limit(&self) -> u64 {
        self.parts().gas_limit
    }

    pub fn to(&self) -> TxKind {
        self.parts().to
    }

    pub fn nonce(&self) -> u64 {
        self.parts().nonce
    }

    pub fn value(&self) -> U256 {
        self.parts().value
    }

    pub fn input(&self) -> Bytes {
        self.parts().input
    }

    pub fn gas_price(&self) -> u128 {
        self.parts().gas_price
    }

    pub fn tx_type(&self) -> u8 {
        match self {
            Self::Signed(TxEnvelope::Eip2930(_)) => 1,
            Self::Signed(TxEnvelope::Eip1559(_)) => 2,
            Self::Unsigned {
                tx: TypedTransaction::Eip2930(_),
                ..
            } => 1,
            Self::Unsigned {
                tx: TypedTransaction::Eip1559(_),
                ..
            } => 2,
            _ => 0,
        }
    }

    pub(crate) fn to_tx_env(&self, caller: Address, skip_nonce: bool) -> TxEnv {
        let parts = self.parts();

        TxEnv {
            caller,
            gas_limit: parts.gas_limit,
            gas_price: U256::from(parts.gas_price),
            transact_to: parts.to,
            value: parts.value,
            data: parts.input,
            nonce: if skip_nonce { None } else { Some(parts.nonce) },
            chain_id: parts.chain_id,
            access_list: parts.access_list,
            gas_priority_fee: parts.priority_fee.map(U256::from),
            ..TxEnv::default()
        }
    }

    fn parts(&self) -> TxParts {
        match self {
            Self::Signed(TxEnvelope::Legacy(signed)) => legacy_parts(signed.tx()),
            Self::Signed(TxEnvelope::Eip2930(signed)) => eip2930_parts(signed.tx()),
            Self::Signed(TxEnvelope::Eip1559(signed)) => eip1559_parts(signed.tx()),
            Self::Unsigned {
                tx: TypedTransaction::Legacy(tx),
                ..
            } => legacy_parts(tx),
            Self::Unsigned {
                tx: TypedTransaction::Eip2930(tx),
                ..
            } => eip2930_parts(tx),
            Self::Unsigned {
                tx: TypedTransaction::Eip1559(tx),
                ..
            } => eip1559_parts(tx),
            // the preparer only ever constructs the three classes above
            _ => TxParts {
                nonce: 0,
                gas_limit: 0,
                gas_price: 0,
                priority_fee: None,
                to: TxKind::Create,
                value: U256::ZERO,
                input: Bytes::new(),
                access_list: Vec::new(),
                chain_id: None,
            },
        }
    }
}

fn legacy_parts(tx: &TxLegacy) -> TxParts {
    TxParts {
        nonce: tx.nonce,
        gas_limit: tx.gas_limit,
        gas_price: tx.gas_price,
        priority_fee: None,
        to: tx.to,
        value: tx.value,
        input: tx.input.clone(),
        access_list: Vec::new(),
        chain_id: tx.chain_id,
    }
}

fn eip2930_parts(tx: &TxEip2930) -> TxParts {
    TxParts {
        nonce: tx.nonce,
        gas_limit: tx.gas_limit,
        gas_price: tx.gas_price,
        priority_fee: None,
        to: tx.to,
        value: tx.value,
        input: tx.input.clone(),
        access_list: tx.access_list.0.clone(),
        chain_id: Some(tx.chain_id),
    }
}

fn eip1559_parts(tx: &TxEip1559) -> TxParts {
    TxParts {
        nonce: tx.nonce,
        gas_limit: tx.gas_limit,
        gas_price: tx.max_fee_per_gas,
        priority_fee: Some(tx.max_priority_fee_per_gas),
        to: tx.to,
        value: tx.value,
        input: tx.input.clone(),
        access_list: tx.access_list.0.clone(),
        chain_id: Some(tx.chain_id),
    }
}

/// Normalizes a loose [`TransactionRequest`] into a fully populated typed
/// transaction: nonce synced from the overlay, gas estimated when absent,
/// fees derived from the head basefee, then signed with a synthetic key or
/// tagged with the impersonated sender.
pub struct TransactionPreparer {
    state: OverlayState,
    matcher: SignatureMatcher,
    chain_id: u64,
}

impl TransactionPreparer {
    pub(crate) fn new(state: OverlayState, matcher: SignatureMatcher, chain_id: u64) -> Self {
        Self {
            state,
            matcher,
            chain_id,
        }
    }

    pub(crate) async fn prepare(
        &self,
        request: &TransactionRequest,
        head: &BlockContext,
        driver: &EvmDriver,
    ) -> Result<PreparedTransaction> {
        let from = request.from.ok_or_else(|| {
            SimulationError::InvalidArgument("transaction is missing a sender address".to_string())
        })?;

        let nonce = match request.nonce {
            Some(nonce) => nonce,
            None => self.state.account(from).await?.nonce,
        };

        let gas_limit = match request.gas {
            Some(gas) => gas,
            None => match request.to {
                Some(TxKind::Call(_)) => self.run_estimate(request, from, head, driver).await?,
                _ => CREATE_GAS_LIMIT,
            },
        };

        let typed = self.build_typed(request, nonce, gas_limit, head.base_fee)?;

        if self.matcher.is_registered(from) {
            let key = self.matcher.simulation_private_key(from)?;
            let envelope = sign_typed(typed, key)?;
            trace!(target: "mirage::prepare", %from, "signed with synthetic key");
            Ok(PreparedTransaction::Signed(envelope))
        } else {
            Ok(PreparedTransaction::Unsigned { tx: typed, from })
        }
    }

    pub(crate) async fn estimate_gas(
        &self,
        request: &TransactionRequest,
        head: &BlockContext,
        driver: &EvmDriver,
    ) -> Result<u64> {
        let from = request.from.ok_or_else(|| {
            SimulationError::InvalidArgument("transaction is missing a sender address".to_string())
        })?;

        match request.to {
            Some(TxKind::Call(_)) => self.run_estimate(request, from, head, driver).await,
            _ => Ok(CREATE_GAS_LIMIT),
        }
    }

    /// Execute a throwaway fee-market transaction inside a checkpoint that
    /// is always rolled back, and report the gas it spent.
    async fn run_estimate(
        &self,
        request: &TransactionRequest,
        from: Address,
        head: &BlockContext,
        driver: &EvmDriver,
    ) -> Result<u64> {
        let tx = TxEnv {
            caller: from,
            gas_limit: CREATE_GAS_LIMIT,
            gas_price: U256::from(10),
            transact_to: request.to.unwrap_or(TxKind::Create),
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
        let res = driver.transact(tx, head, ExecFlags::relaxed()).await;
        self.state.revert();

        let out = match res {
            Ok(out) => out,
            Err(TransactError::State(err)) => return Err(SimulationError::Upstream(err).into()),
            Err(TransactError::Invalid(message)) => {
                return Err(SimulationError::Upstream(eyre!(message)).into())
            }
        };

        use revm::primitives::ExecutionResult::*;
        match out.result {
            Success { gas_used, .. } => Ok(gas_used),
            Revert { output, .. } => Err(SimulationError::Upstream(eyre!(
                "gas estimation reverted: {}",
                decode_revert_reason(&output)
            ))
            .into()),
            Halt { reason, .. } => Err(SimulationError::Upstream(eyre!(
                "gas estimation halted: {reason:?}"
            ))
            .into()),
        }
    }

    fn build_typed(
        &self,
        request: &TransactionRequest,
        nonce: u64,
        gas_limit: u64,
        base_fee: u64,
    ) -> Result<TypedTransaction> {
        let to = request.to.unwrap_or(TxKind::Create);
        let value = request.value.unwrap_or_default();
        let input = request.input.input().cloned().unwrap_or_default();
        let access_list = request.access_list.clone().unwrap_or_default();
        let gas_price = request
            .gas_price
            .unwrap_or_else(|| u128::from(base_fee) + GWEI);

        let tx_type = match request.transaction_type {
            Some(ty) => ty,
            None if request.gas_price.is_some() && request.access_list.is_some() => 1,
            None if request.gas_price.is_some() => 0,
            None => 2,
        };

        match tx_type {
            0 => Ok(TypedTransaction::Legacy(TxLegacy {
                chain_id: Some(self.chain_id),
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                input,
            })),
            1 => Ok(TypedTransaction::Eip2930(TxEip2930 {
                chain_id: self.chain_id,
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                access_list,
                input,
            })),
            2 => {
                let tip = request.max_priority_fee_per_gas.unwrap_or(GWEI);
                let max_fee = request
                    .max_fee_per_gas
                    .unwrap_or_else(|| 2 * u128::from(base_fee) + tip);

                Ok(TypedTransaction::Eip1559(TxEip1559 {
                    chain_id: self.chain_id,
                    nonce,
                    gas_limit,
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: tip,
                    to,
                    value,
                    access_list,
                    input,
                }))
            }
            other => Err(SimulationError::InvalidArgument(format!(
                "unsupported transaction type {other}"
            ))
            .into()),
        }
    }
}

fn sign_typed(tx: TypedTransaction, key: B256) -> Result<TxEnvelope> {
    let signer = PrivateKeySigner::from_bytes(&key)?;

    Ok(match tx {
        TypedTransaction::Legacy(tx) => {
            let signature = signer.sign_hash_sync(&tx.signature_hash())?;
            tx.into_signed(signature).into()
        }
        TypedTransaction::Eip2930(tx) => {
            let signature = signer.sign_hash_sync(&tx.signature_hash())?;
            tx.into_signed(signature).into()
        }
        TypedTransaction::Eip1559(tx) => {
            let signature = signer.sign_hash_sync(&tx.signature_hash())?;
            tx.into_signed(signature).into()
        }
        _ => {
            return Err(SimulationError::Internal(
                "prepared an unsupported transaction class".to_string(),
            )
            .into())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock_rpc::MockRpc;
    use alloy::primitives::address;
    use std::sync::Arc;

    fn fixture() -> (TransactionPreparer, BlockContext, EvmDriver) {
        let sender = address!("00000000000000000000000000000000000000a1");
        let mock = MockRpc::new(1, 100).with_account(sender, U256::from(1_000_000), 5);
        let state = OverlayState::new(Arc::new(mock), 100);
        let matcher = SignatureMatcher::default();
        let driver = EvmDriver::new(state.clone(), 1);
        let preparer = TransactionPreparer::new(state, matcher, 1);
        let head = BlockContext {
            number: 100,
            timestamp: 1_700_000_000,
            gas_limit: 30_000_000,
            base_fee: 7,
            coinbase: Address::ZERO,
            prevrandao: B256::ZERO,
        };
        (preparer, head, driver)
    }

    #[tokio::test]
    async fn defaults_to_fee_market_with_synced_nonce() {
        let (preparer, head, driver) = fixture();
        let sender = address!("00000000000000000000000000000000000000a1");

        let request = TransactionRequest {
            from: Some(sender),
            to: Some(TxKind::Call(Address::repeat_byte(0x22))),
            gas: Some(21_000),
            ..Default::default()
        };

        let prepared = preparer.prepare(&request, &head, &driver).await.unwrap();
        assert!(!prepared.is_signed());

        match &prepared {
            PreparedTransaction::Unsigned {
                tx: TypedTransaction::Eip1559(tx),
                from,
            } => {
                assert_eq!(*from, sender);
                assert_eq!(tx.nonce, 5);
                assert_eq!(tx.max_priority_fee_per_gas, GWEI);
                assert_eq!(tx.max_fee_per_gas, 2 * 7 + GWEI);
            }
            other => panic!("expected unsigned 1559 transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_gas_price_selects_legacy() {
        let (preparer, head, driver) = fixture();
        let sender = address!("00000000000000000000000000000000000000a1");

        let request = TransactionRequest {
            from: Some(sender),
            to: Some(TxKind::Call(Address::repeat_byte(0x22))),
            gas: Some(21_000),
            gas_price: Some(1_000),
            ..Default::default()
        };

        let prepared = preparer.prepare(&request, &head, &driver).await.unwrap();
        match &prepared {
            PreparedTransaction::Unsigned {
                tx: TypedTransaction::Legacy(tx),
                ..
            } => assert_eq!(tx.gas_price, 1_000),
            other => panic!("expected unsigned legacy transaction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn creation_without_gas_gets_fixed_limit() {
        let (preparer, head, driver) = fixture();
        let sender = address!("00000000000000000000000000000000000000a1");

        let request = TransactionRequest {
            from: Some(sender),
            ..Default::default()
        };
        let prepared = preparer.prepare(&request, &head, &driver).await.unwrap();
        assert_eq!(prepared.gas_limit(), CREATE_GAS_LIMIT);
        assert_eq!(prepared.to(), TxKind::Create);
    }

    #[tokio::test]
    async fn missing_sender_is_invalid() {
        let (preparer, head, driver) = fixture();
        let request = TransactionRequest {
            to: Some(TxKind::Call(Address::repeat_byte(0x22))),
            ..Default::default()
        };

        let err = preparer
            .prepare(&request, &head, &driver)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid argument"));
    }
}
