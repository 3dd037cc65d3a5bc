use alloy::primitives::Bytes;
use thiserror::Error;

/// Failure taxonomy for simulator operations.
///
/// `InvalidArgument`, `Precondition` and `Upstream` abort the surrounding
/// bundle; EVM-level failures never surface here, they ride inside the
/// returned receipt instead.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("upstream provider failure: {0}")]
    Upstream(eyre::Report),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl SimulationError {
    pub fn upstream(err: impl Into<eyre::Report>) -> Self {
        Self::Upstream(err.into())
    }
}

/// Errors raised by read-only EVM entrypoints.
#[derive(Debug, Error)]
pub enum EvmError {
    #[error("execution reverted: {reason}")]
    Revert { reason: String, data: Bytes },

    #[error("evm error: {0}")]
    Generic(String),
}

#[derive(Debug, Error)]
#[error("rpc error on method: {method}, message: {error}")]
pub struct RpcError<E: ToString> {
    method: String,
    error: E,
}

impl<E: ToString> RpcError<E> {
    pub fn new(method: &str, err: E) -> Self {
        Self {
            method: method.to_string(),
            error: err,
        }
    }
}
