use std::fmt::Display;

use alloy::primitives::{Address, Bloom, Bytes, B256, U256};
use serde::{de::Error, Deserialize, Serialize};

/// keccak256 of empty bytes, the EVM's "no code" marker.
pub const EMPTY_CODE_HASH: B256 = alloy::primitives::b256!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
);

/// A block reference as it appears at the JSON-RPC surface.
///
/// The named tags all resolve to the current simulated head; `Earliest` and
/// numbers at or below the fork height are served by the remote provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Safe,
    Finalized,
    Earliest,
    Number(u64),
}

impl Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let formatted = match self {
            Self::Latest => "latest".to_string(),
            Self::Pending => "pending".to_string(),
            Self::Safe => "safe".to_string(),
            Self::Finalized => "finalized".to_string(),
            Self::Earliest => "earliest".to_string(),
            Self::Number(num) => num.to_string(),
        };

        write!(f, "{formatted}")
    }
}

impl<'de> Deserialize<'de> for BlockTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let block: String = serde::Deserialize::deserialize(deserializer)?;
        let parse_error = D::Error::custom("could not parse block tag");

        let block_tag = match block.as_str() {
            "latest" => BlockTag::Latest,
            "pending" => BlockTag::Pending,
            "safe" => BlockTag::Safe,
            "finalized" => BlockTag::Finalized,
            "earliest" => BlockTag::Earliest,
            _ => match block.strip_prefix("0x") {
                Some(hex_block) => {
                    let num = u64::from_str_radix(hex_block, 16).map_err(|_| parse_error)?;

                    BlockTag::Number(num)
                }
                None => {
                    let num = block.parse().map_err(|_| parse_error)?;

                    BlockTag::Number(num)
                }
            },
        };

        Ok(block_tag)
    }
}

/// Account state as the overlay tracks it.
///
/// `code_hash` is never the all-zero sentinel some endpoints report; the
/// overlay replaces it with [`EMPTY_CODE_HASH`] before the account is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
    pub code_hash: B256,
    pub storage_root: B256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            balance: U256::ZERO,
            nonce: 0,
            code_hash: EMPTY_CODE_HASH,
            storage_root: EMPTY_CODE_HASH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failure,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Outcome of a single executed transaction.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub status: ExecutionStatus,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    pub logs: Vec<LogEntry>,
    pub created_address: Option<Address>,
    pub state_root: Option<B256>,
    pub logs_bloom: Option<Bloom>,
    pub revert_data: Bytes,
}

/// A transaction result as stored in the engine's hash-keyed index.
#[derive(Debug, Clone)]
pub struct TxResult {
    /// Lowercase `0x`-prefixed transaction hash. Unsigned transactions carry
    /// a placeholder whose first twelve bytes are zero.
    pub hash: String,
    /// External number of the simulated block, when one was synthesized.
    pub block_number: Option<u64>,
    pub receipt: Receipt,
    /// Decoded failure message; `None` on success.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub value: Bytes,
    pub gas_used: u64,
}
