#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # In-process EVM fork simulator.
//!
//! > mirage forks a live EVM chain at a chosen block height and executes
//! > transactions and read-only calls against a mutable overlay on top of
//! > immutable remote state, without broadcasting anything to the network.
//!
//! State is fetched lazily over JSON-RPC and cached copy-on-write, so the
//! simulator runs anywhere an HTTP client runs, including browser-hosted
//! wasm. Accounts the caller holds no key for can still send transactions
//! through impersonation: a synthetic key pair signs on their behalf and
//! signature recovery is rewritten so the EVM observes the intended sender.
//!
//! ## Breakdown of exported modules
//!
//! ### `core`
//!
//! The engine itself: `Simulator` (fork, call, execute, bundles), the
//! overlay state manager, the signature matcher, the transaction preparer,
//! and the JSON-RPC adapter plus a native server over it.
//!
//! ### `common`
//!
//! Leaf types shared across the workspace (`BlockTag`, receipts, results)
//! and the error taxonomy.

pub mod common {
    pub use mirage_common::*;
}

pub mod core {
    pub use mirage_core::*;
}

pub mod prelude {
    pub use crate::common::errors::*;
    pub use crate::common::types::*;
    pub use crate::core::adapter::{RpcAdapter, FALLBACK_TO_REMOTE_CODE};
    pub use crate::core::engine::{SimulatedBlock, Simulator};
    pub use crate::core::prepare::PreparedTransaction;
    pub use crate::core::rpc::{ChainRpc, HttpRpc};
    pub use crate::core::signer::SignatureMatcher;
    pub use crate::core::state::OverlayState;
}
