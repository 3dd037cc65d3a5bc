use std::net::SocketAddr;
use std::sync::Arc;

use eyre::Result;
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use jsonrpsee::types::error::{ErrorObject, ErrorObjectOwned};
use jsonrpsee::RpcModule;
use serde_json::Value;
use tracing::info;

use crate::adapter::{RpcAdapter, RpcHandlerError};

/// Methods the server registers. The first group is answered by the engine;
/// the second reaches the remote provider through the adapter's fallback
/// path. Hosts that need the full remote surface should embed
/// [`RpcAdapter::dispatch`] directly.
const METHODS: &[&str] = &[
    "eth_blockNumber",
    "eth_call",
    "eth_estimateGas",
    "eth_getBalance",
    "eth_getBlockByHash",
    "eth_getBlockByNumber",
    "eth_getBlockTransactionCountByHash",
    "eth_getBlockTransactionCountByNumber",
    "eth_getCode",
    "eth_getStorageAt",
    "eth_getTransactionByBlockHashAndIndex",
    "eth_getTransactionByBlockNumberAndIndex",
    "eth_getTransactionReceipt",
    "eth_sendRawTransaction",
    "eth_getTransactionByHash",
    "eth_getTransactionCount",
    "eth_sendTransaction",
    "eth_chainId",
    "eth_gasPrice",
    "eth_maxPriorityFeePerGas",
    "eth_feeHistory",
    "eth_getLogs",
    "eth_getProof",
    "net_version",
    "web3_clientVersion",
];

pub struct RpcServer {
    adapter: Arc<RpcAdapter>,
    address: SocketAddr,
    handle: Option<ServerHandle>,
}

impl RpcServer {
    pub fn new(adapter: Arc<RpcAdapter>, address: SocketAddr) -> Self {
        Self {
            adapter,
            address,
            handle: None,
        }
    }

    pub async fn start(&mut self) -> Result<SocketAddr> {
        let server = ServerBuilder::default().build(self.address).await?;
        let addr = server.local_addr()?;

        let mut module = RpcModule::new(self.adapter.clone());
        for &method in METHODS {
            module.register_async_method(method, move |params, adapter| async move {
                let params: Value = params.parse().unwrap_or(Value::Array(Vec::new()));
                adapter
                    .dispatch(method, params)
                    .await
                    .map_err(to_error_object)
            })?;
        }

        let handle = server.start(module);
        self.handle = Some(handle);

        info!(target: "mirage::rpc", "rpc server started at {addr}");

        Ok(addr)
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.stop()?;
        }
        Ok(())
    }
}

fn to_error_object(err: RpcHandlerError) -> ErrorObjectOwned {
    match err {
        RpcHandlerError::Execution { message, data } => {
            ErrorObject::owned(-32000, message, data)
        }
        other => ErrorObject::owned(other.code() as i32, other.to_string(), None::<()>),
    }
}
