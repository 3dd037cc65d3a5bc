use std::sync::Arc;

use alloy::primitives::{address, Address, Bytes, TxKind, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::k256::elliptic_curve::sec1::ToEncodedPoint;
use alloy::signers::local::PrivateKeySigner;
use pretty_assertions::assert_eq;
use serde_json::json;

use mirage_core::adapter::{RpcAdapter, RpcHandlerError};
use mirage_core::engine::Simulator;
use mirage_core::rpc::mock_rpc::MockRpc;

const FORK_BLOCK: u64 = 2_000_000;
const CHAIN_ID: u64 = 1;

fn eth(amount: u64) -> U256 {
    U256::from(amount) * U256::from(10).pow(U256::from(18))
}

/// Standard deployment preamble: copy the runtime after the 11-byte header
/// into memory and return it.
fn creation_code(runtime: &[u8]) -> Bytes {
    assert!(runtime.len() <= 0xff);
    let mut code = vec![
        0x60,
        runtime.len() as u8,
        0x80,
        0x60,
        0x0b,
        0x60,
        0x00,
        0x39,
        0x60,
        0x00,
        0xf3,
    ];
    code.extend_from_slice(runtime);
    Bytes::from(code)
}

/// `SSTORE(CALLER, CALLVALUE)` then stop: records who the EVM thinks sent
/// the transaction, and how much value rode along.
fn recorder_runtime() -> Bytes {
    Bytes::from_static(&[0x34, 0x33, 0x55, 0x00])
}

/// Always reverts with `Error("Insufficient balance")`.
fn reverter_runtime() -> Bytes {
    let mut code = vec![
        0x60, 0x64, 0x60, 0x0c, 0x60, 0x00, 0x39, 0x60, 0x64, 0x60, 0x00, 0xfd,
    ];
    code.extend_from_slice(&[0x08, 0xc3, 0x79, 0xa0]);
    code.extend_from_slice(&U256::from(32).to_be_bytes::<32>());
    code.extend_from_slice(&U256::from(20).to_be_bytes::<32>());
    let mut reason = b"Insufficient balance".to_vec();
    reason.resize(32, 0);
    code.extend_from_slice(&reason);
    Bytes::from(code)
}

/// Returns the 32-byte word at storage slot zero.
fn getter_runtime() -> Bytes {
    Bytes::from_static(&[
        0x60, 0x00, 0x54, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
    ])
}

async fn fork() -> (Arc<MockRpc>, Simulator) {
    let mock = Arc::new(MockRpc::new(CHAIN_ID, FORK_BLOCK));
    let engine = Simulator::create(mock.clone(), None).await.unwrap();
    (mock, engine)
}

fn transfer(from: Address, to: Address, value: U256) -> TransactionRequest {
    TransactionRequest {
        from: Some(from),
        to: Some(TxKind::Call(to)),
        value: Some(value),
        gas: Some(21_000),
        ..Default::default()
    }
}

fn deployment(from: Address, runtime: &[u8]) -> TransactionRequest {
    TransactionRequest {
        from: Some(from),
        input: creation_code(runtime).into(),
        ..Default::default()
    }
}

fn caller_slot(address: Address) -> B256 {
    let mut key = [0u8; 32];
    key[12..].copy_from_slice(address.as_slice());
    B256::from(key)
}

#[tokio::test]
async fn transfers_move_balances() {
    let (_, engine) = fork().await;
    let sender = address!("1000000000000000000000000000000000000001");
    let recipient = address!("1000000000000000000000000000000000000002");

    engine.set_balance(sender, eth(1)).await.unwrap();

    let result = engine
        .execute(&transfer(sender, recipient, eth(1) / U256::from(2)))
        .await
        .unwrap();
    assert_eq!(result.error, None);
    assert!(result.receipt.status.is_success());
    assert_eq!(result.receipt.gas_used, 21_000);

    let recipient_balance = engine.get_balance(recipient).await.unwrap();
    assert_eq!(recipient_balance, eth(1) / U256::from(2));

    // sender paid the value plus a small amount of gas
    let sender_balance = engine.get_balance(sender).await.unwrap();
    assert!(sender_balance < eth(1) / U256::from(2));
    assert!(sender_balance > eth(1) / U256::from(2) - eth(1) / U256::from(1_000));
}

#[tokio::test]
async fn deploys_and_reads_back_code() {
    let (_, engine) = fork().await;
    let deployer = address!("1000000000000000000000000000000000000011");
    engine.set_balance(deployer, eth(1)).await.unwrap();

    let result = engine
        .execute(&deployment(deployer, &recorder_runtime()))
        .await
        .unwrap();
    assert_eq!(result.error, None);

    let contract = result.receipt.created_address.expect("created address");
    let code = engine.get_code(contract).await.unwrap();
    assert_eq!(code, recorder_runtime());

    // the transaction is indexed under its (placeholder) hash
    let stored = engine.get_transaction_result(&result.hash).unwrap();
    assert!(stored.receipt.status.is_success());
    assert!(result.hash.starts_with("0x000000000000000000000000"));
}

#[tokio::test]
async fn impersonated_sender_is_observed_by_the_evm() {
    let (_, engine) = fork().await;
    let deployer = address!("1000000000000000000000000000000000000021");
    engine.set_balance(deployer, eth(1)).await.unwrap();

    let deploy = engine
        .execute(&deployment(deployer, &recorder_runtime()))
        .await
        .unwrap();
    let recorder = deploy.receipt.created_address.unwrap();

    // impersonate an address we only know the public key of
    let impersonated = PrivateKeySigner::random();
    let public_key = impersonated
        .credential()
        .verifying_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    let synthetic_key = engine.impersonate_account(&public_key).unwrap();
    assert_ne!(synthetic_key, B256::ZERO);

    engine
        .set_balance(impersonated.address(), eth(1))
        .await
        .unwrap();

    let result = engine
        .execute(&TransactionRequest {
            from: Some(impersonated.address()),
            to: Some(TxKind::Call(recorder)),
            value: Some(U256::from(5)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(result.error, None);

    // the recorder contract stored CALLVALUE under CALLER: the EVM saw the
    // impersonated address, not the synthetic signer
    let recorded = engine
        .get_storage_at(recorder, caller_slot(impersonated.address()))
        .await
        .unwrap();
    assert_eq!(U256::from_be_bytes(recorded.0), U256::from(5));

    // a fully signed bundle synthesizes a block above the fork height
    assert_eq!(result.block_number, Some(FORK_BLOCK + 1));
    assert_eq!(engine.block_number(), FORK_BLOCK + 1);
    let head = engine.latest_simulated_block().unwrap();
    assert_eq!(head.transactions, vec![result.hash.clone()]);
    assert!(engine.is_simulated_block_number(head.number));
}

#[tokio::test]
async fn revert_carries_decoded_reason() {
    let (_, engine) = fork().await;
    let deployer = address!("1000000000000000000000000000000000000031");
    engine.set_balance(deployer, eth(1)).await.unwrap();

    let deploy = engine
        .execute(&deployment(deployer, &reverter_runtime()))
        .await
        .unwrap();
    let reverter = deploy.receipt.created_address.unwrap();

    let balance_before = engine.get_balance(deployer).await.unwrap();

    let result = engine
        .execute(&TransactionRequest {
            from: Some(deployer),
            to: Some(TxKind::Call(reverter)),
            gas: Some(100_000),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!result.receipt.status.is_success());
    let message = result.error.expect("failure message");
    assert!(message.contains("Insufficient balance"), "{message}");
    assert!(!result.receipt.revert_data.is_empty());

    // the failed bundle rolled back, state is exactly what it was
    assert_eq!(engine.get_balance(deployer).await.unwrap(), balance_before);

    // estimation against the same call surfaces the decoded reason upstream
    let err = engine
        .estimate_gas(&TransactionRequest {
            from: Some(deployer),
            to: Some(TxKind::Call(reverter)),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Insufficient balance"), "{err}");
}

#[tokio::test]
async fn bundles_are_atomic() {
    let (_, engine) = fork().await;
    let sender = address!("1000000000000000000000000000000000000041");
    let recipient = address!("1000000000000000000000000000000000000042");
    engine.set_balance(sender, eth(2)).await.unwrap();

    let deploy = engine
        .execute(&deployment(sender, &reverter_runtime()))
        .await
        .unwrap();
    let reverter = deploy.receipt.created_address.unwrap();
    let nonce_before = engine.get_nonce(sender).await.unwrap();

    let results = engine
        .execute_bundle(&[
            transfer(sender, recipient, eth(1)),
            TransactionRequest {
                from: Some(sender),
                to: Some(TxKind::Call(reverter)),
                gas: Some(100_000),
                ..Default::default()
            },
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].receipt.status.is_success());
    assert!(!results[1].receipt.status.is_success());

    // the first transaction succeeded inside the bundle but was undone with it
    assert_eq!(engine.get_balance(recipient).await.unwrap(), U256::ZERO);
    assert_eq!(engine.get_nonce(sender).await.unwrap(), nonce_before);

    // both results are still indexed by hash
    assert!(engine.get_transaction_result(&results[0].hash).is_some());
    assert!(engine.get_transaction_result(&results[1].hash).is_some());
}

#[tokio::test]
async fn deployed_code_survives_a_reverted_bundle() {
    let (_, engine) = fork().await;
    let deployer = address!("1000000000000000000000000000000000000051");
    engine.set_balance(deployer, eth(1)).await.unwrap();

    let first = engine
        .execute(&deployment(deployer, &recorder_runtime()))
        .await
        .unwrap();
    let first_contract = first.receipt.created_address.unwrap();

    let reverter = engine
        .execute(&deployment(deployer, &reverter_runtime()))
        .await
        .unwrap()
        .receipt
        .created_address
        .unwrap();

    let results = engine
        .execute_bundle(&[
            deployment(deployer, &getter_runtime()),
            TransactionRequest {
                from: Some(deployer),
                to: Some(TxKind::Call(reverter)),
                gas: Some(100_000),
                ..Default::default()
            },
        ])
        .await
        .unwrap();

    assert!(results[0].receipt.status.is_success());
    assert!(!results[1].receipt.status.is_success());
    let second_contract = results[0].receipt.created_address.unwrap();

    // the bundle reverted, but both deployments' code is still present
    assert_eq!(
        engine.get_code(first_contract).await.unwrap(),
        recorder_runtime()
    );
    assert_eq!(
        engine.get_code(second_contract).await.unwrap(),
        getter_runtime()
    );
    assert!(engine.state().deployed_code(second_contract).is_some());
}

#[tokio::test]
async fn calls_are_read_only_and_require_a_target() {
    let (_, engine) = fork().await;
    let caller = address!("1000000000000000000000000000000000000061");
    let contract = address!("1000000000000000000000000000000000000062");

    engine.state().put_code(contract, getter_runtime());
    engine
        .set_storage(contract, B256::ZERO, B256::with_last_byte(0x2a))
        .await
        .unwrap();

    let result = engine
        .call(&TransactionRequest {
            from: Some(caller),
            to: Some(TxKind::Call(contract)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(result.value.len(), 32);
    assert_eq!(result.value[31], 0x2a);

    // a call without a destination is rejected before touching state
    let err = engine
        .call(&TransactionRequest {
            from: Some(caller),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid argument"), "{err}");

    // nothing a call does persists
    assert_eq!(engine.state().checkpoint_depth(), 0);
    assert_eq!(engine.block_number(), FORK_BLOCK);
}

#[tokio::test]
async fn historical_block_tags_fall_back_to_the_remote() {
    let (mock, engine) = fork().await;
    let adapter = RpcAdapter::new(Arc::new(engine));

    // far below the fork height: the adapter signals internal fallback
    let err = adapter
        .handle("eth_getBlockByNumber", json!(["0x1", false]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcHandlerError::FallbackToRemote));
    assert_eq!(err.code(), 32552225);

    // dispatch resolves the sentinel by forwarding the request verbatim
    adapter
        .dispatch("eth_getBlockByNumber", json!(["0x1", false]))
        .await
        .unwrap();
    assert_eq!(mock.raw_calls(), vec!["eth_getBlockByNumber".to_string()]);

    // unknown methods are forwarded as well
    adapter
        .dispatch("eth_feeHistory", json!([]))
        .await
        .unwrap();
    assert_eq!(mock.raw_calls().len(), 2);
}

#[tokio::test]
async fn adapter_serves_simulated_blocks_and_receipts() {
    let (_, engine) = fork().await;
    let deployer = address!("1000000000000000000000000000000000000071");
    engine.set_balance(deployer, eth(1)).await.unwrap();

    let deploy = engine
        .execute(&deployment(deployer, &recorder_runtime()))
        .await
        .unwrap();
    let recorder = deploy.receipt.created_address.unwrap();

    // a signed transaction from an impersonated key synthesizes a block
    let impersonated = PrivateKeySigner::random();
    let public_key = impersonated
        .credential()
        .verifying_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec();
    engine.impersonate_account(&public_key).unwrap();
    engine
        .set_balance(impersonated.address(), eth(1))
        .await
        .unwrap();

    let result = engine
        .execute(&TransactionRequest {
            from: Some(impersonated.address()),
            to: Some(TxKind::Call(recorder)),
            value: Some(U256::from(1)),
            ..Default::default()
        })
        .await
        .unwrap();

    let adapter = RpcAdapter::new(Arc::new(engine));

    let number = adapter.handle("eth_blockNumber", json!([])).await.unwrap();
    assert_eq!(number, json!(format!("0x{:x}", FORK_BLOCK + 1)));

    let block = adapter
        .handle("eth_getBlockByNumber", json!(["latest", false]))
        .await
        .unwrap();
    assert_eq!(
        block.get("number").unwrap(),
        &json!(format!("0x{:x}", FORK_BLOCK + 1))
    );
    assert_eq!(
        block.get("transactions").unwrap(),
        &json!([result.hash.clone()])
    );

    let receipt = adapter
        .handle("eth_getTransactionReceipt", json!([result.hash]))
        .await
        .unwrap();
    assert_eq!(receipt.get("status").unwrap(), &json!("0x1"));
    assert_eq!(
        receipt.get("from").unwrap(),
        &json!(impersonated.address())
    );

    let tx = adapter
        .handle("eth_getTransactionByHash", json!([result.hash]))
        .await
        .unwrap();
    assert_eq!(tx.get("from").unwrap(), &json!(impersonated.address()));
    assert_eq!(tx.get("to").unwrap(), &json!(recorder));
}
