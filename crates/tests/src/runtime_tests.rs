//! Integration tests for runtime assembly and lifecycle.
//!
//! These tests verify the behavioral contracts of `AccessRuntime`:
//! - Chains are assembled from configuration with HTTP pools and optional WebSocket feeds
//! - Concurrent gas price reads share one upstream fetch
//! - Shutdown is safe to call multiple times and stops every WebSocket session
//!
//! Tests use `tokio::time::timeout` to prevent hanging on failures.

use crate::mock_infrastructure::{
    chain_config, http_entry, test_app_config, wait_until, MockWebSocketServer, RpcMockBuilder,
};
use futures_util::future::join_all;
use rpc_access_core::{
    events::Notification,
    runtime::{AccessRuntime, RuntimeError},
    types::{FeeData, ProviderClass},
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::timeout;

#[tokio::test]
async fn test_runtime_builds_every_configured_chain() {
    let mut eth = RpcMockBuilder::new().await;
    eth.mock_block_number(1);
    let mut base = RpcMockBuilder::new().await;
    base.mock_block_number(2);

    let config = test_app_config(vec![
        chain_config("eth", vec![http_entry("eth-a", &eth.url(), ProviderClass::Free)], vec![]),
        chain_config("base", vec![http_entry("base-a", &base.url(), ProviderClass::Free)], vec![]),
    ]);
    let runtime = AccessRuntime::builder().with_config(config).build().expect("runtime builds");

    assert_eq!(runtime.chains().len(), 2);
    assert!(runtime.chain("polygon").is_none());

    let eth_access = runtime.chain("eth").expect("eth configured");
    let base_access = runtime.chain("base").expect("base configured");
    assert!(eth_access.websocket().is_none(), "no ws endpoints configured");
    assert_eq!(eth_access.request("eth_blockNumber", serde_json::json!([])).await.unwrap(), "0x1");
    assert_eq!(base_access.request("eth_blockNumber", serde_json::json!([])).await.unwrap(), "0x2");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_rejected_at_build() {
    let config = test_app_config(vec![chain_config(
        "eth",
        vec![http_entry("bad", "not-a-url", ProviderClass::Free)],
        vec![],
    )]);

    let result = AccessRuntime::builder().with_config(config).build();
    assert!(matches!(result, Err(RuntimeError::ConfigValidation(_))));

    let result = AccessRuntime::builder().with_config(test_app_config(vec![])).build();
    assert!(matches!(result, Err(RuntimeError::NoChains)));
}

#[tokio::test]
async fn test_concurrent_gas_reads_share_one_fetch() {
    let mut node = RpcMockBuilder::new().await;
    node.mock_gas_price(30_000_000_000).mock_priority_fee(1_500_000_000);

    let config = test_app_config(vec![chain_config(
        "eth",
        vec![http_entry("node", &node.url(), ProviderClass::Free)],
        vec![],
    )]);
    let runtime = AccessRuntime::builder()
        .with_config(config)
        .disable_self_healing()
        .build()
        .expect("runtime builds");
    let access = runtime.chain("eth").expect("chain exists");

    let results = join_all((0..10).map(|_| access.get_gas_price())).await;
    let expected = FeeData {
        gas_price: 30_000_000_000,
        max_priority_fee_per_gas: Some(1_500_000_000),
    };
    for result in results {
        assert_eq!(result.expect("gas price available"), expected);
    }

    let gas = access.stats().gas;
    assert_eq!(gas.fetches, 1, "concurrent callers must share one upstream fetch");
    assert_eq!(gas.coalesced, 9);

    // Served from cache, no new fetch.
    assert_eq!(access.get_gas_price().await.unwrap(), expected);
    assert_eq!(access.stats().gas.fetches, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_runtime_forwards_blocks_and_shuts_down_cleanly() {
    let server = MockWebSocketServer::new().await.unwrap();
    let mut node = RpcMockBuilder::new().await;
    node.mock_block_number(1);

    let config = test_app_config(vec![chain_config(
        "eth",
        vec![http_entry("node", &node.url(), ProviderClass::Free)],
        vec![server.url()],
    )]);
    let runtime = AccessRuntime::builder().with_config(config).build().expect("runtime builds");
    let mut notifications = runtime.subscribe();
    let access = Arc::clone(runtime.chain("eth").expect("chain exists"));

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    access
        .on_block(move |block| {
            assert_eq!(block.chain.as_ref(), "eth");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("websocket configured");

    assert!(server.wait_for_subscription(Duration::from_secs(3)).await);
    let manager = access.websocket().expect("websocket configured");
    assert!(wait_until(Duration::from_secs(2), || manager.active_connection().is_some()).await);

    server.send_new_heads_full(500);
    let block = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Notification::NewBlock(block)) = notifications.recv().await {
                return block;
            }
        }
    })
    .await
    .expect("block notification");
    assert_eq!(block.number, 500);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(access.stats().websocket[0].last_block, Some(500));

    let first = timeout(Duration::from_secs(5), runtime.shutdown()).await;
    let second = timeout(Duration::from_secs(5), runtime.shutdown()).await;
    assert!(first.is_ok() && second.is_ok(), "shutdown should not hang");
    assert!(runtime.is_shut_down());

    assert!(manager.connections().iter().all(|c| c.is_shut_down()));
    assert!(wait_until(Duration::from_secs(2), || server.active_connections() == 0).await);

    // Disconnecting again after shutdown is a no-op.
    access.disconnect().await;
}

#[tokio::test]
async fn test_shutdown_without_websocket_connection() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.set_reject_connections(true);
    let mut node = RpcMockBuilder::new().await;
    node.mock_block_number(1);

    let config = test_app_config(vec![chain_config(
        "eth",
        vec![http_entry("node", &node.url(), ProviderClass::Free)],
        vec![server.url()],
    )]);
    let runtime = AccessRuntime::builder().with_config(config).build().expect("runtime builds");
    let mut shutdown_rx = runtime.shutdown_receiver();

    // The feed never comes up; shutdown must still complete promptly.
    tokio::time::sleep(Duration::from_millis(100)).await;
    timeout(Duration::from_secs(5), runtime.shutdown()).await.expect("shutdown completes");
    assert!(shutdown_rx.try_recv().is_ok(), "shutdown is broadcast");
    assert_eq!(server.connection_count(), 0);
}
