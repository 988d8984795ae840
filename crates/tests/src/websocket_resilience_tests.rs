//! Tests for WebSocket subscription resilience
//!
//! Runs real connections against `MockWebSocketServer` with timers scaled down to tens of
//! milliseconds. Covers heartbeat loss, proactive refresh, the reconnect circuit breaker,
//! failover between subscriptions and exactly-once block forwarding.

use crate::mock_infrastructure::{chain_config, fast_websocket_config, wait_until, MockWebSocketServer};
use rpc_access_core::{
    config::WebSocketConfig,
    events::{Notification, NotificationBus},
    types::EndpointConfig,
    upstream::WsError,
    websocket::{ConnectionState, WsConnection, WsResilienceManager},
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};

fn ws_endpoints(servers: &[&MockWebSocketServer]) -> Vec<EndpointConfig> {
    chain_config("eth", vec![], servers.iter().map(|s| s.url()).collect()).ws_endpoints()
}

async fn next_matching<F>(
    rx: &mut broadcast::Receiver<Notification>,
    timeout: Duration,
    predicate: F,
) -> Option<Notification>
where
    F: Fn(&Notification) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(notification) if predicate(&notification) => return Some(notification),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_missed_heartbeats_trigger_reconnect() {
    let server = MockWebSocketServer::new().await.unwrap();
    let endpoint = ws_endpoints(&[&server]).remove(0);
    let connection = WsConnection::new(endpoint, fast_websocket_config(), NotificationBus::new());

    connection.connect().await.expect("initial connect");
    assert!(connection.is_connected());

    // The socket stays open but stops answering, so only the heartbeat can notice.
    server.set_answer_heartbeats(false);
    assert!(
        server.wait_for_connections(2, Duration::from_secs(3)).await,
        "connection should be re-established after missed heartbeats"
    );

    server.set_answer_heartbeats(true);
    assert!(wait_until(Duration::from_secs(2), || connection.is_connected()).await);

    // One heartbeat loss is one reconnect; the healthy replacement must stay put.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.connection_count(), 2);
    let stats = connection.stats();
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.missed_heartbeats, 0);

    connection.cleanup().await;
}

#[tokio::test]
async fn test_heartbeats_keep_healthy_connection_open() {
    let server = MockWebSocketServer::new().await.unwrap();
    let endpoint = ws_endpoints(&[&server]).remove(0);
    let connection = WsConnection::new(endpoint, fast_websocket_config(), NotificationBus::new());

    connection.connect().await.expect("initial connect");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(server.connection_count(), 1, "answered heartbeats must not cause reconnects");
    assert_eq!(connection.stats().missed_heartbeats, 0);
    let pings = server
        .get_received_messages()
        .await
        .iter()
        .filter(|m| m.contains("eth_blockNumber"))
        .count();
    assert!(pings >= 3, "expected periodic heartbeats, saw {pings}");

    connection.cleanup().await;
}

#[tokio::test]
async fn test_proactive_refresh_replaces_connection() {
    let server = MockWebSocketServer::new().await.unwrap();
    let endpoint = ws_endpoints(&[&server]).remove(0);
    let config = WebSocketConfig { refresh_interval_seconds: 1, ..fast_websocket_config() };
    let connection = WsConnection::new(endpoint, config, NotificationBus::new());

    connection.connect().await.expect("initial connect");

    let mut states = connection.state_receiver();
    let left_connected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&left_connected);
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            if *states.borrow_and_update() != ConnectionState::Connected {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    assert!(server.wait_for_connections(2, Duration::from_secs(3)).await, "refresh should reconnect");
    assert!(wait_until(Duration::from_secs(1), || server.active_connections() == 1).await);
    assert!(connection.is_connected());
    assert_eq!(left_connected.load(Ordering::SeqCst), 0, "refresh must not pass through Disconnected");
    let stats = connection.stats();
    assert!(stats.connects >= 2);
    assert_eq!(stats.reconnect_attempts, 0, "refresh is not a reconnect");

    watcher.abort();
    connection.cleanup().await;
}

#[tokio::test]
async fn test_manager_reports_no_outage_across_refresh() {
    let server = MockWebSocketServer::new().await.unwrap();
    let bus = NotificationBus::new();
    let mut rx = bus.subscribe();
    let config = WebSocketConfig { refresh_interval_seconds: 1, ..fast_websocket_config() };
    let manager = WsResilienceManager::new("eth", ws_endpoints(&[&server]), &config, bus);
    assert_eq!(manager.start().await, 1);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(server.connection_count() >= 2, "at least one refresh should have happened");
    assert!(manager.active_connection().is_some());

    let mut outages = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(
                notification @ (Notification::WebsocketAllDown { .. }
                | Notification::WebsocketFailover { .. }),
            ) => outages.push(notification),
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert!(outages.is_empty(), "refresh reported as outage: {outages:?}");

    manager.cleanup().await;
}

#[tokio::test]
async fn test_short_lived_sessions_keep_reconnecting() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.set_close_after_subscribe(true);
    let endpoint = ws_endpoints(&[&server]).remove(0);
    let config = WebSocketConfig { max_reconnect_attempts: 100, ..fast_websocket_config() };
    let connection = WsConnection::new(endpoint, config, NotificationBus::new());

    // Each session is dropped by the server as soon as it is subscribed, so every
    // reconnect ends before the reconnect loop that started it has returned.
    connection.connect().await.expect("initial connect");
    assert!(
        server.wait_for_connections(5, Duration::from_secs(5)).await,
        "reconnects stalled after {} sessions",
        server.connection_count()
    );

    server.set_close_after_subscribe(false);
    assert!(wait_until(Duration::from_secs(2), || connection.is_connected()).await);

    connection.cleanup().await;
}

#[tokio::test]
async fn test_circuit_opens_and_blocks_dialing() {
    let server = MockWebSocketServer::new().await.unwrap();
    server.set_reject_connections(true);

    let bus = NotificationBus::new();
    let mut rx = bus.subscribe();
    let endpoint = ws_endpoints(&[&server]).remove(0);
    let connection = WsConnection::new(endpoint, fast_websocket_config(), bus);

    for _ in 0..fast_websocket_config().max_reconnect_attempts {
        assert!(connection.connect().await.is_err());
    }
    assert_eq!(connection.state(), ConnectionState::CircuitOpen);

    let opened = next_matching(&mut rx, Duration::from_secs(1), |n| {
        matches!(n, Notification::CircuitOpen { .. })
    })
    .await;
    match opened {
        Some(Notification::CircuitOpen { cooldown, .. }) => {
            assert_eq!(cooldown, Duration::from_millis(60_000));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    // The server is back, but the open circuit must not dial it.
    server.set_reject_connections(false);
    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, WsError::CircuitOpen { .. }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.connection_count(), 0);

    connection.cleanup().await;
}

#[tokio::test]
async fn test_connection_cleanup_is_idempotent() {
    let server = MockWebSocketServer::new().await.unwrap();
    let endpoint = ws_endpoints(&[&server]).remove(0);
    let connection = WsConnection::new(endpoint, fast_websocket_config(), NotificationBus::new());
    connection.connect().await.expect("initial connect");

    tokio::join!(connection.cleanup(), connection.cleanup());
    connection.cleanup().await;

    assert!(connection.is_shut_down());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert!(wait_until(Duration::from_secs(2), || server.active_connections() == 0).await);
    assert!(matches!(connection.connect().await, Err(WsError::ShutDown)));

    // No reconnect may follow a cleanup.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_manager_fails_over_to_standby() {
    let primary = MockWebSocketServer::new().await.unwrap();
    let standby = MockWebSocketServer::new().await.unwrap();
    let servers = [&primary, &standby];

    let bus = NotificationBus::new();
    let mut rx = bus.subscribe();
    let config = fast_websocket_config();
    let manager = WsResilienceManager::new("eth", ws_endpoints(&servers), &config, bus);
    assert_eq!(manager.start().await, 2);

    let active = manager.active_connection().expect("one connection is active");
    let active_index = manager
        .connections()
        .iter()
        .position(|c| c.name() == active.name())
        .expect("active is managed");
    let other_name = manager.connections()[1 - active_index].name().clone();

    servers[active_index].set_reject_connections(true);
    servers[active_index].force_disconnect();

    let failover = next_matching(&mut rx, Duration::from_secs(3), |n| {
        matches!(n, Notification::WebsocketFailover { from: Some(_), .. })
    })
    .await;
    match failover {
        Some(Notification::WebsocketFailover { from, to, .. }) => {
            assert_eq!(from.as_ref(), Some(active.name()));
            assert_eq!(to, other_name);
        }
        other => panic!("expected WebsocketFailover, got {other:?}"),
    }
    assert_eq!(manager.active_connection().map(|c| c.name().clone()), Some(other_name));

    manager.cleanup().await;
}

#[tokio::test]
async fn test_manager_reports_all_down_and_recovery() {
    let server = MockWebSocketServer::new().await.unwrap();
    let bus = NotificationBus::new();
    let mut rx = bus.subscribe();
    // Enough attempts that the circuit stays closed while the server is away.
    let config = WebSocketConfig { max_reconnect_attempts: 100, ..fast_websocket_config() };
    let manager = WsResilienceManager::new("eth", ws_endpoints(&[&server]), &config, bus);
    assert_eq!(manager.start().await, 1);

    server.set_reject_connections(true);
    server.force_disconnect();

    let all_down = next_matching(&mut rx, Duration::from_secs(3), |n| {
        matches!(n, Notification::WebsocketAllDown { .. })
    })
    .await;
    assert!(all_down.is_some(), "losing the only connection is reported");
    assert!(manager.active_connection().is_none());

    server.set_reject_connections(false);
    let recovered = next_matching(&mut rx, Duration::from_secs(3), |n| {
        matches!(n, Notification::WebsocketFailover { from: None, .. })
    })
    .await;
    assert!(recovered.is_some(), "recovery after all-down is reported");
    assert!(manager.active_connection().is_some());

    manager.cleanup().await;
}

#[tokio::test]
async fn test_blocks_forwarded_exactly_once() {
    let first = MockWebSocketServer::new().await.unwrap();
    let second = MockWebSocketServer::new().await.unwrap();

    let config = fast_websocket_config();
    let manager =
        WsResilienceManager::new("eth", ws_endpoints(&[&first, &second]), &config, NotificationBus::new());

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    manager.on_block(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut blocks = manager.subscribe_blocks();

    assert_eq!(manager.start().await, 2);
    assert!(first.wait_for_subscription(Duration::from_secs(1)).await);
    assert!(second.wait_for_subscription(Duration::from_secs(1)).await);

    // Both subscriptions see the same head, and one of them repeats it.
    first.send_new_heads(100, "0xaaa");
    second.send_new_heads(100, "0xaaa");
    first.send_new_heads(100, "0xaaa");
    second.send_new_heads(100, "0xaaa");

    let event = tokio::time::timeout(Duration::from_secs(2), blocks.recv())
        .await
        .expect("block forwarded")
        .expect("channel open");
    assert_eq!(event.number, 100);
    assert_eq!(event.hash, "0xaaa");
    assert_eq!(Some(&event.source), manager.active_connection().as_ref().map(WsConnection::name));

    first.send_new_heads(101, "0xbbb");
    second.send_new_heads(101, "0xbbb");
    let event = tokio::time::timeout(Duration::from_secs(2), blocks.recv())
        .await
        .expect("block forwarded")
        .expect("channel open");
    assert_eq!(event.number, 101);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    assert!(blocks.try_recv().is_err(), "no duplicate deliveries");

    manager.cleanup().await;
}

#[tokio::test]
async fn test_manager_cleanup_is_idempotent() {
    let server = MockWebSocketServer::new().await.unwrap();
    let config = fast_websocket_config();
    let manager = WsResilienceManager::new("eth", ws_endpoints(&[&server]), &config, NotificationBus::new());
    assert_eq!(manager.start().await, 1);

    manager.cleanup().await;
    manager.cleanup().await;

    assert!(manager.connections().iter().all(WsConnection::is_shut_down));
    assert!(manager.active_connection().is_none());
    assert!(wait_until(Duration::from_secs(2), || server.active_connections() == 0).await);
}
