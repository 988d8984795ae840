//! Mock WebSocket Server for Testing
//!
//! Speaks just enough of an Ethereum node's WebSocket API for subscription tests:
//! `eth_subscribe` is confirmed, `eth_blockNumber` heartbeats are answered while
//! heartbeat answering is on, and `newHeads` notifications can be pushed on demand.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const SUBSCRIPTION_ID: &str = "0x9ce59a13059e417087c02d3236a0b9cc";

#[derive(Debug, Clone)]
enum Command {
    Push(String),
    Disconnect,
}

#[derive(Default)]
struct ServerState {
    connections: AtomicUsize,
    active: AtomicUsize,
    answer_heartbeats: AtomicBool,
    reject_connections: AtomicBool,
    close_after_subscribe: AtomicBool,
    block_number: AtomicU64,
    received_messages: RwLock<Vec<String>>,
}

/// A mock WebSocket server for testing.
pub struct MockWebSocketServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    commands: broadcast::Sender<Command>,
    server_handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockWebSocketServer {
    /// Creates a new mock WebSocket server on a random available port.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to a local port or retrieve the bound address.
    pub async fn new() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(ServerState::default());
        state.answer_heartbeats.store(true, Ordering::SeqCst);
        let (commands, _) = broadcast::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        let server_handle =
            Self::spawn_server(listener, state.clone(), commands.clone(), shutdown_tx.subscribe());

        Ok(Self { addr, state, commands, server_handle, shutdown_tx })
    }

    fn spawn_server(
        listener: TcpListener,
        state: Arc<ServerState>,
        commands: broadcast::Sender<Command>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok((stream, _)) = result {
                            if state.reject_connections.load(Ordering::SeqCst) {
                                drop(stream);
                                continue;
                            }
                            tokio::spawn(Self::handle_connection(
                                stream,
                                state.clone(),
                                commands.subscribe(),
                            ));
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        state: Arc<ServerState>,
        mut commands: broadcast::Receiver<Command>,
    ) {
        let Ok(ws_stream) = accept_async(stream).await else { return };
        state.connections.fetch_add(1, Ordering::SeqCst);
        state.active.fetch_add(1, Ordering::SeqCst);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        state.received_messages.write().await.push(text.to_string());
                        if let Some(reply) = Self::reply_to(&state, text.as_str()) {
                            if write.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                        if text.contains("eth_subscribe")
                            && state.close_after_subscribe.load(Ordering::SeqCst)
                        {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                command = commands.recv() => match command {
                    Ok(Command::Push(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Command::Disconnect) | Err(broadcast::error::RecvError::Closed) => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }

        state.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn reply_to(state: &ServerState, text: &str) -> Option<String> {
        let request: Value = serde_json::from_str(text).ok()?;
        let id = request.get("id")?.clone();
        match request.get("method").and_then(Value::as_str)? {
            "eth_subscribe" => {
                Some(json!({ "jsonrpc": "2.0", "id": id, "result": SUBSCRIPTION_ID }).to_string())
            }
            "eth_blockNumber" if state.answer_heartbeats.load(Ordering::SeqCst) => {
                let block = state.block_number.load(Ordering::SeqCst);
                Some(json!({ "jsonrpc": "2.0", "id": id, "result": format!("0x{block:x}") }).to_string())
            }
            _ => None,
        }
    }

    /// Returns the WebSocket URL for connecting to this server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of completed handshakes since start.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Stops (or resumes) answering `eth_blockNumber` heartbeats. The socket stays open.
    pub fn set_answer_heartbeats(&self, answer: bool) {
        self.state.answer_heartbeats.store(answer, Ordering::SeqCst);
    }

    /// Drops new TCP connections before the handshake while set.
    pub fn set_reject_connections(&self, reject: bool) {
        self.state.reject_connections.store(reject, Ordering::SeqCst);
    }

    /// Closes each session right after confirming its subscription while set.
    pub fn set_close_after_subscribe(&self, close: bool) {
        self.state.close_after_subscribe.store(close, Ordering::SeqCst);
    }

    /// Sends a `newHeads` notification to every open session.
    pub fn send_new_heads(&self, block_number: u64, block_hash: &str) {
        self.state.block_number.store(block_number, Ordering::SeqCst);
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": SUBSCRIPTION_ID,
                "result": {
                    "number": format!("0x{:x}", block_number),
                    "hash": block_hash,
                    "parentHash": format!("0x{:064x}", block_number.saturating_sub(1)),
                    "timestamp": format!("0x{:x}", 1_600_000_000 + block_number),
                    "gasLimit": "0x1c9c380",
                    "gasUsed": "0x0",
                    "baseFeePerGas": "0x7"
                }
            }
        });
        let _ = self.commands.send(Command::Push(msg.to_string()));
    }

    /// Sends a `newHeads` notification with a hash derived from the number.
    pub fn send_new_heads_full(&self, block_number: u64) {
        let block_hash = format!("0x{block_number:064x}");
        self.send_new_heads(block_number, &block_hash);
    }

    /// Closes every open session from the server side.
    pub fn force_disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Waits until at least `count` handshakes have completed.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.connection_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Waits for a subscription request to be received.
    pub async fn wait_for_subscription(&self, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            let received = self.state.received_messages.read().await;
            if received.iter().any(|msg| msg.contains("eth_subscribe")) {
                return true;
            }
            drop(received);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Returns all received messages.
    pub async fn get_received_messages(&self) -> Vec<String> {
        self.state.received_messages.read().await.clone()
    }

    /// Shuts down the server.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.server_handle.abort();
    }
}

impl Drop for MockWebSocketServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.commands.send(Command::Disconnect);
        self.server_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::connect_async;

    async fn next_text(
        stream: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
    ) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => return text.to_string(),
                Ok(Some(Ok(_))) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_mock_websocket_server_creation() {
        let server = MockWebSocketServer::new().await.unwrap();
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_and_heartbeat_replies() {
        let server = MockWebSocketServer::new().await.unwrap();
        let (mut ws, _) = connect_async(server.url()).await.expect("Failed to connect");

        let subscribe = json!({"jsonrpc": "2.0", "id": 1, "method": "eth_subscribe", "params": ["newHeads"]});
        ws.send(Message::Text(subscribe.to_string().into())).await.unwrap();
        assert!(next_text(&mut ws).await.contains(SUBSCRIPTION_ID));

        let ping = json!({"jsonrpc": "2.0", "id": 7, "method": "eth_blockNumber", "params": []});
        ws.send(Message::Text(ping.to_string().into())).await.unwrap();
        let reply: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(reply["id"], 7);

        assert!(server.wait_for_connections(1, Duration::from_secs(1)).await);
        assert!(server.wait_for_subscription(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_new_heads_pushed_to_open_sessions() {
        let server = MockWebSocketServer::new().await.unwrap();
        let (mut ws, _) = connect_async(server.url()).await.expect("Failed to connect");
        assert!(server.wait_for_connections(1, Duration::from_secs(1)).await);

        server.send_new_heads_full(1000);
        let text = next_text(&mut ws).await;
        assert!(text.contains("eth_subscription"));
        assert!(text.contains("0x3e8"));
    }
}
