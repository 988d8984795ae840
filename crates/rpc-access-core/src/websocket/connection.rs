use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, watch},
    task::JoinHandle,
    time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{
    config::WebSocketConfig,
    events::{Notification, NotificationBus},
    types::{parse_hex_quantity, BlockEvent, EndpointConfig},
    upstream::{circuit_breaker::CircuitBreaker, errors::WsError},
    websocket::backoff::ReconnectPolicy,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIBE_ID: u64 = 1;
const BLOCK_CHANNEL_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a [`WsConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnects are suspended until the circuit cooldown elapses.
    CircuitOpen,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct WsConnectionStats {
    pub name: Arc<str>,
    pub state: ConnectionState,
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u32,
    pub missed_heartbeats: u32,
    pub circuit_failures: u32,
    pub last_block: Option<u64>,
}

enum SessionEnd {
    Closed,
    HeartbeatTimeout,
    /// Proactive refresh; carries the already subscribed replacement socket.
    Refresh(Box<WsStream>),
    Shutdown,
}

struct Session {
    close_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// A single `newHeads` subscription with heartbeat, reconnect and circuit breaking.
///
/// The handle is cheap to clone. While connected, a session task reads the socket,
/// sends `eth_blockNumber` heartbeats and drops the socket once
/// `max_missed_heartbeats` in a row go unanswered. Every unplanned disconnect schedules
/// exactly one reconnect loop with exponential backoff. After `max_reconnect_attempts`
/// consecutive failures the circuit opens and the connection refuses to dial until the
/// cooldown has elapsed.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: EndpointConfig,
    config: WebSocketConfig,
    policy: ReconnectPolicy,
    circuit: CircuitBreaker,
    state_tx: watch::Sender<ConnectionState>,
    blocks_tx: broadcast::Sender<BlockEvent>,
    notifications: NotificationBus,
    connect_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<Session>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_scheduled: AtomicBool,
    reconnect_attempts: AtomicU32,
    missed_heartbeats: AtomicU32,
    cleaning_up: AtomicBool,
    shut_down: AtomicBool,
    connects: AtomicU64,
    disconnects: AtomicU64,
    last_block: AtomicU64,
    next_id: AtomicU64,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("name", &self.inner.endpoint.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WsConnection {
    #[must_use]
    pub fn new(endpoint: EndpointConfig, config: WebSocketConfig, notifications: NotificationBus) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (blocks_tx, _) = broadcast::channel(BLOCK_CHANNEL_CAPACITY);
        let inner = ConnectionInner {
            policy: ReconnectPolicy::from_config(&config),
            circuit: CircuitBreaker::new(
                config.max_reconnect_attempts,
                config.circuit_breaker_cooldown(),
            ),
            endpoint,
            config,
            state_tx,
            blocks_tx,
            notifications,
            connect_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            reconnect_scheduled: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            missed_heartbeats: AtomicU32::new(0),
            cleaning_up: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            last_block: AtomicU64::new(0),
            next_id: AtomicU64::new(SUBSCRIBE_ID + 1),
        };
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.inner.endpoint.name
    }

    #[must_use]
    pub fn endpoint(&self) -> &EndpointConfig {
        &self.inner.endpoint
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watches state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receives the heads delivered by this connection.
    #[must_use]
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.inner.blocks_tx.subscribe()
    }

    /// Dials the endpoint and subscribes to `newHeads`.
    ///
    /// Returns immediately when already connected.
    ///
    /// # Errors
    ///
    /// - [`WsError::CircuitOpen`] while the circuit is open; no network call is made
    /// - [`WsError::ShutDown`] after [`cleanup`](Self::cleanup)
    /// - [`WsError::Connect`], [`WsError::Subscribe`] or [`WsError::Timeout`] if the
    ///   handshake fails
    pub async fn connect(&self) -> Result<(), WsError> {
        self.inner.connect().await
    }

    /// Starts the reconnect loop unless one is already running.
    pub fn ensure_reconnecting(&self) {
        self.inner.schedule_reconnect();
    }

    /// Stops the connection for good. Safe to call repeatedly and concurrently.
    ///
    /// Errors while closing the socket are logged and otherwise ignored.
    pub async fn cleanup(&self) {
        let inner = &self.inner;
        if inner
            .cleaning_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(connection = %inner.endpoint.name, "cleanup already in progress");
            return;
        }
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            inner.cleaning_up.store(false, Ordering::SeqCst);
            return;
        }

        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }

        let session = inner.session.lock().take();
        if let Some(mut session) = session {
            if let Some(close_tx) = session.close_tx.take() {
                if close_tx.send(()).is_err() {
                    debug!(connection = %inner.endpoint.name, "session already finished");
                }
            }
            match timeout(CLOSE_TIMEOUT, &mut session.task).await {
                Ok(Err(e)) if e.is_panic() => {
                    warn!(connection = %inner.endpoint.name, error = %e, "session task panicked");
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(connection = %inner.endpoint.name, "session did not close in time, aborting");
                    session.task.abort();
                }
            }
        }

        inner.set_state(ConnectionState::Disconnected);
        inner.cleaning_up.store(false, Ordering::SeqCst);
        info!(connection = %inner.endpoint.name, "websocket connection cleaned up");
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.inner.set_state(state);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> WsConnectionStats {
        let inner = &self.inner;
        let last_block = inner.last_block.load(Ordering::Relaxed);
        WsConnectionStats {
            name: inner.endpoint.name.clone(),
            state: self.state(),
            connects: inner.connects.load(Ordering::Relaxed),
            disconnects: inner.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: inner.reconnect_attempts.load(Ordering::Relaxed),
            missed_heartbeats: inner.missed_heartbeats.load(Ordering::Relaxed),
            circuit_failures: inner.circuit.failure_count(),
            last_block: (last_block > 0).then_some(last_block),
        }
    }
}

impl ConnectionInner {
    fn set_state(&self, next: ConnectionState) {
        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });
        if let Some(previous) = previous {
            debug!(
                connection = %self.endpoint.name,
                from = previous.as_str(),
                to = next.as_str(),
                "connection state changed"
            );
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<(), WsError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(WsError::ShutDown);
        }
        if let Err(retry_at) = self.circuit.can_attempt() {
            self.set_state(ConnectionState::CircuitOpen);
            return Err(WsError::CircuitOpen { retry_at });
        }

        let _guard = self.connect_lock.lock().await;
        if *self.state_tx.borrow() == ConnectionState::Connected {
            return Ok(());
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(WsError::ShutDown);
        }

        self.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(mut stream) => {
                if self.shut_down.load(Ordering::SeqCst) {
                    if let Err(e) = stream.close(None).await {
                        debug!(connection = %self.endpoint.name, error = %e, "close after shutdown failed");
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return Err(WsError::ShutDown);
                }
                self.circuit.on_success();
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.missed_heartbeats.store(0, Ordering::SeqCst);
                self.connects.fetch_add(1, Ordering::Relaxed);
                self.set_state(ConnectionState::Connected);
                if !self.spawn_session(stream) {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(WsError::ShutDown);
                }
                info!(connection = %self.endpoint.name, "websocket connected and subscribed");
                Ok(())
            }
            Err(e) => {
                warn!(connection = %self.endpoint.name, error = %e, "websocket connect failed");
                match self.circuit.on_failure() {
                    Some(retry_at) => self.open_circuit(retry_at),
                    None => self.set_state(ConnectionState::Disconnected),
                }
                Err(e)
            }
        }
    }

    fn open_circuit(&self, retry_at: Instant) {
        self.set_state(ConnectionState::CircuitOpen);
        let cooldown = self.circuit.cooldown();
        let remaining = retry_at.saturating_duration_since(Instant::now());
        let retry_at_utc =
            chrono::Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_default();
        warn!(
            connection = %self.endpoint.name,
            cooldown_secs = cooldown.as_secs(),
            "circuit opened, reconnects suspended"
        );
        self.notifications.emit(Notification::CircuitOpen {
            endpoint: self.endpoint.name.clone(),
            cooldown,
            retry_at: retry_at_utc,
        });
    }

    async fn establish(&self) -> Result<WsStream, WsError> {
        let url = self.endpoint.url.as_str();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(WsError::InvalidUrl(format!(
                "{} must use ws:// or wss://",
                self.endpoint.name
            )));
        }

        let connect_timeout = self.config.connect_timeout();
        let (mut stream, response) = timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| WsError::Timeout)?
            .map_err(|e| WsError::Connect(describe_connect_error(&e)))?;
        debug!(
            connection = %self.endpoint.name,
            status = response.status().as_u16(),
            "websocket handshake complete"
        );

        let request = json!({
            "jsonrpc": "2.0",
            "id": SUBSCRIBE_ID,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        stream
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| WsError::Subscribe(format!("send failed: {e}")))?;

        let subscription_id = timeout(connect_timeout, wait_for_subscription(&mut stream))
            .await
            .map_err(|_| WsError::Timeout)??;
        info!(connection = %self.endpoint.name, subscription_id, "subscription confirmed");

        Ok(stream)
    }

    /// Returns `false` without spawning once cleanup has begun.
    fn spawn_session(self: &Arc<Self>, stream: WsStream) -> bool {
        let mut session = self.session.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            debug!(connection = %self.endpoint.name, "dropping stream established during shutdown");
            return false;
        }
        let (close_tx, close_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let end = inner.run_session(stream, close_rx).await;
            inner.on_session_end(end);
        });
        *session = Some(Session { close_tx: Some(close_tx), task });
        true
    }

    async fn run_session(
        &self,
        stream: WsStream,
        mut close_rx: oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let heartbeat_interval = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let max_missed = self.config.max_missed_heartbeats.max(1);
        let mut pending_heartbeat: Option<(u64, Instant)> = None;

        let refresh = refresh_timer(self.config.refresh_interval());
        tokio::pin!(refresh);

        let end = loop {
            let deadline = pending_heartbeat.map(|(_, deadline)| deadline);
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let response_id = self.handle_text(text.as_str());
                        if response_id.is_some() && response_id == pending_heartbeat.map(|(id, _)| id) {
                            pending_heartbeat = None;
                            self.missed_heartbeats.store(0, Ordering::SeqCst);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(connection = %self.endpoint.name, frame = ?frame, "websocket closed by server");
                        break SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = %self.endpoint.name, error = %e, "websocket read error");
                        break SessionEnd::Closed;
                    }
                    None => {
                        warn!(connection = %self.endpoint.name, "websocket stream ended");
                        break SessionEnd::Closed;
                    }
                },
                _ = heartbeat.tick() => {
                    if pending_heartbeat.is_none() {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let ping = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "method": "eth_blockNumber",
                            "params": []
                        });
                        if let Err(e) = write.send(Message::Text(ping.to_string().into())).await {
                            warn!(connection = %self.endpoint.name, error = %e, "heartbeat send failed");
                            break SessionEnd::Closed;
                        }
                        pending_heartbeat = Some((id, Instant::now() + self.config.heartbeat_timeout()));
                    }
                }
                () = heartbeat_deadline(deadline) => {
                    pending_heartbeat = None;
                    let missed = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(connection = %self.endpoint.name, missed, max_missed, "heartbeat missed");
                    if missed >= max_missed {
                        break SessionEnd::HeartbeatTimeout;
                    }
                }
                () = &mut refresh => {
                    info!(connection = %self.endpoint.name, "proactive connection refresh");
                    match self.establish().await {
                        Ok(replacement) => break SessionEnd::Refresh(Box::new(replacement)),
                        Err(e) => {
                            warn!(
                                connection = %self.endpoint.name,
                                error = %e,
                                "refresh handshake failed, keeping current connection"
                            );
                            refresh.set(refresh_timer(self.config.refresh_interval()));
                        }
                    }
                }
                _ = &mut close_rx => break SessionEnd::Shutdown,
            }
        };

        if let Err(e) = write.send(Message::Close(None)).await {
            debug!(connection = %self.endpoint.name, error = %e, "close frame not delivered");
        }
        if let Err(e) = write.close().await {
            debug!(connection = %self.endpoint.name, error = %e, "socket close failed");
        }
        end
    }

    /// Handles one text frame. Returns the id if the frame was a response.
    fn handle_text(&self, text: &str) -> Option<u64> {
        let Ok(json) = serde_json::from_str::<Value>(text) else {
            warn!(connection = %self.endpoint.name, "ignoring non-JSON frame");
            return None;
        };

        if json.get("method").and_then(Value::as_str) == Some("eth_subscription") {
            if let Some((number, hash)) = parse_new_head(&json) {
                self.last_block.store(number, Ordering::Relaxed);
                let event = BlockEvent {
                    chain: self.endpoint.chain.clone(),
                    number,
                    hash,
                    source: self.endpoint.name.clone(),
                };
                debug!(connection = %self.endpoint.name, block_number = number, "new head");
                let _ = self.blocks_tx.send(event);
            } else {
                debug!(connection = %self.endpoint.name, "subscription frame without a usable head");
            }
            return None;
        }

        json.get("id").and_then(Value::as_u64)
    }

    fn on_session_end(self: &Arc<Self>, end: SessionEnd) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);

        // The replacement was subscribed before the old socket closed; the state stays
        // `Connected` across the swap.
        if let SessionEnd::Refresh(replacement) = end {
            if self.spawn_session(*replacement) {
                self.connects.fetch_add(1, Ordering::Relaxed);
                self.missed_heartbeats.store(0, Ordering::SeqCst);
                info!(connection = %self.endpoint.name, "websocket connection refreshed");
            } else {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        }

        self.set_state(ConnectionState::Disconnected);
        if matches!(end, SessionEnd::Shutdown) || self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if matches!(end, SessionEnd::HeartbeatTimeout) {
            warn!(connection = %self.endpoint.name, "dropping connection after missed heartbeats");
        }

        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if self
            .reconnect_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(connection = %self.endpoint.name, "reconnect already scheduled");
            return;
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.reconnect_loop().await });
        *self.reconnect_task.lock() = Some(task);
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        loop {
            if self.shut_down.load(Ordering::SeqCst) {
                return;
            }

            if let Some(retry_at) = self.circuit.retry_at() {
                self.set_state(ConnectionState::CircuitOpen);
                sleep_until(retry_at).await;
                if self.shut_down.load(Ordering::SeqCst) {
                    return;
                }
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
                info!(connection = %self.endpoint.name, "circuit cooldown elapsed, resuming reconnects");
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.policy.delay(attempt);
            info!(
                connection = %self.endpoint.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "scheduling reconnect"
            );
            sleep(delay).await;

            // Released before dialing: a session that ends right after connecting must be
            // able to schedule the next reconnect.
            self.reconnect_scheduled.store(false, Ordering::SeqCst);
            match self.connect().await {
                Ok(()) | Err(WsError::ShutDown) => return,
                Err(e) => {
                    if !matches!(e, WsError::CircuitOpen { .. }) {
                        debug!(connection = %self.endpoint.name, attempt, error = %e, "reconnect attempt failed");
                    }
                    if self
                        .reconnect_scheduled
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_err()
                    {
                        debug!(connection = %self.endpoint.name, "another reconnect loop took over");
                        return;
                    }
                }
            }
        }
    }
}

async fn wait_for_subscription(stream: &mut WsStream) -> Result<String, WsError> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Ok(json) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if json.get("id").and_then(Value::as_u64) != Some(SUBSCRIBE_ID) {
                    continue;
                }
                if let Some(error) = json.get("error") {
                    return Err(WsError::Subscribe(error.to_string()));
                }
                return json
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| WsError::Subscribe("missing subscription id".to_string()));
            }
            Ok(Message::Close(_)) => {
                return Err(WsError::Subscribe("closed before subscription was confirmed".into()));
            }
            Ok(_) => {}
            Err(e) => return Err(WsError::Subscribe(e.to_string())),
        }
    }
    Err(WsError::Subscribe("stream ended before subscription was confirmed".into()))
}

/// Extracts `(number, hash)` from an `eth_subscription` frame.
fn parse_new_head(json: &Value) -> Option<(u64, String)> {
    let head = json.get("params")?.get("result")?;
    let number = head.get("number").and_then(Value::as_str).and_then(parse_hex_quantity)?;
    let hash = head.get("hash").and_then(Value::as_str)?;
    Some((u64::try_from(number).ok()?, hash.to_string()))
}

/// Maps handshake failures to messages that never echo the URL.
fn describe_connect_error(error: &tokio_tungstenite::tungstenite::Error) -> String {
    use tokio_tungstenite::tungstenite::Error;
    match error {
        Error::Http(response) => format!("handshake rejected with HTTP {}", response.status().as_u16()),
        Error::Io(e) => format!("io error: {}", e.kind()),
        Error::Url(_) => "invalid url".to_string(),
        other => other.to_string(),
    }
}

async fn heartbeat_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn refresh_timer(interval: Option<Duration>) {
    match interval {
        Some(interval) => sleep(interval).await,
        None => std::future::pending().await,
    }
}
