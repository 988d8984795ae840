use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::WebSocketConfig,
    events::{Notification, NotificationBus},
    types::{BlockEvent, EndpointConfig},
    websocket::connection::{ConnectionState, WsConnection, WsConnectionStats},
};

const RECENT_BLOCKS: usize = 64;
const FORWARD_CHANNEL_CAPACITY: usize = 64;
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback invoked once per forwarded block.
pub type BlockListener = Arc<dyn Fn(&BlockEvent) + Send + Sync>;

/// Handle returned by [`WsResilienceManager::on_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Default)]
struct Routing {
    active: Option<usize>,
    all_down: bool,
}

struct ManagerInner {
    chain: Arc<str>,
    connections: Vec<WsConnection>,
    routing: Mutex<Routing>,
    listeners: RwLock<Vec<(ListenerId, BlockListener)>>,
    next_listener: AtomicU64,
    recent_blocks: Mutex<VecDeque<(u64, String)>>,
    blocks_tx: broadcast::Sender<BlockEvent>,
    notifications: NotificationBus,
}

/// Keeps several `newHeads` subscriptions for one chain and forwards blocks from one of them.
///
/// Exactly one connected subscription is active at a time. When it drops, the next
/// connected one takes over and a failover notification is emitted; when none is left an
/// all-down notification is emitted. Blocks are forwarded to every listener exactly once,
/// and only when delivered by the active connection.
pub struct WsResilienceManager {
    inner: Arc<ManagerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
    cleaned_up: AtomicBool,
}

impl WsResilienceManager {
    /// Creates one connection per endpoint, up to `max_connections`.
    #[must_use]
    pub fn new(
        chain: &str,
        endpoints: Vec<EndpointConfig>,
        config: &WebSocketConfig,
        notifications: NotificationBus,
    ) -> Self {
        let limit = config.max_connections.max(1);
        if endpoints.len() > limit {
            warn!(
                chain,
                configured = endpoints.len(),
                max_connections = limit,
                "more websocket endpoints than allowed, extra endpoints ignored"
            );
        }

        let connections = endpoints
            .into_iter()
            .take(limit)
            .map(|endpoint| WsConnection::new(endpoint, config.clone(), notifications.clone()))
            .collect();
        let (blocks_tx, _) = broadcast::channel(FORWARD_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(ManagerInner {
                chain: Arc::from(chain),
                connections,
                routing: Mutex::new(Routing::default()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                recent_blocks: Mutex::new(VecDeque::with_capacity(RECENT_BLOCKS)),
                blocks_tx,
                notifications,
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<str> {
        &self.inner.chain
    }

    #[must_use]
    pub fn connections(&self) -> &[WsConnection] {
        &self.inner.connections
    }

    /// Connects every subscription and starts routing. Returns the number connected.
    ///
    /// Connections that fail keep retrying in the background. Calling it twice is a no-op.
    pub async fn start(&self) -> usize {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.connected_count();
        }

        {
            let mut tasks = self.tasks.lock();
            for index in 0..self.inner.connections.len() {
                tasks.push(self.spawn_watcher(index));
            }
        }

        let results = join_all(self.inner.connections.iter().map(WsConnection::connect)).await;
        for (connection, result) in self.inner.connections.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    chain = %self.inner.chain,
                    connection = %connection.name(),
                    error = %e,
                    "initial websocket connect failed, retrying in background"
                );
                connection.ensure_reconnecting();
            }
        }

        // Activation normally happens in the watchers; settle it here so callers see it.
        for (index, connection) in self.inner.connections.iter().enumerate() {
            self.inner.on_state_change(index, connection.state());
        }

        let connected = self.connected_count();
        if connected == 0 && !self.inner.connections.is_empty() {
            self.inner.declare_all_down();
        }
        info!(
            chain = %self.inner.chain,
            connected,
            total = self.inner.connections.len(),
            "websocket manager started"
        );
        connected
    }

    fn spawn_watcher(&self, index: usize) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let connection = inner.connections[index].clone();
        let mut state_rx: watch::Receiver<ConnectionState> = connection.state_receiver();
        let mut blocks_rx = connection.subscribe_blocks();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow_and_update();
                        inner.on_state_change(index, state);
                    }
                    block = blocks_rx.recv() => match block {
                        Ok(event) => inner.forward(index, event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(connection = %connection.name(), skipped, "block watcher lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!(connection = %connection.name(), "connection watcher stopped");
        })
    }

    /// Registers a block callback. It runs on the manager's task and must not block.
    pub fn on_block<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BlockEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() < before
    }

    /// Stream of forwarded blocks, already deduplicated.
    #[must_use]
    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.inner.blocks_tx.subscribe()
    }

    #[must_use]
    pub fn active_connection(&self) -> Option<WsConnection> {
        let active = self.inner.routing.lock().active;
        active.map(|index| self.inner.connections[index].clone())
    }

    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.inner.connections.iter().filter(|c| c.is_connected()).count()
    }

    #[must_use]
    pub fn status(&self) -> Vec<WsConnectionStats> {
        self.inner.connections.iter().map(WsConnection::stats).collect()
    }

    /// Stops routing and shuts every connection down. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!(chain = %self.inner.chain, "websocket manager already cleaned up");
            return;
        }

        let _ = self.shutdown_tx.send(());
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        join_all(self.inner.connections.iter().map(WsConnection::cleanup)).await;
        self.inner.routing.lock().active = None;
        self.inner.listeners.write().clear();
        info!(chain = %self.inner.chain, "websocket manager cleaned up");
    }
}

impl ManagerInner {
    fn name_of(&self, index: usize) -> Arc<str> {
        self.connections[index].name().clone()
    }

    fn on_state_change(&self, index: usize, state: ConnectionState) {
        let mut routing = self.routing.lock();
        let current = routing.active;
        match current {
            None if state == ConnectionState::Connected => {
                routing.active = Some(index);
                let recovered = std::mem::take(&mut routing.all_down);
                info!(chain = %self.chain, connection = %self.name_of(index), "websocket connection active");
                if recovered {
                    self.notifications.emit(Notification::WebsocketFailover {
                        chain: self.chain.clone(),
                        from: None,
                        to: self.name_of(index),
                    });
                }
            }
            Some(active) if active == index && state != ConnectionState::Connected => {
                let next = self
                    .connections
                    .iter()
                    .enumerate()
                    .find(|(i, c)| *i != index && c.is_connected())
                    .map(|(i, _)| i);
                routing.active = next;
                match next {
                    Some(next) => {
                        warn!(
                            chain = %self.chain,
                            from = %self.name_of(index),
                            to = %self.name_of(next),
                            "websocket failover"
                        );
                        self.notifications.emit(Notification::WebsocketFailover {
                            chain: self.chain.clone(),
                            from: Some(self.name_of(index)),
                            to: self.name_of(next),
                        });
                    }
                    None => {
                        routing.all_down = true;
                        drop(routing);
                        self.emit_all_down();
                    }
                }
            }
            _ => {}
        }
    }

    fn declare_all_down(&self) {
        {
            let mut routing = self.routing.lock();
            if routing.active.is_some() || routing.all_down {
                return;
            }
            routing.all_down = true;
        }
        self.emit_all_down();
    }

    fn emit_all_down(&self) {
        let endpoints: Vec<Arc<str>> = self.connections.iter().map(|c| c.name().clone()).collect();
        error!(chain = %self.chain, endpoints = endpoints.len(), "all websocket connections are down");
        self.notifications
            .emit(Notification::WebsocketAllDown { chain: self.chain.clone(), endpoints });
    }

    fn forward(&self, index: usize, event: BlockEvent) {
        if self.routing.lock().active != Some(index) {
            return;
        }

        {
            let mut recent = self.recent_blocks.lock();
            if recent.iter().any(|(number, hash)| *number == event.number && *hash == event.hash) {
                return;
            }
            recent.push_back((event.number, event.hash.clone()));
            if recent.len() > RECENT_BLOCKS {
                recent.pop_front();
            }
        }

        let listeners: Vec<BlockListener> =
            self.listeners.read().iter().map(|(_, listener)| Arc::clone(listener)).collect();
        for listener in &listeners {
            listener(&event);
        }
        let _ = self.blocks_tx.send(event.clone());
        self.notifications.emit(Notification::NewBlock(event));
    }
}
