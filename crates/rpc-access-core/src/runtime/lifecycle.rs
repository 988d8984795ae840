//! Runtime lifecycle management including background tasks and graceful shutdown.

use crate::{
    config::AppConfig,
    events::{Notification, NotificationBus},
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{builder::AccessRuntimeBuilder, chain::ChainAccess};

/// Owns every configured chain and their background tasks.
///
/// A self-healing monitor runs per chain and WebSocket feeds are connected in the
/// background. `shutdown()` signals all tasks over a broadcast channel, disconnects every
/// chain and can be called any number of times.
pub struct AccessRuntime {
    chains: Vec<Arc<ChainAccess>>,
    shutdown_tx: broadcast::Sender<()>,
    notifications: NotificationBus,
    config: AppConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl AccessRuntime {
    /// Creates a new builder for constructing an `AccessRuntime`.
    #[must_use]
    pub fn builder() -> AccessRuntimeBuilder {
        AccessRuntimeBuilder::new()
    }

    pub(super) fn new(
        chains: Vec<Arc<ChainAccess>>,
        shutdown_tx: broadcast::Sender<()>,
        notifications: NotificationBus,
        config: AppConfig,
        enable_self_healing: bool,
    ) -> Self {
        let mut tasks = Vec::new();

        for chain in &chains {
            if enable_self_healing {
                tasks.push(chain.monitor().start_with_shutdown(shutdown_tx.subscribe()));
                debug!(chain = %chain.name(), "self-healing monitor started");
            }

            if chain.websocket().is_some() {
                let chain = chain.clone();
                tasks.push(tokio::spawn(async move {
                    let connected = chain.connect().await;
                    if connected == 0 {
                        warn!(chain = %chain.name(), "no websocket endpoint connected at startup");
                    } else {
                        info!(chain = %chain.name(), connected, "websocket feed started");
                    }
                }));
            }
        }

        Self {
            chains,
            shutdown_tx,
            notifications,
            config,
            tasks: Mutex::new(tasks),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Looks up a chain by its configured name.
    #[must_use]
    pub fn chain(&self, name: &str) -> Option<&Arc<ChainAccess>> {
        self.chains.iter().find(|chain| chain.name().as_ref() == name)
    }

    #[must_use]
    pub fn chains(&self) -> &[Arc<ChainAccess>] {
        &self.chains
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Notifications from every chain.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Creates a new shutdown receiver for external shutdown coordination.
    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Stops background tasks and disconnects every chain.
    ///
    /// Idempotent: only the first call does any work.
    pub async fn shutdown(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("shutdown already initiated, ignoring duplicate call");
            return;
        }

        info!("initiating rpc access runtime shutdown");
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!(error = %e, "shutdown signal had no receivers");
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            if !task.is_finished() {
                task.abort();
            }
        }
        for task in tasks {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("background task cancelled"),
                Err(e) => error!(error = %e, "background task failed"),
            }
        }

        join_all(self.chains.iter().map(|chain| chain.disconnect())).await;
        info!("rpc access runtime shutdown complete");
    }

    /// Waits for a shutdown signal from [`Self::shutdown_receiver`] holders, then cleans up.
    pub async fn wait_for_shutdown(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("shutdown signal received, runtime terminating");
        self.shutdown().await;
    }

    /// Broadcasts the shutdown signal without waiting for cleanup.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<AccessRuntime>;
    let _ = assert_sync::<AccessRuntime>;
};
