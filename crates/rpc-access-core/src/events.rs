//! Notifications emitted by the access layer.
//!
//! Every observable side effect other components may react to is one [`Notification`]
//! variant, fanned out over a `tokio::sync::broadcast` channel. Slow receivers lose the
//! oldest entries (`RecvError::Lagged`) and never block producers.

use crate::types::BlockEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 256;

/// Observable event produced by the pool, the monitor or the WebSocket layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    EndpointUnhealthy {
        endpoint: Arc<str>,
        consecutive_failures: u32,
        reason: String,
    },
    EndpointRecovered {
        endpoint: Arc<str>,
        /// Time spent out of rotation.
        #[serde(with = "duration_secs")]
        downtime: Duration,
    },
    WebsocketFailover {
        chain: Arc<str>,
        from: Option<Arc<str>>,
        to: Arc<str>,
    },
    WebsocketAllDown {
        chain: Arc<str>,
        endpoints: Vec<Arc<str>>,
    },
    CircuitOpen {
        endpoint: Arc<str>,
        #[serde(with = "duration_secs")]
        cooldown: Duration,
        retry_at: DateTime<Utc>,
    },
    NewBlock(BlockEvent),
}

impl Notification {
    /// Returns a static string representation for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndpointUnhealthy { .. } => "endpoint_unhealthy",
            Self::EndpointRecovered { .. } => "endpoint_recovered",
            Self::WebsocketFailover { .. } => "websocket_failover",
            Self::WebsocketAllDown { .. } => "websocket_all_down",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NewBlock(_) => "new_block",
        }
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Cloneable handle to the notification channel.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new receiver. It sees notifications emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publishes a notification. Having no receivers is not an error.
    pub fn emit(&self, notification: Notification) {
        let kind = notification.as_str();
        match self.tx.send(notification) {
            Ok(receivers) => trace!(kind, receivers, "notification emitted"),
            Err(_) => trace!(kind, "notification dropped, no receivers"),
        }
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
