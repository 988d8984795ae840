//! WebSocket block subscriptions.
//!
//! A [`WsConnection`] owns one `newHeads` subscription and keeps it alive on its own:
//! heartbeats detect silent sockets, a backoff loop reconnects and a circuit breaker stops
//! dialing an endpoint that keeps failing. A [`WsResilienceManager`] runs several of them
//! for one chain and forwards blocks from whichever one is active.

pub mod backoff;
pub mod connection;
pub mod manager;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionState, WsConnection, WsConnectionStats};
pub use manager::{BlockListener, ListenerId, WsResilienceManager};
