//! Runtime initialization and lifecycle management.
//!
//! [`AccessRuntime`] builds one [`ChainAccess`] per configured chain, starts the
//! self-healing monitors and WebSocket feeds, and coordinates graceful shutdown.
//!
//! # Examples
//!
//! ```no_run
//! use rpc_access_core::{config::AppConfig, runtime::AccessRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load()?;
//!     let runtime = AccessRuntime::builder().with_config(config).build()?;
//!
//!     let chain = runtime.chain("ethereum").ok_or("unknown chain")?;
//!     chain.on_block(|block| println!("block {}", block.number));
//!
//!     let block = chain
//!         .with_retry(None, |endpoint| async move {
//!             endpoint.request("eth_blockNumber", serde_json::json!([])).await
//!         })
//!         .await?;
//!     println!("head: {block}");
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod chain;
pub mod lifecycle;

pub use builder::{AccessRuntimeBuilder, RuntimeError};
pub use chain::{ChainAccess, ChainStats};
pub use lifecycle::AccessRuntime;
