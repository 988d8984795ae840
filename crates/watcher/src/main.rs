use anyhow::Result;
use rpc_access_core::{
    config::AppConfig,
    events::Notification,
    runtime::{AccessRuntime, ChainAccess},
};
use rustls::crypto::{ring::default_provider, CryptoProvider};
use std::{sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often per-chain statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

fn init_logging(config: &AppConfig) {
    let default_level = config.logging.level.as_str();
    let filter = match std::env::var("RUST_LOG") {
        Ok(level) if level == "debug" || level == "trace" => {
            EnvFilter::new(format!("warn,rpc_access_core={level},watcher={level}"))
        }
        Ok(_) => EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| {
            EnvFilter::new(format!("warn,rpc_access_core={default_level},watcher={default_level}"))
        }),
        Err(_) => {
            EnvFilter::new(format!("warn,rpc_access_core={default_level},watcher={default_level}"))
        }
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::EndpointUnhealthy { endpoint, consecutive_failures, reason } => {
            warn!(endpoint = %endpoint, consecutive_failures, reason = %reason, "endpoint unhealthy");
        }
        Notification::EndpointRecovered { endpoint, downtime } => {
            info!(endpoint = %endpoint, downtime_secs = downtime.as_secs(), "endpoint recovered");
        }
        Notification::WebsocketFailover { chain, from, to } => {
            warn!(chain = %chain, from = ?from, to = %to, "websocket failover");
        }
        Notification::WebsocketAllDown { chain, endpoints } => {
            error!(chain = %chain, endpoints = ?endpoints, "all websocket endpoints down");
        }
        Notification::CircuitOpen { endpoint, cooldown, retry_at } => {
            warn!(
                endpoint = %endpoint,
                cooldown_secs = cooldown.as_secs(),
                retry_at = %retry_at,
                "websocket circuit open"
            );
        }
        Notification::NewBlock(block) => {
            debug!(chain = %block.chain, number = block.number, source = %block.source, "new block");
        }
    }
}

fn spawn_notification_logger(runtime: &AccessRuntime) -> JoinHandle<()> {
    let mut notifications = runtime.subscribe();
    let mut shutdown_rx = runtime.shutdown_receiver();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(notification) => log_notification(&notification),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification logger lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

fn spawn_stats_logger(
    chains: Vec<Arc<ChainAccess>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for chain in &chains {
                        let stats = chain.stats();
                        match serde_json::to_string(&stats) {
                            Ok(json) => info!(chain = %chain.name(), stats = %json, "chain stats"),
                            Err(e) => warn!(chain = %chain.name(), error = %e, "failed to encode stats"),
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("Failed to install crypto provider: {e:?}"))?;

    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;

    init_logging(&config);
    info!("Starting RPC watcher");
    debug!(
        chains = config.chains.len(),
        heal_interval_secs = config.heal_interval().as_secs(),
        "Configuration loaded"
    );

    let runtime = AccessRuntime::builder()
        .with_config(config)
        .build()
        .map_err(|e| anyhow::anyhow!("Runtime initialization failed: {e}"))?;

    let notification_task = spawn_notification_logger(&runtime);
    let stats_task = spawn_stats_logger(runtime.chains().to_vec(), runtime.shutdown_receiver());

    for chain in runtime.chains() {
        let name = chain.name().clone();
        if chain
            .on_block(move |block| info!(chain = %name, number = block.number, hash = %block.hash, "block"))
            .is_none()
        {
            info!(chain = %chain.name(), "no websocket endpoints, block feed disabled");
        }
    }

    shutdown_signal().await;

    runtime.shutdown().await;
    for task in [notification_task, stats_task] {
        if let Err(e) = task.await {
            error!(error = %e, "logger task terminated abnormally");
        }
    }
    info!("Watcher shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
