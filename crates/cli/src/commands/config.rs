use clap::Subcommand;
use rpc_access_core::config::AppConfig;
use std::path::Path;

use super::utils::{print_error, print_info, print_success, CliError, CliResult};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate the current configuration
    Validate {
        /// Path to config file (defaults to config/config.toml)
        #[arg(short, long, default_value = "config/config.toml")]
        file: String,
    },

    /// Show the effective configuration, environment overrides included
    Show {
        #[arg(short, long, default_value = "config/config.toml")]
        file: String,

        /// Show endpoint URLs in full (they often embed API keys)
        #[arg(long)]
        show_sensitive: bool,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output path for the config file
        #[arg(short, long, default_value = "config/config.toml")]
        output: String,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn handle_config_command(command: ConfigCommands) -> CliResult<()> {
    match command {
        ConfigCommands::Validate { file } => validate_config(&file),
        ConfigCommands::Show { file, show_sensitive } => show_config(&file, show_sensitive),
        ConfigCommands::Generate { output, force } => generate_config(&output, force),
    }
}

pub(crate) fn load_config(file: &str) -> CliResult<AppConfig> {
    if !Path::new(file).exists() {
        print_error(&format!("Configuration file not found: {file}"));
        return Err(CliError::Config(format!("File not found: {file}")));
    }
    Ok(AppConfig::from_file(file)?)
}

fn validate_config(file: &str) -> CliResult<()> {
    print_info(&format!("Loading configuration from {file}..."));
    let config = load_config(file)?;

    print_info("Validating configuration...");
    config.validate().map_err(CliError::Config)?;

    print_success("Configuration is valid!");

    println!("Configuration Summary:");
    for chain in &config.chains {
        let quota_limited = chain.http.iter().filter(|e| e.class.is_quota_limited()).count();
        println!(
            "  {} (chain {}): {} HTTP ({} quota-limited), {} WebSocket",
            chain.name,
            chain.chain_id,
            chain.http.len(),
            quota_limited,
            chain.ws.len()
        );
    }
    println!(
        "  Budget: {}/endpoint, {}/chain per {}s",
        config.rate_limit.requests_per_minute,
        config.rate_limit.global_requests_per_minute,
        config.rate_limit.window_seconds
    );

    Ok(())
}

/// Keeps scheme and host, hiding paths and query strings where providers put keys.
fn redact(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            let host_end = rest.find(['/', '?']).unwrap_or(rest.len());
            if host_end == rest.len() {
                url.to_string()
            } else {
                format!("{}{}/***", &url[..scheme_end + 3], &rest[..host_end])
            }
        }
        None => "***".to_string(),
    }
}

fn show_config(file: &str, show_sensitive: bool) -> CliResult<()> {
    let config = load_config(file)?;
    let display = |url: &str| if show_sensitive { url.to_string() } else { redact(url) };

    println!("Configuration from {file}:");

    for chain in &config.chains {
        println!("\n[Chain {}] (id {})", chain.name, chain.chain_id);
        for endpoint in chain.http_endpoints() {
            println!(
                "  http {}: {} ({:?}, timeout {}s)",
                endpoint.name,
                display(&endpoint.url),
                endpoint.class,
                endpoint.timeout_seconds
            );
        }
        for endpoint in chain.ws_endpoints() {
            println!("  ws   {}: {}", endpoint.name, display(&endpoint.url));
        }
    }

    println!("\n[Rate limit]");
    println!("  Per endpoint: {}", config.rate_limit.requests_per_minute);
    println!("  Per chain: {}", config.rate_limit.global_requests_per_minute);
    println!("  Window: {}s", config.rate_limit.window_seconds);
    println!("  Min spacing: {}ms", config.rate_limit.min_request_spacing_ms);

    println!("\n[Retry]");
    println!("  Max attempts: {}", config.retry.max_attempts);
    println!("  Base delay: {}ms", config.retry.base_delay_ms);
    println!("  Failure threshold: {}", config.retry.failure_threshold);

    println!("\n[Health]");
    println!("  Interval: {}s", config.health.interval_seconds);
    println!("  Min recovery: {}s", config.health.min_recovery_seconds);
    println!("  Probe timeout: {}ms", config.health.probe_timeout_ms);

    println!("\n[WebSocket]");
    println!("  Heartbeat: {}ms", config.websocket.heartbeat_interval_ms);
    println!("  Max reconnect attempts: {}", config.websocket.max_reconnect_attempts);
    println!("  Max connections: {}", config.websocket.max_connections);

    println!("\n[Logging]");
    println!("  Level: {}", config.logging.level);
    println!("  Format: {}", config.logging.format);

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# RPC access layer configuration

[[chains]]
name = "ethereum"
chain_id = 1
ws = ["wss://eth-mainnet.g.alchemy.com/v2/YOUR_API_KEY"]

[[chains.http]]
name = "alchemy"
url = "https://eth-mainnet.g.alchemy.com/v2/YOUR_API_KEY"
class = "quota_limited"

[[chains.http]]
name = "publicnode"
url = "https://ethereum-rpc.publicnode.com"
class = "free"
requests_per_minute = 120

[rate_limit]
requests_per_minute = 300
global_requests_per_minute = 1500
window_seconds = 60
min_request_spacing_ms = 50

[retry]
max_attempts = 3
base_delay_ms = 1000
failure_threshold = 3

[health]
interval_seconds = 300
min_recovery_seconds = 60
probe_timeout_ms = 5000

[websocket]
heartbeat_interval_ms = 30000
heartbeat_timeout_ms = 10000
max_missed_heartbeats = 2
max_reconnect_attempts = 10
max_connections = 3

[gas_cache]
ttl_ms = 3000
stale_ttl_ms = 60000

[logging]
level = "info"
format = "pretty"
"#;

fn generate_config(output: &str, force: bool) -> CliResult<()> {
    if Path::new(output).exists() && !force {
        return Err(CliError::Config(format!(
            "File {output} already exists. Use --force to overwrite."
        )));
    }

    if let Some(parent) = Path::new(output).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(output, SAMPLE_CONFIG)?;

    print_success(&format!("Sample configuration generated: {output}"));
    print_info("Remember to:");
    print_info("  1. Replace YOUR_API_KEY placeholders with real API keys");
    print_info("  2. Mark keyed providers as quota_limited so free ones are preferred");

    Ok(())
}
