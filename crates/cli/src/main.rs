use clap::{Parser, Subcommand};
use rustls::crypto::{ring::default_provider, CryptoProvider};

mod commands;
use commands::{gas_price, handle_config_command, test_endpoints, ConfigCommands};

#[derive(Parser)]
#[command(name = "rpc-access-cli")]
#[command(about = "Operator tool for multi-provider RPC access configurations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration Management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Call every configured HTTP endpoint once and report the result
    TestEndpoints {
        #[arg(short, long, default_value = "config/config.toml")]
        file: String,

        /// Timeout in seconds for each endpoint
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Print current fee data for a chain
    Gas {
        #[arg(short, long, default_value = "config/config.toml")]
        file: String,

        /// Chain name as configured
        #[arg(short, long)]
        chain: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| format!("Failed to install crypto provider: {e:?}"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Config(config_command) => handle_config_command(config_command)?,
        Commands::TestEndpoints { file, timeout } => test_endpoints(&file, timeout).await?,
        Commands::Gas { file, chain } => gas_price(&file, &chain).await?,
    }

    Ok(())
}
