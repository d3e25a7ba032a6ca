use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use compass_connect::cli::{self, Cli, Commands};
use compass_connect::config::BridgeConfig;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let config = BridgeConfig::load_or_default(&args.config);

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match args.command {
        Commands::Serve => cli::serve::run(config).await,
        Commands::Account { cmd } => cli::account::handle_account_command(cmd, &config).await,
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}
