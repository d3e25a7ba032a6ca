pub mod account;
pub mod serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "compass_connect")]
#[command(about = "Wallet dapp-connection bridge", long_about = None)]
pub struct Cli {
    /// Path to the TOML config; written with defaults when missing
    #[arg(long, global = true, default_value = "compass_connect.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the dapp and popup channels over WebSocket
    Serve,
    /// Account management
    Account {
        #[command(subcommand)]
        cmd: account::AccountCommands,
    },
}
