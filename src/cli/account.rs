use clap::Subcommand;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::account::{AccountStore, Network};
use crate::api::PopupApi;
use crate::client::RpcLedger;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::session::{HttpManifestFetcher, PopupBridge, WalletContext};
use crate::storage::{SledStorage, Storage};

#[derive(Subcommand)]
pub enum AccountCommands {
    /// List stored accounts
    List,
    /// Import an account from a mnemonic read from stdin
    Import {
        #[arg(long, default_value = "mainnet")]
        network: Network,
    },
    /// Print the id the next account would get
    NextId {
        #[arg(long, default_value = "mainnet")]
        network: Network,
    },
}

fn open_storage(config: &BridgeConfig) -> Result<Arc<dyn Storage>, BridgeError> {
    Ok(Arc::new(SledStorage::open(&config.storage.db_path)?))
}

fn prompt_line(label: &str) -> Result<String, BridgeError> {
    print!("{}: ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();
    if line.is_empty() {
        return Err(BridgeError::InvalidInput(format!("{} is required", label)));
    }
    Ok(line)
}

pub async fn handle_account_command(cmd: AccountCommands, config: &BridgeConfig) -> Result<(), BridgeError> {
    let storage = open_storage(config)?;

    match cmd {
        AccountCommands::List => {
            let accounts = AccountStore::new(storage);
            let current = accounts.current_account_id()?;
            let main = accounts.main_account_id()?;
            let ids = accounts.account_ids()?;
            if ids.is_empty() {
                println!("No accounts.");
            }
            for id in ids {
                let record = accounts.fetch_stored_account(&id)?;
                let mut marks = Vec::new();
                if Some(id) == current {
                    marks.push("current");
                }
                if Some(id) == main {
                    marks.push("main");
                }
                if record.is_hardware() {
                    marks.push("hardware");
                }
                println!("{}\t{}\t{}", id, record.address, marks.join(","));
            }
        }
        AccountCommands::Import { network } => {
            let mnemonic = prompt_line("Mnemonic")?;
            let password = prompt_line("Password")?;

            let ledger = Arc::new(RpcLedger::new(
                config.ledger.rpc_url.clone(),
                Duration::from_secs(config.ledger.timeout_secs),
                storage.clone(),
            )?);
            let manifests = Arc::new(
                HttpManifestFetcher::new(Duration::from_secs(config.manifest.timeout_secs))
                    .map_err(|e| BridgeError::Config(e.to_string()))?,
            );
            let bridge = Arc::new(PopupBridge::new());
            let ctx = WalletContext::new(storage, ledger, manifests, bridge.clone());

            let account_id = PopupApi::new(ctx, bridge)
                .import_mnemonic(&mnemonic, &password, network)
                .await
                .map_err(|e| BridgeError::InvalidInput(e.to_string()))?;
            println!("Imported {}", account_id);
        }
        AccountCommands::NextId { network } => {
            println!("{}", AccountStore::new(storage).next_account_id(network)?);
        }
    }
    Ok(())
}
