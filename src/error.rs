use thiserror::Error;

use crate::account::AccountError;
use crate::crypto::KeyError;
use crate::storage::StorageError;

/// Failures while wiring up or running the bridge process.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Account error: {0}")]
    Account(#[from] AccountError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::session::LedgerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
