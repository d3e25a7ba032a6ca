//! Dapp session and transaction authorization
//!
//! Third-party origins connect through [`TonConnect`] (or the older in-page
//! [`LegacyProvider`]); every sensitive step is presented to the wallet window
//! through a [`UiSink`] and resumes when the window settles the matching promise.

pub mod connect;
pub mod dapps;
pub mod errors;
pub mod history;
pub mod ledger;
pub mod legacy;
pub mod manifest;
pub mod proof;
pub mod types;
pub mod ui;

pub use connect::TonConnect;
pub use dapps::{DappRecord, DappStore};
pub use errors::{DisplayError, ErrorPayload, SessionError};
pub use history::{LocalHistory, LocalTransaction};
pub use ledger::{Ledger, LedgerError, ParsedPayload, RawAddress, SignedTransfer, TransactionDraft, TransferMessage};
pub use legacy::LegacyProvider;
pub use manifest::{HttpManifestFetcher, ManifestError, ManifestFetcher};
pub use types::{DappApproval, DappRequest};
pub use ui::{PopupBridge, SiteUpdate, SiteUpdaters, UiSink, UiUpdate};

use chrono::Utc;
use std::sync::Arc;

use crate::account::AccountStore;
use crate::crypto::KeyVault;
use crate::promise::PromiseRegistry;
use crate::storage::Storage;

/// Collaborators shared by every flow of the privileged context.
pub struct WalletContext {
    pub storage: Arc<dyn Storage>,
    pub accounts: Arc<AccountStore>,
    pub dapps: DappStore,
    pub promises: PromiseRegistry<DappApproval>,
    pub keys: KeyVault,
    pub history: LocalHistory,
    pub ledger: Arc<dyn Ledger>,
    pub manifests: Arc<dyn ManifestFetcher>,
    pub ui: Arc<dyn UiSink>,
    pub sites: Arc<SiteUpdaters>,
}

impl WalletContext {
    pub fn new(
        storage: Arc<dyn Storage>,
        ledger: Arc<dyn Ledger>,
        manifests: Arc<dyn ManifestFetcher>,
        ui: Arc<dyn UiSink>,
    ) -> Arc<Self> {
        let accounts = Arc::new(AccountStore::new(storage.clone()));
        let sites = Arc::new(SiteUpdaters::new());
        Arc::new(Self {
            dapps: DappStore::new(accounts.clone(), ui.clone(), sites.clone()),
            history: LocalHistory::new(accounts.clone(), ui.clone()),
            keys: KeyVault::new(storage.clone()),
            promises: PromiseRegistry::new(),
            storage,
            accounts,
            ledger,
            manifests,
            ui,
            sites,
        })
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
