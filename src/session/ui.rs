//! Privileged UI and site-facing update sinks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::dapps::DappRecord;
use super::errors::DisplayError;
use super::history::LocalTransaction;
use super::ledger::ParsedPayload;
use super::types::{Permissions, ProofChallenge};
use crate::account::AccountId;
use crate::transport::UpdateSink;

/// One message of a batch, resolved for display.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedTransaction {
    pub resolved_address: String,
    pub to_address: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ParsedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UiUpdate {
    DappConnect {
        promise_id: String,
        account_id: AccountId,
        dapp: DappRecord,
        permissions: Permissions,
        proof: Option<ProofChallenge>,
    },
    DappSendTransactions {
        promise_id: String,
        account_id: AccountId,
        dapp: Option<DappRecord>,
        transactions: Vec<PreparedTransaction>,
        fee: String,
    },
    CreateTransaction {
        promise_id: String,
        to_address: String,
        amount: String,
        fee: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        state_init: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_payload: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parsed_payload: Option<ParsedPayload>,
    },
    CreateSignature {
        promise_id: String,
        data_hex: String,
    },
    ShowError {
        error: DisplayError,
    },
    UpdateActiveDapp {
        account_id: AccountId,
        origin: Option<String>,
    },
    DappDisconnect {
        account_id: AccountId,
        origin: String,
    },
    NewLocalTransaction {
        account_id: AccountId,
        transaction: LocalTransaction,
    },
}

/// Where approval prompts and notices go. Prompts are fire-and-forget; the
/// outcome comes back through the promise registry.
#[async_trait]
pub trait UiSink: Send + Sync {
    fn dispatch(&self, update: UiUpdate);

    fn is_alive(&self) -> bool;

    /// Make sure a wallet window is attached. Returns true if the caller had to wait for one.
    async fn ensure_window(&self) -> bool;
}

/// `UiSink` backed by whichever wallet window attached over the `popup` channel.
pub struct PopupBridge {
    sink: Mutex<Option<UpdateSink>>,
    attached: watch::Sender<bool>,
}

impl Default for PopupBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PopupBridge {
    pub fn new() -> Self {
        let (attached, _) = watch::channel(false);
        Self {
            sink: Mutex::new(None),
            attached,
        }
    }

    pub fn attach(&self, sink: UpdateSink) {
        info!(peer = %sink.peer_id(), "Wallet window attached");
        if let Ok(mut current) = self.sink.lock() {
            *current = Some(sink);
        }
        self.attached.send_replace(true);
    }

    /// Forget the window if it is the one that went away.
    pub fn detach(&self, peer_id: &str) {
        let Ok(mut current) = self.sink.lock() else { return };
        if current.as_ref().map(|sink| sink.peer_id() == peer_id).unwrap_or(false) {
            *current = None;
            self.attached.send_replace(false);
            info!(peer = %peer_id, "Wallet window detached");
        }
    }

    fn current(&self) -> Option<UpdateSink> {
        self.sink.lock().ok().and_then(|sink| sink.clone())
    }
}

#[async_trait]
impl UiSink for PopupBridge {
    fn dispatch(&self, update: UiUpdate) {
        match self.current() {
            Some(sink) if sink.is_alive() => {
                sink.send(&update);
            }
            _ => warn!(update = ?update, "No wallet window attached; dropping UI update"),
        }
    }

    fn is_alive(&self) -> bool {
        self.current().map(|sink| sink.is_alive()).unwrap_or(false)
    }

    async fn ensure_window(&self) -> bool {
        if self.is_alive() {
            return false;
        }
        info!("Waiting for a wallet window to attach");
        let mut attached = self.attached.subscribe();
        while !*attached.borrow_and_update() {
            if attached.changed().await.is_err() {
                break;
            }
        }
        true
    }
}

/// Updates pushed to connected sites.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SiteUpdate {
    UpdateAccounts { accounts: Vec<String> },
    DisconnectSite { origin: String },
}

/// Per-peer update subscribers of the `dapp` channel.
#[derive(Default)]
pub struct SiteUpdaters {
    sinks: Mutex<HashMap<String, (Option<String>, UpdateSink)>>,
}

impl SiteUpdaters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, origin: Option<String>, sink: UpdateSink) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.insert(sink.peer_id().to_string(), (origin, sink));
        }
    }

    pub fn remove(&self, peer_id: &str) {
        if let Ok(mut sinks) = self.sinks.lock() {
            if sinks.remove(peer_id).is_some() {
                debug!(peer = %peer_id, "Site updater removed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().map(|sinks| sinks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send to every live subscriber, or only those of `origin` when given.
    pub fn broadcast(&self, update: &SiteUpdate, origin: Option<&str>) {
        let Ok(sinks) = self.sinks.lock() else { return };
        for (sink_origin, sink) in sinks.values() {
            if origin.is_some() && sink_origin.as_deref() != origin {
                continue;
            }
            if sink.is_alive() {
                sink.send(update);
            }
        }
    }
}
