//! Connected dapps per account and the active-dapp marker

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::types::DappMetadata;
use super::ui::{SiteUpdate, SiteUpdaters, UiSink, UiUpdate};
use crate::account::{AccountError, AccountId, AccountStore, Network};

pub const DAPPS: &str = "dapps";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DappRecord {
    pub origin: String,
    pub url: String,
    pub name: String,
    pub icon_url: String,
    pub manifest_url: String,
    /// Unix millis of the last connect or reconnect
    pub connected_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sse: Option<Value>,
}

impl DappRecord {
    pub fn new(metadata: DappMetadata, connected_at: i64, sse: Option<Value>) -> Self {
        Self {
            origin: metadata.origin,
            url: metadata.url,
            name: metadata.name,
            icon_url: metadata.icon_url,
            manifest_url: metadata.manifest_url,
            connected_at,
            sse,
        }
    }
}

type DappsByOrigin = HashMap<String, DappRecord>;

pub struct DappStore {
    accounts: Arc<AccountStore>,
    ui: Arc<dyn UiSink>,
    sites: Arc<SiteUpdaters>,
    active: Mutex<HashMap<AccountId, String>>,
}

impl DappStore {
    pub fn new(accounts: Arc<AccountStore>, ui: Arc<dyn UiSink>, sites: Arc<SiteUpdaters>) -> Self {
        Self {
            accounts,
            ui,
            sites,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn dapps_by_origin(&self, account_id: &AccountId) -> Result<DappsByOrigin, AccountError> {
        Ok(self.accounts.get_account_value(account_id, DAPPS)?.unwrap_or_default())
    }

    /// Most recently connected first.
    pub fn dapps(&self, account_id: &AccountId) -> Result<Vec<DappRecord>, AccountError> {
        let mut dapps: Vec<DappRecord> = self.dapps_by_origin(account_id)?.into_values().collect();
        dapps.sort_by(|a, b| b.connected_at.cmp(&a.connected_at));
        Ok(dapps)
    }

    pub fn get(&self, account_id: &AccountId, origin: &str) -> Result<Option<DappRecord>, AccountError> {
        Ok(self.dapps_by_origin(account_id)?.remove(origin))
    }

    pub fn is_connected(&self, account_id: &AccountId, origin: &str) -> Result<bool, AccountError> {
        Ok(self.dapps_by_origin(account_id)?.contains_key(origin))
    }

    pub fn add(&self, account_id: &AccountId, dapp: DappRecord) -> Result<(), AccountError> {
        debug!(account_id = %account_id, origin = %dapp.origin, "Dapp connected");
        self.accounts
            .update_account_value(account_id, DAPPS, |dapps: &mut Option<DappsByOrigin>| {
                dapps.get_or_insert_with(HashMap::new).insert(dapp.origin.clone(), dapp);
            })
    }

    /// Apply `update` to an existing record. Returns false if there was none.
    pub fn update<F>(&self, account_id: &AccountId, origin: &str, update: F) -> Result<bool, AccountError>
    where
        F: FnOnce(&mut DappRecord),
    {
        self.accounts
            .update_account_value(account_id, DAPPS, |dapps: &mut Option<DappsByOrigin>| {
                match dapps.as_mut().and_then(|dapps| dapps.get_mut(origin)) {
                    Some(dapp) => {
                        update(dapp);
                        true
                    }
                    None => false,
                }
            })
    }

    /// Remove a connection. The site itself is told unless it asked for the disconnect.
    pub fn delete(&self, account_id: &AccountId, origin: &str, dont_notify_site: bool) -> Result<bool, AccountError> {
        let removed = self
            .accounts
            .update_account_value(account_id, DAPPS, |dapps: &mut Option<DappsByOrigin>| {
                dapps.as_mut().and_then(|dapps| dapps.remove(origin)).is_some()
            })?;
        if !removed {
            return Ok(false);
        }

        if self.active_dapp(account_id).as_deref() == Some(origin) {
            self.deactivate_account(account_id);
        }

        self.ui.dispatch(UiUpdate::DappDisconnect {
            account_id: *account_id,
            origin: origin.to_string(),
        });
        if !dont_notify_site {
            self.sites.broadcast(
                &SiteUpdate::DisconnectSite {
                    origin: origin.to_string(),
                },
                Some(origin),
            );
        }
        debug!(account_id = %account_id, origin = %origin, "Dapp disconnected");
        Ok(true)
    }

    pub fn delete_all_for_network(&self, network: Network) -> Result<(), AccountError> {
        self.accounts.remove_network_accounts_value(network, DAPPS)
    }

    pub fn active_dapp(&self, account_id: &AccountId) -> Option<String> {
        self.active.lock().ok().and_then(|active| active.get(account_id).cloned())
    }

    pub fn activate(&self, account_id: &AccountId, origin: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(*account_id, origin.to_string());
        }
        self.ui.dispatch(UiUpdate::UpdateActiveDapp {
            account_id: *account_id,
            origin: Some(origin.to_string()),
        });
    }

    pub fn deactivate_account(&self, account_id: &AccountId) {
        let removed = self.active.lock().ok().and_then(|mut active| active.remove(account_id));
        if removed.is_some() {
            self.ui.dispatch(UiUpdate::UpdateActiveDapp {
                account_id: *account_id,
                origin: None,
            });
        }
    }

    /// Clear the active marker wherever it points at `origin`.
    pub fn deactivate_origin(&self, origin: &str) {
        let accounts: Vec<AccountId> = match self.active.lock() {
            Ok(active) => active
                .iter()
                .filter(|(_, active_origin)| active_origin.as_str() == origin)
                .map(|(account_id, _)| *account_id)
                .collect(),
            Err(_) => return,
        };
        for account_id in accounts {
            self.deactivate_account(&account_id);
        }
    }

    /// Account on `network` that connected to `origin` most recently.
    pub fn find_last_connected_account(&self, network: Network, origin: &str) -> Result<Option<AccountId>, AccountError> {
        let mut last: Option<(AccountId, i64)> = None;
        for account_id in self.accounts.account_ids()? {
            if account_id.network != network {
                continue;
            }
            let Some(dapp) = self.get(&account_id, origin)? else {
                continue;
            };
            if last.map(|(_, at)| dapp.connected_at > at).unwrap_or(true) {
                last = Some((account_id, dapp.connected_at));
            }
        }
        Ok(last.map(|(account_id, _)| account_id))
    }
}
