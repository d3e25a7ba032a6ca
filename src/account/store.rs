//! Account storage and the current-account pointer

use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::id::{AccountId, Chain, Network};
use super::types::AccountRecord;
use crate::storage::{Storage, StorageError};

pub const ADDRESSES: &str = "addresses";
pub const PUBLIC_KEYS: &str = "publicKeys";
pub const ACCOUNTS: &str = "accounts";
pub const CURRENT_ACCOUNT_ID: &str = "currentAccountId";

const MIN_ACCOUNT_INDEX: u32 = 0;

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Invalid account id: {0}")]
    InvalidId(String),
    #[error("The user is not authorized in the wallet")]
    NotAuthorized,
    #[error("Account not found: {0}")]
    NotFound(String),
    #[error("Account index space exhausted")]
    IndexExhausted,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Reads and writes per-account values kept as `{ accountId: value }` maps.
pub struct AccountStore {
    storage: Arc<dyn Storage>,
    // Serializes read-modify-write cycles on the current pointer and on id allocation
    write_lock: Mutex<()>,
    // Held across every read-modify-write of a `{ accountId: value }` map
    values_lock: SyncMutex<()>,
}

impl AccountStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
            values_lock: SyncMutex::new(()),
        }
    }

    fn lock_values(&self) -> MutexGuard<'_, ()> {
        self.values_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the whole map under `key`, let `change` edit it and write it back, all under one lock.
    fn modify_map<R, F>(&self, key: &str, change: F) -> Result<R, AccountError>
    where
        F: FnOnce(&mut HashMap<String, serde_json::Value>) -> Result<R, AccountError>,
    {
        let _guard = self.lock_values();
        let mut data: HashMap<String, serde_json::Value> = self.storage.get(key)?.unwrap_or_default();
        let result = change(&mut data)?;
        self.storage.set(key, &data)?;
        Ok(result)
    }

    /// All account ids known to the wallet
    pub fn account_ids(&self) -> Result<Vec<AccountId>, AccountError> {
        let addresses: HashMap<String, String> = self.storage.get(ADDRESSES)?.unwrap_or_default();
        let mut ids: Vec<AccountId> = addresses
            .keys()
            .filter_map(|key| match key.parse::<AccountId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unparseable account id");
                    None
                }
            })
            .collect();
        ids.sort_by_key(|id| id.index);
        Ok(ids)
    }

    /// `max(existing) + 1`, or 0 on an empty wallet. Gaps are never reused.
    pub fn next_index(&self) -> Result<u32, AccountError> {
        let ids = self.account_ids()?;
        match ids.iter().map(|id| id.index).max() {
            Some(max) => max.checked_add(1).ok_or(AccountError::IndexExhausted),
            None => Ok(MIN_ACCOUNT_INDEX),
        }
    }

    pub fn next_account_id(&self, network: Network) -> Result<AccountId, AccountError> {
        Ok(AccountId::new(self.next_index()?, network, Chain::Ton))
    }

    /// Lowest-index account that can sign without an external device.
    pub fn main_account_id(&self) -> Result<Option<AccountId>, AccountError> {
        let accounts: HashMap<String, AccountRecord> = self.storage.get(ACCOUNTS)?.unwrap_or_default();
        let main = self
            .account_ids()?
            .into_iter()
            .filter(|id| {
                accounts
                    .get(&id.to_string())
                    .map(|record| !record.is_hardware())
                    .unwrap_or(true)
            })
            .min_by_key(|id| id.index);
        Ok(main)
    }

    /// Persist a new account and return its freshly allocated id.
    pub async fn create_account(&self, network: Network, record: AccountRecord) -> Result<AccountId, AccountError> {
        let _guard = self.write_lock.lock().await;
        let account_id = self.next_account_id(network)?;

        self.set_account_value(&account_id, ADDRESSES, &record.address)?;
        self.set_account_value(&account_id, PUBLIC_KEYS, &record.public_key)?;
        self.set_account_value(&account_id, ACCOUNTS, &record)?;

        debug!(account_id = %account_id, hardware = record.is_hardware(), "Account created");
        Ok(account_id)
    }

    pub fn get_account_value<T: DeserializeOwned>(
        &self,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<T>, AccountError> {
        let mut data: HashMap<String, T> = self.storage.get(key)?.unwrap_or_default();
        Ok(data.remove(&account_id.to_string()))
    }

    pub fn set_account_value<T: Serialize>(
        &self,
        account_id: &AccountId,
        key: &str,
        value: &T,
    ) -> Result<(), AccountError> {
        let value = to_json(key, value)?;
        self.modify_map(key, |data| {
            data.insert(account_id.to_string(), value);
            Ok(())
        })
    }

    /// Atomically edit one account's entry. `change` sees `None` when there is no entry;
    /// leaving `None` behind removes it.
    pub fn update_account_value<T, R, F>(&self, account_id: &AccountId, key: &str, change: F) -> Result<R, AccountError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Option<T>) -> R,
    {
        let id = account_id.to_string();
        self.modify_map(key, |data| {
            let mut slot: Option<T> = data
                .remove(&id)
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| StorageError::Serialization {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
            let result = change(&mut slot);
            if let Some(value) = slot {
                data.insert(id, to_json(key, &value)?);
            }
            Ok(result)
        })
    }

    pub fn remove_account_value(&self, account_id: &AccountId, key: &str) -> Result<(), AccountError> {
        self.modify_map(key, |data| {
            data.remove(&account_id.to_string());
            Ok(())
        })
    }

    pub fn remove_network_accounts_value(&self, network: Network, key: &str) -> Result<(), AccountError> {
        self.modify_map(key, |data| {
            data.retain(|account_id, _| match account_id.parse::<AccountId>() {
                Ok(id) => id.network != network,
                Err(_) => true,
            });
            Ok(())
        })
    }

    pub fn fetch_stored_account(&self, account_id: &AccountId) -> Result<AccountRecord, AccountError> {
        self.get_account_value(account_id, ACCOUNTS)?
            .ok_or_else(|| AccountError::NotFound(account_id.to_string()))
    }

    pub fn fetch_stored_address(&self, account_id: &AccountId) -> Result<String, AccountError> {
        self.get_account_value(account_id, ADDRESSES)?
            .ok_or_else(|| AccountError::NotFound(account_id.to_string()))
    }

    pub fn fetch_stored_public_key(&self, account_id: &AccountId) -> Result<String, AccountError> {
        self.get_account_value(account_id, PUBLIC_KEYS)?
            .ok_or_else(|| AccountError::NotFound(account_id.to_string()))
    }

    pub fn is_hardware_account(&self, account_id: &AccountId) -> Result<bool, AccountError> {
        Ok(self
            .get_account_value::<AccountRecord>(account_id, ACCOUNTS)?
            .map(|record| record.is_hardware())
            .unwrap_or(false))
    }

    pub fn current_account_id(&self) -> Result<Option<AccountId>, AccountError> {
        let raw: Option<String> = self.storage.get(CURRENT_ACCOUNT_ID)?;
        raw.map(|s| s.parse()).transpose()
    }

    pub fn current_account_id_or_fail(&self) -> Result<AccountId, AccountError> {
        self.current_account_id()?.ok_or(AccountError::NotAuthorized)
    }

    pub fn current_network(&self) -> Result<Option<Network>, AccountError> {
        Ok(self.current_account_id()?.map(|id| id.network))
    }

    /// Switch the active account. Concurrent switches are serialized; the last writer wins.
    pub async fn set_current_account_id(&self, account_id: &AccountId) -> Result<Option<AccountId>, AccountError> {
        let _guard = self.write_lock.lock().await;
        if !self.account_ids()?.contains(account_id) {
            return Err(AccountError::NotFound(account_id.to_string()));
        }
        let previous = self.current_account_id()?;
        self.storage.set(CURRENT_ACCOUNT_ID, &account_id.to_string())?;
        debug!(account_id = %account_id, "Current account switched");
        Ok(previous)
    }

    pub async fn clear_current_account_id(&self) -> Result<(), AccountError> {
        let _guard = self.write_lock.lock().await;
        self.storage.remove(CURRENT_ACCOUNT_ID)?;
        Ok(())
    }
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<serde_json::Value, AccountError> {
    serde_json::to_value(value).map_err(|e| {
        StorageError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::types::HardwareInfo;
    use crate::storage::MemoryStorage;

    fn record(address: &str, hardware: bool) -> AccountRecord {
        AccountRecord {
            address: address.to_string(),
            public_key: format!("pk-{}", address),
            ledger: hardware.then(|| HardwareInfo {
                index: 0,
                driver: "hid".to_string(),
            }),
        }
    }

    fn store() -> AccountStore {
        AccountStore::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_next_index_empty_is_zero() {
        assert_eq!(store().next_index().unwrap(), 0);
    }

    #[test]
    fn test_next_index_ignores_gaps() {
        let store = store();
        for index in [0, 2] {
            let id = AccountId::new(index, Network::Mainnet, Chain::Ton);
            store.set_account_value(&id, ADDRESSES, &format!("addr{}", index)).unwrap();
        }
        assert_eq!(store.next_index().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_create_account_allocates_sequentially() {
        let store = store();
        let a = store.create_account(Network::Mainnet, record("A", false)).await.unwrap();
        let b = store.create_account(Network::Testnet, record("B", false)).await.unwrap();
        assert_eq!(a.index, 0);
        assert_eq!(b.index, 1);
        assert_eq!(b.network, Network::Testnet);
        assert_eq!(store.fetch_stored_address(&b).unwrap(), "B");
        assert_eq!(store.fetch_stored_public_key(&a).unwrap(), "pk-A");
    }

    #[tokio::test]
    async fn test_current_account_unset_is_not_authorized() {
        let store = store();
        assert!(store.current_account_id().unwrap().is_none());
        assert!(matches!(
            store.current_account_id_or_fail(),
            Err(AccountError::NotAuthorized)
        ));

        let id = store.create_account(Network::Mainnet, record("A", false)).await.unwrap();
        store.set_current_account_id(&id).await.unwrap();
        assert_eq!(store.current_account_id_or_fail().unwrap(), id);
        assert_eq!(store.current_network().unwrap(), Some(Network::Mainnet));
    }

    #[tokio::test]
    async fn test_switch_to_unknown_account_fails() {
        let store = store();
        let ghost = AccountId::new(9, Network::Mainnet, Chain::Ton);
        assert!(matches!(
            store.set_current_account_id(&ghost).await,
            Err(AccountError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_main_account_skips_hardware() {
        let store = store();
        assert!(store.main_account_id().unwrap().is_none());

        store.create_account(Network::Mainnet, record("HW", true)).await.unwrap();
        assert!(store.main_account_id().unwrap().is_none());

        let soft1 = store.create_account(Network::Mainnet, record("S1", false)).await.unwrap();
        store.create_account(Network::Testnet, record("S2", false)).await.unwrap();
        assert_eq!(store.main_account_id().unwrap(), Some(soft1));
    }

    #[test]
    fn test_next_index_exhausted() {
        let store = store();
        let id = AccountId::new(u32::MAX, Network::Mainnet, Chain::Ton);
        store.set_account_value(&id, ADDRESSES, &"addr").unwrap();
        assert!(matches!(store.next_index(), Err(AccountError::IndexExhausted)));
    }

    #[test]
    fn test_update_account_value_inserts_edits_and_removes() {
        let store = store();
        let id = AccountId::new(0, Network::Mainnet, Chain::Ton);

        let existed = store
            .update_account_value(&id, "counters", |slot: &mut Option<u32>| {
                let existed = slot.is_some();
                *slot = Some(slot.unwrap_or(0) + 1);
                existed
            })
            .unwrap();
        assert!(!existed);
        store
            .update_account_value(&id, "counters", |slot: &mut Option<u32>| *slot = slot.map(|n| n + 1))
            .unwrap();
        assert_eq!(store.get_account_value::<u32>(&id, "counters").unwrap(), Some(2));

        store
            .update_account_value(&id, "counters", |slot: &mut Option<u32>| *slot = None)
            .unwrap();
        assert_eq!(store.get_account_value::<u32>(&id, "counters").unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_writes_to_one_map_all_survive() {
        let store = Arc::new(store());
        let tasks: Vec<_> = (0..200u32)
            .map(|index| {
                let store = store.clone();
                tokio::spawn(async move {
                    let id = AccountId::new(index, Network::Mainnet, Chain::Ton);
                    store.set_account_value(&id, ADDRESSES, &format!("addr{}", index))
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.account_ids().unwrap().len(), 200);
    }

    #[tokio::test]
    async fn test_remove_values() {
        let store = store();
        let main = store.create_account(Network::Mainnet, record("M", false)).await.unwrap();
        let test = store.create_account(Network::Testnet, record("T", false)).await.unwrap();

        store.remove_network_accounts_value(Network::Testnet, ADDRESSES).unwrap();
        assert!(store.fetch_stored_address(&test).is_err());
        assert_eq!(store.fetch_stored_address(&main).unwrap(), "M");

        store.remove_account_value(&main, ADDRESSES).unwrap();
        assert!(store.account_ids().unwrap().is_empty());
    }
}
