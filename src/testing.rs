//! In-memory collaborators for unit tests

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::account::{AccountId, AccountRecord, HardwareInfo, Network};
use crate::crypto::{KeyPair, MessageSigner};
use crate::session::ledger::{Ledger, LedgerError, ParsedPayload, RawAddress, SignedTransfer, TransactionDraft, TransferMessage};
use crate::session::manifest::{ManifestError, ManifestFetcher};
use crate::session::ui::{UiSink, UiUpdate};
use crate::session::{DisplayError, WalletContext};
use crate::storage::MemoryStorage;

pub const PASSWORD: &str = "correct horse";
pub const ORIGIN: &str = "https://app.example";
pub const MANIFEST_URL: &str = "https://app.example/tonconnect-manifest.json";

/// Records every update and lets a test await prompts one by one.
pub struct RecordingUi {
    updates: Mutex<Vec<UiUpdate>>,
    tx: mpsc::UnboundedSender<UiUpdate>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<UiUpdate>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            updates: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn updates(&self) -> Vec<UiUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn prompt_count(&self) -> usize {
        self.updates()
            .iter()
            .filter(|u| {
                matches!(
                    u,
                    UiUpdate::DappConnect { .. }
                        | UiUpdate::DappSendTransactions { .. }
                        | UiUpdate::CreateTransaction { .. }
                        | UiUpdate::CreateSignature { .. }
                )
            })
            .count()
    }

    pub fn errors_shown(&self) -> Vec<DisplayError> {
        self.updates()
            .into_iter()
            .filter_map(|u| match u {
                UiUpdate::ShowError { error } => Some(error),
                _ => None,
            })
            .collect()
    }

    /// Next update carrying a promise id, skipping notices.
    pub async fn next_prompt(&self) -> (String, UiUpdate) {
        let mut rx = self.rx.lock().await;
        loop {
            let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("no prompt dispatched")
                .expect("ui channel closed");
            let promise_id = match &update {
                UiUpdate::DappConnect { promise_id, .. }
                | UiUpdate::DappSendTransactions { promise_id, .. }
                | UiUpdate::CreateTransaction { promise_id, .. }
                | UiUpdate::CreateSignature { promise_id, .. } => promise_id.clone(),
                _ => continue,
            };
            return (promise_id, update);
        }
    }
}

#[async_trait]
impl UiSink for RecordingUi {
    fn dispatch(&self, update: UiUpdate) {
        self.updates.lock().unwrap().push(update.clone());
        let _ = self.tx.send(update);
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn ensure_window(&self) -> bool {
        false
    }
}

/// Raw addresses in tests are `wc:hex`; friendly ones are `EQ<hex>` / `UQ<hex>`.
#[derive(Default)]
pub struct MockLedger {
    pub draft_error: Mutex<Option<DisplayError>>,
    pub payloads: Mutex<HashMap<String, ParsedPayload>>,
    pub uninitialized: Mutex<HashSet<String>>,
    pub failing_signed: Mutex<HashSet<usize>>,
    pub omit_signed_outcomes: Mutex<bool>,
    pub submitted: Mutex<Vec<TransferMessage>>,
    pub sent_signed: Mutex<Vec<SignedTransfer>>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_drafts_with(&self, error: DisplayError) {
        *self.draft_error.lock().unwrap() = Some(error);
    }

    pub fn fail_signed_message(&self, index: usize) {
        self.failing_signed.lock().unwrap().insert(index);
    }

    /// Answer `send_signed_messages` with an empty outcome list.
    pub fn omit_signed_outcomes(&self) {
        *self.omit_signed_outcomes.lock().unwrap() = true;
    }

    pub fn parse_as(&self, raw: &str, parsed: ParsedPayload) {
        self.payloads.lock().unwrap().insert(raw.to_string(), parsed);
    }

    fn check(&self) -> Result<TransactionDraft, LedgerError> {
        match *self.draft_error.lock().unwrap() {
            Some(error) => Err(LedgerError::Draft(error)),
            None => Ok(TransactionDraft {
                fee: "5000000".to_string(),
            }),
        }
    }
}

pub fn raw_address_for(seed: u8) -> String {
    format!("0:{}", hex::encode([seed; 32]))
}

#[async_trait]
impl Ledger for MockLedger {
    async fn check_draft(&self, _account: &AccountId, _message: &TransferMessage) -> Result<TransactionDraft, LedgerError> {
        self.check()
    }

    async fn check_multi_draft(
        &self,
        _account: &AccountId,
        _messages: &[TransferMessage],
    ) -> Result<TransactionDraft, LedgerError> {
        self.check()
    }

    async fn submit_transfer(
        &self,
        _account: &AccountId,
        signer: &dyn MessageSigner,
        message: &TransferMessage,
    ) -> Result<String, LedgerError> {
        let signature = signer.sign_message(message.to_address.as_bytes());
        self.submitted.lock().unwrap().push(message.clone());
        Ok(hex::encode(&signature[..8]))
    }

    async fn submit_multi_transfer(
        &self,
        _account: &AccountId,
        signer: &dyn MessageSigner,
        messages: &[TransferMessage],
        _valid_until: Option<u64>,
    ) -> Result<String, LedgerError> {
        let signature = signer.sign_message(b"batch");
        self.submitted.lock().unwrap().extend_from_slice(messages);
        Ok(hex::encode(&signature[..8]))
    }

    async fn send_signed_messages(
        &self,
        _account: &AccountId,
        messages: &[SignedTransfer],
    ) -> Result<Vec<Result<String, LedgerError>>, LedgerError> {
        let failing = self.failing_signed.lock().unwrap().clone();
        self.sent_signed.lock().unwrap().extend_from_slice(messages);
        if *self.omit_signed_outcomes.lock().unwrap() {
            return Ok(Vec::new());
        }
        Ok(messages
            .iter()
            .enumerate()
            .map(|(index, message)| {
                if failing.contains(&index) {
                    Err(LedgerError::Submit(format!("seqno {} rejected", message.seqno)))
                } else {
                    Ok(format!("hash-{}", index))
                }
            })
            .collect())
    }

    async fn get_wallet_state_init(&self, _account: &AccountId) -> Result<String, LedgerError> {
        Ok("te6cckstateinit".to_string())
    }

    async fn get_balance(&self, _account: &AccountId) -> Result<String, LedgerError> {
        Ok("1000000000".to_string())
    }

    async fn wallet_version(&self, _account: &AccountId) -> Result<Option<String>, LedgerError> {
        Ok(Some("v4R2".to_string()))
    }

    async fn parse_payload(&self, _network: Network, _to_address: &str, payload: &str) -> Result<ParsedPayload, LedgerError> {
        Ok(self
            .payloads
            .lock()
            .unwrap()
            .get(payload)
            .cloned()
            .unwrap_or_else(|| ParsedPayload::Unknown {
                base64: payload.to_string(),
            }))
    }

    async fn is_wallet_initialized(&self, _network: Network, address: &str) -> Result<bool, LedgerError> {
        Ok(!self.uninitialized.lock().unwrap().contains(address))
    }

    fn format_address(&self, address: &str, bounceable: bool) -> Result<String, LedgerError> {
        let raw = self.raw_address(address)?;
        let prefix = if bounceable { "EQ" } else { "UQ" };
        Ok(format!("{}{}", prefix, hex::encode(raw.hash)))
    }

    fn raw_address(&self, address: &str) -> Result<RawAddress, LedgerError> {
        if let Some(hash) = address.strip_prefix("EQ").or_else(|| address.strip_prefix("UQ")) {
            return format!("0:{}", hash).parse();
        }
        address.parse()
    }

    async fn address_from_public_key(&self, _network: Network, public_key: &[u8; 32]) -> Result<String, LedgerError> {
        Ok(format!("EQ{}", hex::encode(public_key)))
    }

    async fn pack_payload(&self, data: &[u8], _is_comment: bool) -> Result<String, LedgerError> {
        Ok(BASE64.encode(data))
    }
}

#[derive(Default)]
pub struct MockManifests {
    manifests: Mutex<HashMap<String, Value>>,
}

impl MockManifests {
    pub fn new() -> Self {
        let manifests = Self::default();
        manifests.serve(
            MANIFEST_URL,
            json!({
                "url": ORIGIN,
                "name": "Example Dapp",
                "iconUrl": "https://app.example/icon.png",
            }),
        );
        manifests
    }

    pub fn serve(&self, url: &str, manifest: Value) {
        self.manifests.lock().unwrap().insert(url.to_string(), manifest);
    }
}

#[async_trait]
impl ManifestFetcher for MockManifests {
    async fn fetch(&self, manifest_url: &str) -> Result<Value, ManifestError> {
        self.manifests
            .lock()
            .unwrap()
            .get(manifest_url)
            .cloned()
            .ok_or_else(|| ManifestError::Fetch("HTTP 404 Not Found".into()))
    }
}

pub struct TestWallet {
    pub ctx: Arc<WalletContext>,
    pub ui: Arc<RecordingUi>,
    pub ledger: Arc<MockLedger>,
    pub manifests: Arc<MockManifests>,
}

impl TestWallet {
    pub fn new() -> Self {
        let ui = Arc::new(RecordingUi::new());
        let ledger = Arc::new(MockLedger::new());
        let manifests = Arc::new(MockManifests::new());
        let ctx = WalletContext::new(
            Arc::new(MemoryStorage::new()),
            ledger.clone(),
            manifests.clone(),
            ui.clone(),
        );
        Self {
            ctx,
            ui,
            ledger,
            manifests,
        }
    }

    /// Software account with its key in the vault under [`PASSWORD`]; becomes current.
    pub async fn add_software_account(&self, network: Network) -> (AccountId, KeyPair) {
        let key = KeyPair::generate();
        let record = AccountRecord {
            address: format!("EQ{}", hex::encode(key.public_key())),
            public_key: key.public_key_hex(),
            ledger: None,
        };
        let account_id = self.ctx.accounts.create_account(network, record).await.unwrap();
        self.ctx.keys.store(&account_id, &key, PASSWORD).unwrap();
        self.ctx.accounts.set_current_account_id(&account_id).await.unwrap();
        (account_id, key)
    }

    /// Hardware account; the returned key stands in for the device.
    pub async fn add_hardware_account(&self, network: Network) -> (AccountId, KeyPair) {
        let key = KeyPair::generate();
        let record = AccountRecord {
            address: format!("EQ{}", hex::encode(key.public_key())),
            public_key: key.public_key_hex(),
            ledger: Some(HardwareInfo {
                index: 0,
                driver: "hid".to_string(),
            }),
        };
        let account_id = self.ctx.accounts.create_account(network, record).await.unwrap();
        self.ctx.accounts.set_current_account_id(&account_id).await.unwrap();
        (account_id, key)
    }
}
