//! JSON-RPC ledger client
//!
//! Talks to a wallet node over JSON-RPC 2.0. Transfers are prepared remotely,
//! signed here with the caller's key and submitted back; the secret never leaves
//! the process.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::address::{parse_address, to_friendly};
use crate::account::{AccountId, AccountStore, Network};
use crate::crypto::MessageSigner;
use crate::session::errors::DisplayError;
use crate::session::ledger::{
    Ledger, LedgerError, ParsedPayload, RawAddress, SignedTransfer, TransactionDraft, TransferMessage,
};
use crate::storage::Storage;

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreparedTransfer {
    /// Hex bytes the wallet key has to sign
    signing_message: String,
}

#[derive(Deserialize)]
struct SubmitResult {
    hash: String,
}

pub struct RpcLedger {
    url: String,
    client: Client,
    request_id: AtomicU64,
    accounts: AccountStore,
}

impl RpcLedger {
    pub fn new(url: String, timeout: Duration, storage: Arc<dyn Storage>) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        Ok(Self {
            url,
            client,
            request_id: AtomicU64::new(1),
            accounts: AccountStore::new(storage),
        })
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        debug!(method, id, "Ledger request");

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Request(format!("{}: {}", method, e)))?;

        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))?;

        if let Some(error) = envelope.error {
            return Err(classify_error(method, error));
        }

        let result = envelope
            .result
            .ok_or_else(|| LedgerError::InvalidResponse(format!("{}: missing result", method)))?;
        serde_json::from_value(result).map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))
    }

    fn address_of(&self, account: &AccountId) -> Result<String, LedgerError> {
        self.accounts
            .fetch_stored_address(account)
            .map_err(|e| LedgerError::Request(e.to_string()))
    }

    async fn sign_and_submit(
        &self,
        account: &AccountId,
        signer: &dyn MessageSigner,
        messages: &[TransferMessage],
        valid_until: Option<u64>,
    ) -> Result<String, LedgerError> {
        let address = self.address_of(account)?;
        let prepared: PreparedTransfer = self
            .request(
                "prepareTransfer",
                json!({
                    "network": account.network,
                    "address": address,
                    "publicKey": hex::encode(signer.public_key()),
                    "messages": messages,
                    "validUntil": valid_until,
                }),
            )
            .await?;

        let signing_message = hex::decode(&prepared.signing_message)
            .map_err(|e| LedgerError::InvalidResponse(format!("prepareTransfer: {}", e)))?;
        let signature = signer.sign_message(&signing_message);

        let submitted: SubmitResult = self
            .request(
                "submitTransfer",
                json!({
                    "network": account.network,
                    "address": address,
                    "signingMessage": prepared.signing_message,
                    "signature": hex::encode(signature),
                }),
            )
            .await
            .map_err(|e| match e {
                draft @ LedgerError::Draft(_) => draft,
                other => LedgerError::Submit(other.to_string()),
            })?;
        Ok(submitted.hash)
    }
}

/// Node errors carrying a `displayError` in `data` are draft refusals.
fn classify_error(method: &str, error: RpcErrorBody) -> LedgerError {
    let display_error = error
        .data
        .as_ref()
        .and_then(|data| data.get("displayError"))
        .and_then(|value| serde_json::from_value::<DisplayError>(value.clone()).ok());
    match display_error {
        Some(display_error) => LedgerError::Draft(display_error),
        None => {
            warn!(method, code = error.code, message = %error.message, "Ledger returned an error");
            LedgerError::Request(format!("{}: {}", method, error.message))
        }
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn check_draft(&self, account: &AccountId, message: &TransferMessage) -> Result<TransactionDraft, LedgerError> {
        self.check_multi_draft(account, std::slice::from_ref(message)).await
    }

    async fn check_multi_draft(
        &self,
        account: &AccountId,
        messages: &[TransferMessage],
    ) -> Result<TransactionDraft, LedgerError> {
        let address = self.address_of(account)?;
        self.request(
            "checkTransactionDraft",
            json!({ "network": account.network, "address": address, "messages": messages }),
        )
        .await
    }

    async fn submit_transfer(
        &self,
        account: &AccountId,
        signer: &dyn MessageSigner,
        message: &TransferMessage,
    ) -> Result<String, LedgerError> {
        self.sign_and_submit(account, signer, std::slice::from_ref(message), None)
            .await
    }

    async fn submit_multi_transfer(
        &self,
        account: &AccountId,
        signer: &dyn MessageSigner,
        messages: &[TransferMessage],
        valid_until: Option<u64>,
    ) -> Result<String, LedgerError> {
        self.sign_and_submit(account, signer, messages, valid_until).await
    }

    async fn send_signed_messages(
        &self,
        account: &AccountId,
        messages: &[SignedTransfer],
    ) -> Result<Vec<Result<String, LedgerError>>, LedgerError> {
        let address = self.address_of(account)?;
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            let outcome = self
                .request::<SubmitResult>(
                    "sendSignedMessage",
                    json!({
                        "network": account.network,
                        "address": address,
                        "boc": message.base64,
                        "seqno": message.seqno,
                    }),
                )
                .await
                .map(|result| result.hash)
                .map_err(|e| LedgerError::Submit(e.to_string()));
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn get_wallet_state_init(&self, account: &AccountId) -> Result<String, LedgerError> {
        let public_key = self
            .accounts
            .fetch_stored_public_key(account)
            .map_err(|e| LedgerError::Request(e.to_string()))?;
        let result: Value = self
            .request(
                "getWalletStateInit",
                json!({ "network": account.network, "publicKey": public_key }),
            )
            .await?;
        field_str(&result, "stateInit", "getWalletStateInit")
    }

    async fn get_balance(&self, account: &AccountId) -> Result<String, LedgerError> {
        let address = self.address_of(account)?;
        let result: Value = self
            .request("getBalance", json!({ "network": account.network, "address": address }))
            .await?;
        field_str(&result, "balance", "getBalance")
    }

    async fn wallet_version(&self, account: &AccountId) -> Result<Option<String>, LedgerError> {
        let address = self.address_of(account)?;
        let result: Value = self
            .request("getWalletVersion", json!({ "network": account.network, "address": address }))
            .await?;
        Ok(result.get("version").and_then(Value::as_str).map(str::to_string))
    }

    async fn parse_payload(
        &self,
        network: Network,
        to_address: &str,
        payload: &str,
    ) -> Result<ParsedPayload, LedgerError> {
        self.request(
            "parsePayload",
            json!({ "network": network, "toAddress": to_address, "payload": payload }),
        )
        .await
    }

    async fn is_wallet_initialized(&self, network: Network, address: &str) -> Result<bool, LedgerError> {
        let result: Value = self
            .request("isWalletInitialized", json!({ "network": network, "address": address }))
            .await?;
        result
            .get("initialized")
            .and_then(Value::as_bool)
            .ok_or_else(|| LedgerError::InvalidResponse("isWalletInitialized: missing initialized".into()))
    }

    fn format_address(&self, address: &str, bounceable: bool) -> Result<String, LedgerError> {
        let parsed = parse_address(address)?;
        Ok(to_friendly(&parsed.raw, bounceable, parsed.test_only))
    }

    fn raw_address(&self, address: &str) -> Result<RawAddress, LedgerError> {
        Ok(parse_address(address)?.raw)
    }

    async fn address_from_public_key(&self, network: Network, public_key: &[u8; 32]) -> Result<String, LedgerError> {
        let result: Value = self
            .request(
                "addressFromPublicKey",
                json!({ "network": network, "publicKey": hex::encode(public_key) }),
            )
            .await?;
        field_str(&result, "address", "addressFromPublicKey")
    }

    async fn pack_payload(&self, data: &[u8], is_comment: bool) -> Result<String, LedgerError> {
        let result: Value = self
            .request(
                "packPayload",
                json!({ "data": BASE64.encode(data), "isComment": is_comment }),
            )
            .await?;
        field_str(&result, "boc", "packPayload")
    }
}

fn field_str(result: &Value, field: &str, method: &str) -> Result<String, LedgerError> {
    result
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LedgerError::InvalidResponse(format!("{}: missing {}", method, field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountRecord;
    use crate::crypto::{verify_with_pubkey_hex, KeyPair};
    use crate::storage::MemoryStorage;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<Value>>>;

    /// Minimal node: answers by method name and records every request.
    async fn node(State(calls): State<Calls>, Json(request): Json<Value>) -> Json<Value> {
        calls.lock().unwrap().push(request.clone());
        let id = request["id"].clone();
        let params = &request["params"];
        let body = match request["method"].as_str().unwrap_or_default() {
            "checkTransactionDraft" if params["messages"][0]["amount"] == "999999" => json!({
                "error": { "code": -32000, "message": "insufficient", "data": { "displayError": "InsufficientBalance" } }
            }),
            "checkTransactionDraft" => json!({ "result": { "fee": "1234" } }),
            "prepareTransfer" => json!({ "result": { "signingMessage": "cafebabe" } }),
            "submitTransfer" => json!({ "result": { "hash": "h1" } }),
            "sendSignedMessage" if params["seqno"] == 2 => json!({
                "error": { "code": -32001, "message": "seqno mismatch" }
            }),
            "sendSignedMessage" => json!({ "result": { "hash": format!("h-{}", params["seqno"]) } }),
            "getBalance" => json!({ "result": { "balance": "42" } }),
            "getWalletVersion" => json!({ "result": { "version": null } }),
            other => json!({ "error": { "code": -32601, "message": format!("unknown {}", other) } }),
        };
        let mut response = body;
        response["jsonrpc"] = json!("2.0");
        response["id"] = id;
        Json(response)
    }

    async fn start_node() -> (String, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new().route("/", post(node)).with_state(calls.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/", addr), calls)
    }

    async fn ledger_with_account() -> (RpcLedger, AccountId, KeyPair, Calls) {
        let (url, calls) = start_node().await;
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let key = KeyPair::generate();
        let account = AccountStore::new(storage.clone())
            .create_account(
                Network::Mainnet,
                AccountRecord {
                    address: "EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9c".into(),
                    public_key: key.public_key_hex(),
                    ledger: None,
                },
            )
            .await
            .unwrap();
        let ledger = RpcLedger::new(url, Duration::from_secs(5), storage).unwrap();
        (ledger, account, key, calls)
    }

    fn message(amount: &str) -> TransferMessage {
        TransferMessage {
            to_address: format!("0:{}", "11".repeat(32)),
            amount: amount.into(),
            payload: None,
            state_init: None,
        }
    }

    #[tokio::test]
    async fn test_draft_fee_and_refusal() {
        let (ledger, account, _, _) = ledger_with_account().await;
        assert_eq!(ledger.check_draft(&account, &message("1")).await.unwrap().fee, "1234");
        assert_eq!(
            ledger.check_draft(&account, &message("999999")).await.unwrap_err(),
            LedgerError::Draft(DisplayError::InsufficientBalance)
        );
    }

    #[tokio::test]
    async fn test_transfer_is_signed_locally() {
        let (ledger, account, key, calls) = ledger_with_account().await;
        let hash = ledger.submit_transfer(&account, &key, &message("5")).await.unwrap();
        assert_eq!(hash, "h1");

        let calls = calls.lock().unwrap();
        let submit = calls.iter().find(|c| c["method"] == "submitTransfer").unwrap();
        let signature = hex::decode(submit["params"]["signature"].as_str().unwrap()).unwrap();
        assert!(verify_with_pubkey_hex(&[0xca, 0xfe, 0xba, 0xbe], &signature, &key.public_key_hex()));
        assert!(calls.iter().all(|c| !c.to_string().contains(&hex::encode(key.secret_bytes()))));
    }

    #[tokio::test]
    async fn test_signed_messages_report_each_outcome() {
        let (ledger, account, _, _) = ledger_with_account().await;
        let signed: Vec<SignedTransfer> = (1..=3)
            .map(|seqno| SignedTransfer {
                base64: format!("boc{}", seqno),
                seqno,
                params: message("1"),
            })
            .collect();
        let outcomes = ledger.send_signed_messages(&account, &signed).await.unwrap();
        assert_eq!(outcomes[0], Ok("h-1".to_string()));
        assert!(matches!(outcomes[1], Err(LedgerError::Submit(_))));
        assert_eq!(outcomes[2], Ok("h-3".to_string()));
    }

    #[tokio::test]
    async fn test_simple_queries() {
        let (ledger, account, _, _) = ledger_with_account().await;
        assert_eq!(ledger.get_balance(&account).await.unwrap(), "42");
        assert_eq!(ledger.wallet_version(&account).await.unwrap(), None);
        assert!(matches!(
            ledger.get_wallet_state_init(&account).await,
            Err(LedgerError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_address_forms_are_local() {
        let ledger = RpcLedger::new(
            "http://127.0.0.1:9/".into(),
            Duration::from_secs(1),
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();
        let zero = format!("0:{}", "00".repeat(32));
        assert_eq!(
            ledger.format_address(&zero, false).unwrap(),
            "UQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAJKZ"
        );
        assert_eq!(
            ledger
                .raw_address("EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9c")
                .unwrap()
                .to_string(),
            zero
        );
    }
}
