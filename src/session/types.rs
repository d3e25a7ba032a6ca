//! Wire types of the dapp session protocol (TON Connect shapes)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::ErrorPayload;
use super::ledger::SignedTransfer;
use crate::account::{AccountId, Network};

pub const CHAIN_MAINNET: &str = "-239";
pub const CHAIN_TESTNET: &str = "-3";

/// Upper bound on messages accepted in one `sendTransaction` batch.
pub const MAX_BATCH_MESSAGES: usize = 3;

pub fn chain_code(network: Network) -> &'static str {
    match network {
        Network::Mainnet => CHAIN_MAINNET,
        Network::Testnet => CHAIN_TESTNET,
    }
}

/// Who is asking. Built by the API surface from the carrier, never from call arguments.
#[derive(Debug, Clone, Default)]
pub struct DappRequest {
    pub origin: Option<String>,
    pub account_id: Option<AccountId>,
    pub sse_options: Option<Value>,
}

impl DappRequest {
    pub fn from_origin(origin: Option<String>) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name")]
pub enum ConnectItem {
    #[serde(rename = "ton_addr")]
    TonAddr,
    #[serde(rename = "ton_proof")]
    TonProof { payload: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub manifest_url: String,
    pub items: Vec<ConnectItem>,
}

/// Challenge a dapp asks the wallet to sign during connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProofChallenge {
    pub timestamp: u64,
    pub domain: String,
    pub payload: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub address: bool,
    pub proof: bool,
}

/// Validated manifest content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DappMetadata {
    pub origin: String,
    pub url: String,
    pub name: String,
    pub icon_url: String,
    pub manifest_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProofDomain {
    pub length_bytes: u32,
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TonProof {
    pub timestamp: u64,
    pub domain: ProofDomain,
    pub signature: String,
    pub payload: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "name")]
pub enum ConnectItemReply {
    #[serde(rename = "ton_addr", rename_all = "camelCase")]
    TonAddr {
        address: String,
        network: String,
        public_key: String,
        wallet_state_init: String,
    },
    #[serde(rename = "ton_proof")]
    TonProof { proof: TonProof },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub items: Vec<ConnectItemReply>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectEvent {
    #[serde(rename = "connect")]
    Connect { id: u64, payload: ConnectPayload },
    #[serde(rename = "connect_error")]
    ConnectError { id: u64, payload: ErrorPayload },
}

impl ConnectEvent {
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub event: String,
    pub id: u64,
    pub payload: Value,
}

impl DisconnectEvent {
    pub fn new(id: u64) -> Self {
        Self {
            event: "disconnect".to_string(),
            id,
            payload: Value::Object(Default::default()),
        }
    }
}

/// Generic TON Connect RPC request: `params[0]` carries a JSON document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    pub id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessage {
    pub address: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransactionPayload {
    #[serde(default)]
    pub valid_until: Option<u64>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub messages: Vec<TransactionMessage>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RpcResponse {
    Success { result: String, id: String },
    Error { error: ErrorPayload, id: String },
}

impl RpcResponse {
    pub fn ok(id: String) -> Self {
        Self::Success {
            result: "ok".to_string(),
            id,
        }
    }
}

/// What the privileged UI hands back when it settles a pending request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DappApproval {
    Connect {
        account_id: AccountId,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        signature: Option<String>,
    },
    Password {
        password: String,
    },
    SignedTransfers {
        transfers: Vec<SignedTransfer>,
    },
}

/// Legacy in-page `ton_sendTransaction` parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTransferParams {
    pub to: String,
    pub value: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub data_type: Option<LegacyDataType>,
    #[serde(default)]
    pub state_init: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LegacyDataType {
    Text,
    Hex,
    Base64,
    Boc,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWallet {
    pub address: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_version: Option<String>,
}
