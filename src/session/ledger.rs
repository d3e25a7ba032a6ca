//! Ledger collaborator: fee checks, submission, address helpers

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::errors::DisplayError;
use crate::account::{AccountId, Network};
use crate::crypto::MessageSigner;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The draft was refused before signing (insufficient funds, bad address, ...).
    #[error("Draft rejected: {0:?}")]
    Draft(DisplayError),
    #[error("Ledger request failed: {0}")]
    Request(String),
    #[error("Invalid ledger response: {0}")]
    InvalidResponse(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Submission failed: {0}")]
    Submit(String),
}

/// One outgoing message, ready for pricing or signing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferMessage {
    pub to_address: String,
    pub amount: String,
    /// Base64 BOC of the message body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub fee: String,
}

/// A message signed on an external device, submitted as-is.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransfer {
    pub base64: String,
    pub seqno: u32,
    pub params: TransferMessage,
}

/// Decoded message body, as far as the ledger understands it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ParsedPayload {
    Comment {
        comment: String,
    },
    EncryptedComment {
        encrypted_comment: String,
    },
    TransferNft {
        nft_address: String,
        new_owner: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forward_payload: Option<String>,
    },
    TokensTransfer {
        amount: String,
        destination: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forward_payload: Option<String>,
    },
    Unknown {
        base64: String,
    },
}

/// Workchain plus 32-byte account hash, printed as `wc:hex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddress {
    pub workchain: i32,
    pub hash: [u8; 32],
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workchain, hex::encode(self.hash))
    }
}

impl FromStr for RawAddress {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LedgerError::InvalidAddress(s.to_string());
        let (workchain, hash) = s.split_once(':').ok_or_else(invalid)?;
        let workchain: i32 = workchain.parse().map_err(|_| invalid())?;
        let bytes = hex::decode(hash).map_err(|_| invalid())?;
        let hash: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self { workchain, hash })
    }
}

/// Everything the session protocol needs from the blockchain side.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn check_draft(&self, account: &AccountId, message: &TransferMessage) -> Result<TransactionDraft, LedgerError>;

    /// Price a batch as one unit.
    async fn check_multi_draft(
        &self,
        account: &AccountId,
        messages: &[TransferMessage],
    ) -> Result<TransactionDraft, LedgerError>;

    async fn submit_transfer(
        &self,
        account: &AccountId,
        signer: &dyn MessageSigner,
        message: &TransferMessage,
    ) -> Result<String, LedgerError>;

    /// Sign and submit the whole batch under one key.
    async fn submit_multi_transfer(
        &self,
        account: &AccountId,
        signer: &dyn MessageSigner,
        messages: &[TransferMessage],
        valid_until: Option<u64>,
    ) -> Result<String, LedgerError>;

    /// Submit pre-signed messages one by one; the outcome of each is reported separately.
    async fn send_signed_messages(
        &self,
        account: &AccountId,
        messages: &[SignedTransfer],
    ) -> Result<Vec<Result<String, LedgerError>>, LedgerError>;

    async fn get_wallet_state_init(&self, account: &AccountId) -> Result<String, LedgerError>;

    async fn get_balance(&self, account: &AccountId) -> Result<String, LedgerError>;

    async fn wallet_version(&self, account: &AccountId) -> Result<Option<String>, LedgerError>;

    async fn parse_payload(
        &self,
        network: Network,
        to_address: &str,
        payload: &str,
    ) -> Result<ParsedPayload, LedgerError>;

    async fn is_wallet_initialized(&self, network: Network, address: &str) -> Result<bool, LedgerError>;

    /// User-friendly base64 form of any address representation.
    fn format_address(&self, address: &str, bounceable: bool) -> Result<String, LedgerError>;

    fn raw_address(&self, address: &str) -> Result<RawAddress, LedgerError>;

    async fn address_from_public_key(&self, network: Network, public_key: &[u8; 32]) -> Result<String, LedgerError>;

    /// Wrap arbitrary bytes (or a text comment) into a message body BOC.
    async fn pack_payload(&self, data: &[u8], is_comment: bool) -> Result<String, LedgerError>;
}
