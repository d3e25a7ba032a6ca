//! Older in-page provider methods (`ton_*`)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use tracing::debug;

use super::errors::SessionError;
use super::history::LocalTransactionDraft;
use super::ledger::{LedgerError, TransferMessage};
use super::types::{DappApproval, LegacyDataType, LegacyTransferParams, LegacyWallet};
use super::ui::{SiteUpdate, UiUpdate};
use super::WalletContext;
use crate::account::AccountId;

pub struct LegacyProvider {
    ctx: Arc<WalletContext>,
}

impl LegacyProvider {
    pub fn new(ctx: Arc<WalletContext>) -> Self {
        Self { ctx }
    }

    /// Address of the current account, or nothing when logged out.
    pub fn request_accounts(&self) -> Result<Vec<String>, SessionError> {
        match self.ctx.accounts.current_account_id()? {
            Some(account_id) => Ok(vec![self.ctx.accounts.fetch_stored_address(&account_id)?]),
            None => Ok(Vec::new()),
        }
    }

    pub async fn request_wallets(&self) -> Result<Vec<LegacyWallet>, SessionError> {
        let Some(account_id) = self.ctx.accounts.current_account_id()? else {
            return Ok(Vec::new());
        };
        Ok(vec![LegacyWallet {
            address: self.ctx.accounts.fetch_stored_address(&account_id)?,
            public_key: self.ctx.accounts.fetch_stored_public_key(&account_id)?,
            wallet_version: self.ctx.ledger.wallet_version(&account_id).await?,
        }])
    }

    pub async fn get_balance(&self) -> Result<String, SessionError> {
        let account_id = self.ctx.accounts.current_account_id_or_fail()?;
        Ok(self.ctx.ledger.get_balance(&account_id).await?)
    }

    /// Pushed to a site right after it initializes, and on account switches.
    pub fn site_accounts_update(&self) -> Result<SiteUpdate, SessionError> {
        Ok(SiteUpdate::UpdateAccounts {
            accounts: self.request_accounts()?,
        })
    }

    /// Turn the `data` field into a base64 BOC payload.
    async fn pack_data(&self, params: &LegacyTransferParams) -> Result<Option<String>, SessionError> {
        let Some(data) = params.data.as_deref() else {
            return Ok(None);
        };
        let ledger = &self.ctx.ledger;
        let packed = match params.data_type {
            Some(LegacyDataType::Boc) => data.to_string(),
            Some(LegacyDataType::Hex) => {
                let bytes = hex::decode(data).map_err(|e| SessionError::bad_request(format!("Invalid hex data: {}", e)))?;
                ledger.pack_payload(&bytes, false).await?
            }
            Some(LegacyDataType::Base64) => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|e| SessionError::bad_request(format!("Invalid base64 data: {}", e)))?;
                ledger.pack_payload(&bytes, false).await?
            }
            Some(LegacyDataType::Text) | None => ledger.pack_payload(data.as_bytes(), true).await?,
        };
        Ok(Some(packed))
    }

    /// Returns false when the ledger refuses the transfer; user rejection is an error.
    pub async fn send_transaction(&self, params: LegacyTransferParams) -> Result<bool, SessionError> {
        let account_id = self.ctx.accounts.current_account_id_or_fail()?;
        let payload = self.pack_data(&params).await?;
        let comment = match params.data_type {
            Some(LegacyDataType::Text) => params.data.clone(),
            _ => None,
        };
        let message = TransferMessage {
            to_address: params.to.clone(),
            amount: params.value.clone(),
            payload,
            state_init: params.state_init.clone(),
        };

        self.ctx.ui.ensure_window().await;

        let draft = match self.ctx.ledger.check_draft(&account_id, &message).await {
            Ok(draft) => draft,
            Err(e) => {
                let err = SessionError::from(e);
                debug!(context = "ton_sendTransaction", error = %err, "Draft check failed");
                if let Some(error) = err.display_error() {
                    self.ctx.ui.dispatch(UiUpdate::ShowError { error });
                }
                return Ok(false);
            }
        };

        let is_hardware = self.ctx.accounts.is_hardware_account(&account_id)?;
        let parsed_payload = match (&message.payload, is_hardware) {
            (Some(payload), true) => Some(
                self.ctx
                    .ledger
                    .parse_payload(account_id.network, &message.to_address, payload)
                    .await?,
            ),
            _ => None,
        };

        let (promise_id, promise) = self.ctx.promises.create();
        self.ctx.ui.dispatch(UiUpdate::CreateTransaction {
            promise_id,
            to_address: message.to_address.clone(),
            amount: message.amount.clone(),
            fee: draft.fee.clone(),
            comment: comment.clone(),
            state_init: is_hardware.then(|| message.state_init.clone()).flatten(),
            raw_payload: is_hardware.then(|| message.payload.clone()).flatten(),
            parsed_payload,
        });

        let sent = match promise.wait().await? {
            DappApproval::SignedTransfers { transfers } if is_hardware => {
                let Some(first) = transfers.into_iter().next() else {
                    return Err(SessionError::bad_request("No signed transfer"));
                };
                self.ctx
                    .ledger
                    .send_signed_messages(&account_id, std::slice::from_ref(&first))
                    .await
                    .and_then(|mut outcomes| {
                        outcomes
                            .pop()
                            .unwrap_or_else(|| Err(LedgerError::Submit("No outcome for the signed message".to_string())))
                    })
            }
            DappApproval::Password { password } if !is_hardware => {
                let key = self.ctx.keys.fetch_key_pair(&account_id, &password)?;
                self.ctx.ledger.submit_transfer(&account_id, &key, &message).await
            }
            other => {
                return Err(SessionError::Unknown(format!(
                    "Approval does not match the account kind: {:?}",
                    other
                )))
            }
        };

        if let Err(e) = sent {
            debug!(context = "ton_sendTransaction", error = %e, "Transfer failed");
            return Ok(false);
        }

        self.record(&account_id, &message, comment, draft.fee)?;
        Ok(true)
    }

    fn record(
        &self,
        account_id: &AccountId,
        message: &TransferMessage,
        comment: Option<String>,
        fee: String,
    ) -> Result<(), SessionError> {
        let from_address = self.ctx.accounts.fetch_stored_address(account_id)?;
        self.ctx.history.record(
            account_id,
            LocalTransactionDraft {
                amount: message.amount.clone(),
                from_address,
                to_address: message.to_address.clone(),
                comment,
                fee,
            },
        )?;
        Ok(())
    }

    /// Sign arbitrary hex bytes with the current account's key. Hex signature out.
    pub async fn raw_sign(&self, data_hex: &str) -> Result<String, SessionError> {
        let account_id = self.ctx.accounts.current_account_id_or_fail()?;
        let data = hex::decode(data_hex).map_err(|e| SessionError::bad_request(format!("Invalid hex data: {}", e)))?;

        self.ctx.ui.ensure_window().await;

        let (promise_id, promise) = self.ctx.promises.create();
        self.ctx.ui.dispatch(UiUpdate::CreateSignature {
            promise_id,
            data_hex: data_hex.to_string(),
        });

        let DappApproval::Password { password } = promise.wait().await? else {
            return Err(SessionError::Unknown("Expected a password approval".to_string()));
        };
        let key = self.ctx.keys.fetch_key_pair(&account_id, &password)?;
        Ok(key.sign_hex(&data))
    }
}
