//! TON Connect flows: connect, reconnect, disconnect, sendTransaction, signData

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::dapps::DappRecord;
use super::errors::{DisplayError, SessionError};
use super::history::LocalTransactionDraft;
use super::ledger::{ParsedPayload, TransferMessage};
use super::manifest::{fetch_dapp_metadata, origin_host};
use super::proof::{build_proof_reply, sign_proof, verify_proof_signature};
use super::types::{
    chain_code, ConnectEvent, ConnectItem, ConnectItemReply, ConnectPayload, ConnectRequest, DappApproval,
    DappRequest, DisconnectEvent, Permissions, ProofChallenge, RpcRequest, RpcResponse, TransactionMessage,
    TransactionPayload, MAX_BATCH_MESSAGES,
};
use super::ui::{PreparedTransaction, UiUpdate};
use super::{now_millis, now_secs, WalletContext};
use crate::account::{AccountId, Network};

const OUTDATED_CONNECTION: &str = "The connection is outdated, try relogin";
const MAX_HARDWARE_COMMENT_LEN: usize = 120;
/// Anything above this is taken to be milliseconds.
const VALID_UNTIL_MILLIS_THRESHOLD: u64 = 10_000_000_000;

/// Best-effort fix-up for callers that send `valid_until` in milliseconds.
pub fn normalize_valid_until(valid_until: u64) -> u64 {
    if valid_until > VALID_UNTIL_MILLIS_THRESHOLD {
        (valid_until + 500) / 1000
    } else {
        valid_until
    }
}

pub fn is_valid_hardware_comment(comment: &str) -> bool {
    comment.len() <= MAX_HARDWARE_COMMENT_LEN && comment.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Payload kinds a hardware signer can display and sign.
pub fn is_hardware_supported(payload: &ParsedPayload) -> bool {
    match payload {
        ParsedPayload::Comment { comment } => is_valid_hardware_comment(comment),
        ParsedPayload::TransferNft { forward_payload, .. } => forward_payload.is_none(),
        _ => false,
    }
}

fn format_connect_error(id: u64, error: &SessionError) -> ConnectEvent {
    ConnectEvent::ConnectError {
        id,
        payload: error.to_payload(),
    }
}

pub struct TonConnect {
    ctx: Arc<WalletContext>,
}

impl TonConnect {
    pub fn new(ctx: Arc<WalletContext>) -> Self {
        Self { ctx }
    }

    fn validate_origin(&self, request: &DappRequest) -> Result<String, SessionError> {
        match request.origin.as_deref() {
            Some(origin) if !origin.is_empty() => Ok(origin.to_string()),
            _ => Err(SessionError::bad_request("Invalid origin")),
        }
    }

    /// Origin plus the account the request is bound to: explicit, or the
    /// last one connected to this origin on the current network.
    fn validate_connected(&self, request: &DappRequest) -> Result<(String, AccountId), SessionError> {
        let origin = self.validate_origin(request)?;
        if let Some(account_id) = request.account_id {
            return Ok((origin, account_id));
        }
        let network = self.ctx.accounts.current_account_id_or_fail()?.network;
        let account_id = self
            .ctx
            .dapps
            .find_last_connected_account(network, &origin)?
            .ok_or_else(|| SessionError::bad_request(OUTDATED_CONNECTION))?;
        Ok((origin, account_id))
    }

    pub async fn connect(&self, request: &DappRequest, message: ConnectRequest, id: u64) -> ConnectEvent {
        match self.try_connect(request, message, id).await {
            Ok(event) => event,
            Err(e) => {
                debug!(context = "tonConnect:connect", error = %e, "Connect failed");
                format_connect_error(id, &e)
            }
        }
    }

    async fn try_connect(&self, request: &DappRequest, message: ConnectRequest, id: u64) -> Result<ConnectEvent, SessionError> {
        let origin = self.validate_origin(request)?;
        let metadata = fetch_dapp_metadata(self.ctx.manifests.as_ref(), &origin, &message.manifest_url).await?;
        let dapp = DappRecord::new(metadata, now_millis(), request.sse_options.clone());

        if !message.items.contains(&ConnectItem::TonAddr) {
            return Err(SessionError::bad_request("Missing 'ton_addr'"));
        }

        let proof = match message.items.iter().find_map(|item| match item {
            ConnectItem::TonProof { payload } => Some(payload.clone()),
            _ => None,
        }) {
            Some(payload) => Some(ProofChallenge {
                timestamp: now_secs(),
                domain: origin_host(&origin).ok_or_else(|| SessionError::bad_request("Invalid origin"))?,
                payload,
            }),
            None => None,
        };

        let mut account_id = self
            .ctx
            .accounts
            .current_account_id()?
            .ok_or_else(|| SessionError::bad_request("The user is not authorized in the wallet"))?;
        let is_connected = self.ctx.dapps.is_connected(&account_id, &origin)?;

        let mut approval = None;
        if !is_connected || proof.is_some() {
            self.ctx.ui.ensure_window().await;

            let (promise_id, promise) = self.ctx.promises.create();
            self.ctx.ui.dispatch(UiUpdate::DappConnect {
                promise_id,
                account_id,
                dapp: dapp.clone(),
                permissions: Permissions {
                    address: true,
                    proof: proof.is_some(),
                },
                proof: proof.clone(),
            });

            match promise.wait().await? {
                DappApproval::Connect {
                    account_id: approved,
                    password,
                    signature,
                } => {
                    account_id = approved;
                    approval = Some((password, signature));
                }
                other => return Err(SessionError::Unknown(format!("Unexpected connect approval: {:?}", other))),
            }

            self.ctx.dapps.add(&account_id, dapp)?;
        }

        let bound = DappRequest {
            origin: Some(origin),
            account_id: Some(account_id),
            sse_options: None,
        };
        let mut event = self.reconnect(&bound, id).await;

        if let (ConnectEvent::Connect { payload, .. }, Some(proof)) = (&mut event, proof.as_ref()) {
            let (password, signature) = approval.unwrap_or_default();
            let item = self.proof_item(&account_id, proof, password, signature)?;
            payload.items.push(item);
        }

        Ok(event)
    }

    fn proof_item(
        &self,
        account_id: &AccountId,
        proof: &ProofChallenge,
        password: Option<String>,
        signature: Option<String>,
    ) -> Result<ConnectItemReply, SessionError> {
        let address = self.ctx.accounts.fetch_stored_address(account_id)?;
        let raw = self.ctx.ledger.raw_address(&address)?;

        match (password, signature) {
            (Some(password), _) => {
                let key = self.ctx.keys.fetch_key_pair(account_id, &password)?;
                Ok(sign_proof(&key, &raw, proof))
            }
            (None, Some(signature)) => {
                let public_key = self.ctx.accounts.fetch_stored_public_key(account_id)?;
                if !verify_proof_signature(&public_key, &raw, proof, &signature) {
                    return Err(SessionError::bad_request("Invalid proof signature"));
                }
                Ok(build_proof_reply(proof, signature))
            }
            (None, None) => Err(SessionError::bad_request("Missing proof signature")),
        }
    }

    pub async fn reconnect(&self, request: &DappRequest, id: u64) -> ConnectEvent {
        match self.try_reconnect(request).await {
            Ok(items) => ConnectEvent::Connect {
                id,
                payload: ConnectPayload { items },
            },
            Err(e) => {
                debug!(context = "tonConnect:reconnect", error = %e, "Reconnect failed");
                format_connect_error(id, &e)
            }
        }
    }

    async fn try_reconnect(&self, request: &DappRequest) -> Result<Vec<ConnectItemReply>, SessionError> {
        let (origin, account_id) = self.validate_connected(request)?;
        if !self.ctx.dapps.is_connected(&account_id, &origin)? {
            return Err(SessionError::bad_request(OUTDATED_CONNECTION));
        }

        self.ctx.dapps.activate(&account_id, &origin);
        self.ctx
            .dapps
            .update(&account_id, &origin, |dapp| dapp.connected_at = now_millis())?;

        let address = self.ctx.accounts.fetch_stored_address(&account_id)?;
        Ok(vec![self.address_item(&account_id, &address).await?])
    }

    async fn address_item(&self, account_id: &AccountId, address: &str) -> Result<ConnectItemReply, SessionError> {
        let wallet_state_init = self.ctx.ledger.get_wallet_state_init(account_id).await?;
        let public_key = self.ctx.accounts.fetch_stored_public_key(account_id)?;
        Ok(ConnectItemReply::TonAddr {
            address: self.ctx.ledger.raw_address(address)?.to_string(),
            network: chain_code(account_id.network).to_string(),
            public_key,
            wallet_state_init,
        })
    }

    /// Never fails from the caller's point of view.
    pub async fn disconnect(&self, request: &DappRequest, id: u64) -> DisconnectEvent {
        let outcome = self.validate_connected(request).and_then(|(origin, account_id)| {
            self.ctx.dapps.delete(&account_id, &origin, true)?;
            self.ctx.dapps.deactivate_account(&account_id);
            Ok(())
        });
        if let Err(e) = outcome {
            debug!(context = "tonConnect:disconnect", error = %e, "Disconnect failed");
        }
        DisconnectEvent::new(id)
    }

    pub fn deactivate(&self, request: &DappRequest) {
        match self.validate_origin(request) {
            Ok(origin) => self.ctx.dapps.deactivate_origin(&origin),
            Err(e) => debug!(context = "tonConnect:deactivate", error = %e, "Deactivate failed"),
        }
    }

    pub fn sign_data(&self, _request: &DappRequest, message: RpcRequest) -> RpcResponse {
        RpcResponse::Error {
            error: SessionError::MethodNotSupported.to_payload(),
            id: message.id,
        }
    }

    pub async fn send_transaction(&self, request: &DappRequest, message: RpcRequest) -> RpcResponse {
        let id = message.id.clone();
        match self.try_send_transaction(request, &message).await {
            Ok(()) => RpcResponse::ok(id),
            Err(err) => {
                debug!(context = "tonConnect:sendTransaction", error = %err, "Send transaction failed");
                if let Some(display_error) = err.display_error() {
                    if self.ctx.ui.is_alive() {
                        self.ctx.ui.dispatch(UiUpdate::ShowError { error: display_error });
                    }
                }
                RpcResponse::Error {
                    error: err.to_payload(),
                    id,
                }
            }
        }
    }

    async fn try_send_transaction(&self, request: &DappRequest, message: &RpcRequest) -> Result<(), SessionError> {
        let (origin, account_id) = self.validate_connected(request)?;

        let raw = message
            .params
            .first()
            .ok_or_else(|| SessionError::bad_request("Missing transaction payload"))?;
        let payload: TransactionPayload = serde_json::from_str(raw)
            .map_err(|e| SessionError::bad_request(format!("Invalid transaction payload: {}", e)))?;
        let messages: Vec<TransactionMessage> = payload.messages.into_iter().take(MAX_BATCH_MESSAGES).collect();
        if messages.is_empty() {
            return Err(SessionError::bad_request("Empty transaction batch"));
        }
        let valid_until = payload.valid_until.map(normalize_valid_until);

        let account = self.ctx.accounts.fetch_stored_account(&account_id)?;
        let is_hardware = account.is_hardware();

        if self.ctx.accounts.current_account_id()? != Some(account_id) {
            info!(account_id = %account_id, origin = %origin, "Switching to the account the dapp is bound to");
            self.ctx.accounts.set_current_account_id(&account_id).await?;
        }
        self.ctx.ui.ensure_window().await;

        let prepared: Vec<TransferMessage> = messages
            .iter()
            .map(|m| TransferMessage {
                to_address: m.address.clone(),
                amount: m.amount.clone(),
                payload: m.payload.clone(),
                state_init: m.state_init.clone(),
            })
            .collect();
        let draft = self.ctx.ledger.check_multi_draft(&account_id, &prepared).await?;

        let dapp = self.ctx.dapps.get(&account_id, &origin)?;
        let transactions = self.prepare_for_request(account_id.network, &messages, is_hardware).await?;

        let (promise_id, promise) = self.ctx.promises.create();
        self.ctx.ui.dispatch(UiUpdate::DappSendTransactions {
            promise_id,
            account_id,
            dapp,
            transactions: transactions.clone(),
            fee: draft.fee.clone(),
        });

        let approval = promise.wait().await?;

        if let Some(deadline) = valid_until {
            if deadline < now_secs() {
                return Err(SessionError::bad_request("The confirmation timeout has expired"));
            }
        }

        let succeeded: Vec<usize> = match (is_hardware, approval) {
            (true, DappApproval::SignedTransfers { transfers }) => {
                let outcomes = self.ctx.ledger.send_signed_messages(&account_id, &transfers).await?;
                let succeeded: Vec<usize> = outcomes
                    .iter()
                    .enumerate()
                    .filter_map(|(index, outcome)| match outcome {
                        Ok(_) => Some(index),
                        Err(e) => {
                            warn!(context = "tonConnect:sendTransaction", index, error = %e, "Signed message failed");
                            None
                        }
                    })
                    .collect();

                if succeeded.is_empty() {
                    return Err(SessionError::Unknown("Failed transfers".to_string()));
                }
                if succeeded.len() < messages.len() {
                    self.ctx.ui.dispatch(UiUpdate::ShowError {
                        error: DisplayError::PartialTransactionFailure,
                    });
                }
                succeeded
            }
            (false, DappApproval::Password { password }) => {
                let key = self.ctx.keys.fetch_key_pair(&account_id, &password)?;
                self.ctx
                    .ledger
                    .submit_multi_transfer(&account_id, &key, &prepared, valid_until)
                    .await?;
                (0..messages.len()).collect()
            }
            (_, other) => {
                return Err(SessionError::Unknown(format!(
                    "Approval does not match the account kind: {:?}",
                    other
                )))
            }
        };

        let from_address = self.ctx.accounts.fetch_stored_address(&account_id)?;
        for transaction in succeeded.into_iter().filter_map(|index| transactions.get(index)) {
            let comment = match &transaction.payload {
                Some(ParsedPayload::Comment { comment }) => Some(comment.clone()),
                _ => None,
            };
            self.ctx.history.record(
                &account_id,
                LocalTransactionDraft {
                    amount: transaction.amount.clone(),
                    from_address: from_address.clone(),
                    to_address: transaction.resolved_address.clone(),
                    comment,
                    fee: draft.fee.clone(),
                },
            )?;
        }

        Ok(())
    }

    /// Resolve every message for display and enforce hardware payload limits.
    async fn prepare_for_request(
        &self,
        network: Network,
        messages: &[TransactionMessage],
        is_hardware: bool,
    ) -> Result<Vec<PreparedTransaction>, SessionError> {
        let ledger = &self.ctx.ledger;
        let mut prepared = Vec::with_capacity(messages.len());

        for message in messages {
            let is_initialized = ledger.is_wallet_initialized(network, &message.address).await?;
            let resolved_address = ledger.format_address(&message.address, true)?;
            // Non-initialized recipients get the non-bounceable form
            let to_address = if is_initialized {
                resolved_address.clone()
            } else {
                ledger.format_address(&message.address, false)?
            };

            let payload = match &message.payload {
                Some(raw) => Some(ledger.parse_payload(network, &to_address, raw).await?),
                None => None,
            };

            if is_hardware {
                if let Some(payload) = &payload {
                    if !is_hardware_supported(payload) {
                        return Err(SessionError::bad_request_with(
                            "Unsupported payload",
                            DisplayError::UnsupportedHardwarePayload,
                        ));
                    }
                }
            }

            prepared.push(PreparedTransaction {
                resolved_address,
                to_address,
                amount: message.amount.clone(),
                raw_payload: message.payload.clone(),
                payload,
                state_init: message.state_init.clone(),
            });
        }

        Ok(prepared)
    }
}
