//! Methods reachable only from the privileged wallet window

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::account::{AccountId, AccountRecord, Network};
use crate::crypto::{KeyPair, MessageSigner};
use crate::session::{DappApproval, LegacyProvider, PopupBridge, SessionError, WalletContext};
use crate::transport::{CallContext, MethodCall, PeerInfo, Reply, RpcError, RpcHandler, UpdateSink};

#[derive(Debug)]
pub enum PopupMethod {
    ConfirmDappRequest { promise_id: String, approval: DappApproval },
    CancelDappRequest { promise_id: String },
    GetDapps { account_id: AccountId },
    DeleteDapp { account_id: AccountId, origin: String },
    ActivateAccount { account_id: AccountId },
    ImportMnemonic { mnemonic: String, password: String, network: Network },
}

impl PopupMethod {
    pub fn parse(call: &MethodCall) -> Result<Self, RpcError> {
        let method = match call.name.as_str() {
            "confirmDappRequest" => Self::ConfirmDappRequest {
                promise_id: call.arg(0)?,
                approval: call.arg(1)?,
            },
            "cancelDappRequest" => Self::CancelDappRequest { promise_id: call.arg(0)? },
            "getDapps" => Self::GetDapps { account_id: call.arg(0)? },
            "deleteDapp" => Self::DeleteDapp {
                account_id: call.arg(0)?,
                origin: call.arg(1)?,
            },
            "activateAccount" => Self::ActivateAccount { account_id: call.arg(0)? },
            "importMnemonic" => Self::ImportMnemonic {
                mnemonic: call.arg(0)?,
                password: call.arg(1)?,
                network: call.opt_arg(2)?.unwrap_or(Network::Mainnet),
            },
            other => return Err(RpcError::MethodNotFound(other.to_string())),
        };
        Ok(method)
    }
}

pub struct PopupApi {
    ctx: Arc<WalletContext>,
    bridge: Arc<PopupBridge>,
}

impl PopupApi {
    /// `bridge` must be the same instance the context dispatches UI updates to.
    pub fn new(ctx: Arc<WalletContext>, bridge: Arc<PopupBridge>) -> Self {
        Self { ctx, bridge }
    }

    /// Derive a key from the phrase, resolve its wallet address and store it under `password`.
    pub async fn import_mnemonic(&self, mnemonic: &str, password: &str, network: Network) -> Result<AccountId, SessionError> {
        let key = KeyPair::from_mnemonic(mnemonic)?;
        let address = self
            .ctx
            .ledger
            .address_from_public_key(network, &key.public_key())
            .await?;
        let record = AccountRecord {
            address,
            public_key: key.public_key_hex(),
            ledger: None,
        };
        let account_id = self.ctx.accounts.create_account(network, record).await?;
        self.ctx.keys.store(&account_id, &key, password)?;
        self.ctx.accounts.set_current_account_id(&account_id).await?;
        info!(account_id = %account_id, "Account imported from mnemonic");
        Ok(account_id)
    }

    async fn dispatch(&self, method: PopupMethod, call_ctx: &CallContext) -> Result<Value, RpcError> {
        let value = match method {
            PopupMethod::ConfirmDappRequest { promise_id, approval } => {
                self.ctx.promises.resolve(&promise_id, approval)?;
                Value::Null
            }
            PopupMethod::CancelDappRequest { promise_id } => {
                self.ctx.promises.reject(&promise_id)?;
                Value::Null
            }
            PopupMethod::GetDapps { account_id } => {
                let dapps = self.ctx.dapps.dapps(&account_id).map_err(SessionError::from)?;
                serde_json::to_value(dapps).map_err(|e| RpcError::Failed(e.to_string()))?
            }
            PopupMethod::DeleteDapp { account_id, origin } => {
                let deleted = self
                    .ctx
                    .dapps
                    .delete(&account_id, &origin, false)
                    .map_err(SessionError::from)?;
                Value::Bool(deleted)
            }
            PopupMethod::ActivateAccount { account_id } => {
                let previous = self
                    .ctx
                    .accounts
                    .set_current_account_id(&account_id)
                    .await
                    .map_err(SessionError::from)?;

                let ctx = self.ctx.clone();
                call_ctx.spawn_background("onDappSendUpdates", async move {
                    let update = LegacyProvider::new(ctx.clone()).site_accounts_update()?;
                    ctx.sites.broadcast(&update, None);
                    Ok(())
                });
                previous.map(|id| Value::String(id.to_string())).unwrap_or(Value::Null)
            }
            PopupMethod::ImportMnemonic {
                mnemonic,
                password,
                network,
            } => Value::String(self.import_mnemonic(&mnemonic, &password, network).await?.to_string()),
        };
        Ok(value)
    }
}

#[async_trait]
impl RpcHandler for PopupApi {
    async fn init(&self, _peer: &PeerInfo, updates: UpdateSink, _args: Vec<Value>) -> Result<(), RpcError> {
        self.bridge.attach(updates);
        Ok(())
    }

    async fn call(&self, call: MethodCall, ctx: CallContext) -> Result<Reply, RpcError> {
        let method = PopupMethod::parse(&call)?;
        Ok(Reply::from(self.dispatch(method, &ctx).await?))
    }

    fn on_disconnect(&self, peer: &PeerInfo) {
        self.bridge.detach(&peer.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::POPUP_CHANNEL;
    use crate::session::dapps::DappRecord;
    use crate::session::UiSink;
    use crate::testing::{MockLedger, MockManifests, ORIGIN};
    use crate::storage::MemoryStorage;
    use crate::transport::{pair, ClientEvent, LinkKind, RpcClient, RpcServer};
    use serde_json::json;
    use std::time::Duration;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    struct Harness {
        ctx: Arc<WalletContext>,
        bridge: Arc<PopupBridge>,
        client: RpcClient,
        // Held so the window's update stream stays open for the bridge
        _events: UnboundedReceiverStream<ClientEvent>,
    }

    fn harness() -> Harness {
        let bridge = Arc::new(PopupBridge::new());
        let ctx = WalletContext::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MockLedger::new()),
            Arc::new(MockManifests::new()),
            bridge.clone(),
        );
        let server = Arc::new(RpcServer::new(
            Arc::new(PopupApi::new(ctx.clone(), bridge.clone())),
            Some(POPUP_CHANNEL),
        ));
        let (link, end) = pair(PeerInfo::new(None, LinkKind::Persistent));
        tokio::spawn(async move { server.serve_peer(link).await });
        let (client, events) = RpcClient::connect(end, Some(POPUP_CHANNEL));
        Harness {
            ctx,
            bridge,
            client,
            _events: events,
        }
    }

    #[test]
    fn test_import_defaults_to_mainnet() {
        let call = MethodCall::new("importMnemonic", vec![json!(MNEMONIC), json!("pw")]);
        assert!(matches!(
            PopupMethod::parse(&call).unwrap(),
            PopupMethod::ImportMnemonic { network: Network::Mainnet, .. }
        ));
    }

    #[tokio::test]
    async fn test_init_attaches_window() {
        let h = harness();
        assert!(!h.bridge.is_alive());
        h.client.init(vec![]).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !h.bridge.is_alive() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_confirm_and_cancel_settle_promises() {
        let h = harness();
        h.client.init(vec![]).unwrap();

        let (id, promise) = h.ctx.promises.create();
        h.client
            .call("confirmDappRequest", vec![json!(id), json!({ "kind": "password", "password": "pw" })])
            .await
            .unwrap();
        assert!(matches!(promise.wait().await.unwrap(), DappApproval::Password { password } if password == "pw"));

        let (id, promise) = h.ctx.promises.create();
        h.client.call("cancelDappRequest", vec![json!(id)]).await.unwrap();
        assert!(promise.wait().await.is_err());

        assert!(h.client.call("cancelDappRequest", vec![json!("missing")]).await.is_err());
    }

    #[tokio::test]
    async fn test_import_then_activate() {
        let h = harness();
        h.client.init(vec![]).unwrap();

        let first = h
            .client
            .call("importMnemonic", vec![json!(MNEMONIC), json!("pw"), json!("testnet")])
            .await
            .unwrap();
        assert_eq!(first, json!("0-ton-testnet"));
        let first_id: AccountId = "0-ton-testnet".parse().unwrap();
        assert_eq!(h.ctx.accounts.current_account_id().unwrap(), Some(first_id));
        assert!(h.ctx.keys.fetch_key_pair(&first_id, "pw").is_ok());

        let second = h
            .client
            .call("importMnemonic", vec![json!(MNEMONIC), json!("pw")])
            .await
            .unwrap();
        assert_eq!(second, json!("1-ton-mainnet"));

        let previous = h.client.call("activateAccount", vec![first]).await.unwrap();
        assert_eq!(previous, json!("1-ton-mainnet"));
        assert_eq!(h.ctx.accounts.current_account_id().unwrap(), Some(first_id));
    }

    #[tokio::test]
    async fn test_get_and_delete_dapps() {
        let h = harness();
        h.client.init(vec![]).unwrap();
        let account_id = h
            .ctx
            .accounts
            .create_account(Network::Mainnet, AccountRecord::default())
            .await
            .unwrap();
        h.ctx
            .dapps
            .add(
                &account_id,
                DappRecord {
                    origin: ORIGIN.into(),
                    url: ORIGIN.into(),
                    name: "Example".into(),
                    icon_url: format!("{}/icon.png", ORIGIN),
                    manifest_url: format!("{}/manifest.json", ORIGIN),
                    connected_at: 1,
                    sse: None,
                },
            )
            .unwrap();

        let dapps = h.client.call("getDapps", vec![json!(account_id)]).await.unwrap();
        assert_eq!(dapps[0]["origin"], ORIGIN);

        let deleted = h
            .client
            .call("deleteDapp", vec![json!(account_id), json!(ORIGIN)])
            .await
            .unwrap();
        assert_eq!(deleted, json!(true));
        assert!(!h.ctx.dapps.is_connected(&account_id, ORIGIN).unwrap());
    }
}
