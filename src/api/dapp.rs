//! Methods reachable from sites

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::session::types::{ConnectRequest, LegacyTransferParams, RpcRequest};
use crate::session::{DappRequest, LegacyProvider, TonConnect, WalletContext};
use crate::transport::{CallContext, MethodCall, PeerInfo, Reply, RpcError, RpcHandler, UpdateSink};

#[derive(Deserialize, Debug)]
pub struct RawSignParams {
    pub data: String,
}

/// Every call a site can make, decoded from its positional args.
#[derive(Debug)]
pub enum DappMethod {
    Connect { message: ConnectRequest, id: u64 },
    Reconnect { id: u64 },
    Disconnect { id: u64 },
    SendTransaction(RpcRequest),
    SignData(RpcRequest),
    Deactivate,
    RequestAccounts,
    RequestWallets,
    GetBalance,
    LegacySendTransaction(LegacyTransferParams),
    RawSign(RawSignParams),
}

impl DappMethod {
    pub fn parse(call: &MethodCall) -> Result<Self, RpcError> {
        let method = match call.name.as_str() {
            "tonConnect_connect" => Self::Connect {
                message: call.arg(0)?,
                id: call.arg(1)?,
            },
            "tonConnect_reconnect" => Self::Reconnect { id: call.arg(0)? },
            "tonConnect_disconnect" => Self::Disconnect { id: call.arg(0)? },
            "tonConnect_sendTransaction" => Self::SendTransaction(call.arg(0)?),
            "tonConnect_signData" => Self::SignData(call.arg(0)?),
            "tonConnect_deactivate" => Self::Deactivate,
            "ton_requestAccounts" => Self::RequestAccounts,
            "ton_requestWallets" => Self::RequestWallets,
            "ton_getBalance" => Self::GetBalance,
            "ton_sendTransaction" => Self::LegacySendTransaction(call.arg(0)?),
            "ton_rawSign" => Self::RawSign(call.arg(0)?),
            other => return Err(RpcError::MethodNotFound(other.to_string())),
        };
        Ok(method)
    }
}

pub struct DappApi {
    ctx: Arc<WalletContext>,
    ton_connect: TonConnect,
    legacy: LegacyProvider,
}

impl DappApi {
    pub fn new(ctx: Arc<WalletContext>) -> Self {
        Self {
            ton_connect: TonConnect::new(ctx.clone()),
            legacy: LegacyProvider::new(ctx.clone()),
            ctx,
        }
    }

    async fn dispatch(&self, request: DappRequest, method: DappMethod) -> Result<Value, RpcError> {
        let value = match method {
            DappMethod::Connect { message, id } => to_json(&self.ton_connect.connect(&request, message, id).await)?,
            DappMethod::Reconnect { id } => to_json(&self.ton_connect.reconnect(&request, id).await)?,
            DappMethod::Disconnect { id } => to_json(&self.ton_connect.disconnect(&request, id).await)?,
            DappMethod::SendTransaction(message) => {
                to_json(&self.ton_connect.send_transaction(&request, message).await)?
            }
            DappMethod::SignData(message) => to_json(&self.ton_connect.sign_data(&request, message))?,
            DappMethod::Deactivate => {
                self.ton_connect.deactivate(&request);
                Value::Null
            }
            DappMethod::RequestAccounts => to_json(&self.legacy.request_accounts()?)?,
            DappMethod::RequestWallets => to_json(&self.legacy.request_wallets().await?)?,
            DappMethod::GetBalance => to_json(&self.legacy.get_balance().await?)?,
            DappMethod::LegacySendTransaction(params) => to_json(&self.legacy.send_transaction(params).await?)?,
            DappMethod::RawSign(params) => to_json(&self.legacy.raw_sign(&params.data).await?)?,
        };
        Ok(value)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Failed(e.to_string()))
}

#[async_trait]
impl RpcHandler for DappApi {
    async fn init(&self, peer: &PeerInfo, updates: UpdateSink, _args: Vec<Value>) -> Result<(), RpcError> {
        self.ctx.sites.register(peer.origin.clone(), updates.clone());

        let ctx = self.ctx.clone();
        let sink = updates.clone();
        updates.spawn_guarded("onDappSendUpdates", async move {
            let update = LegacyProvider::new(ctx).site_accounts_update()?;
            sink.send(&update);
            Ok(())
        });
        Ok(())
    }

    async fn call(&self, call: MethodCall, ctx: CallContext) -> Result<Reply, RpcError> {
        let method = DappMethod::parse(&call)?;
        debug!(peer = %ctx.peer.id, origin = ?ctx.peer.origin, method = %call.name, "Dapp call");
        let request = DappRequest::from_origin(ctx.peer.origin.clone());
        Ok(Reply::from(self.dispatch(request, method).await?))
    }

    fn on_disconnect(&self, peer: &PeerInfo) {
        self.ctx.sites.remove(&peer.id);
    }
}
