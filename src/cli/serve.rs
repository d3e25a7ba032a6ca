use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::api::{DappApi, PopupApi};
use crate::client::RpcLedger;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::session::{HttpManifestFetcher, PopupBridge, WalletContext};
use crate::storage::{SledStorage, Storage};
use crate::transport::{ws, RpcServer};

pub async fn run(config: BridgeConfig) -> Result<(), BridgeError> {
    let storage: Arc<dyn Storage> = Arc::new(SledStorage::open(&config.storage.db_path)?);
    let ledger = Arc::new(RpcLedger::new(
        config.ledger.rpc_url.clone(),
        Duration::from_secs(config.ledger.timeout_secs),
        storage.clone(),
    )?);
    let manifests = Arc::new(
        HttpManifestFetcher::new(Duration::from_secs(config.manifest.timeout_secs))
            .map_err(|e| BridgeError::Config(e.to_string()))?,
    );
    let bridge = Arc::new(PopupBridge::new());
    let ctx = WalletContext::new(storage, ledger, manifests, bridge.clone());

    let dapp = Arc::new(RpcServer::new(
        Arc::new(DappApi::new(ctx.clone())),
        Some(config.server.dapp_channel.as_str()),
    ));
    let popup = Arc::new(RpcServer::new(
        Arc::new(PopupApi::new(ctx, bridge)),
        Some(config.server.popup_channel.as_str()),
    ));
    let access = ws::PopupAccess {
        origins: config.server.popup_origins.clone(),
        allow_originless: config.server.allow_originless_popup,
    };
    let app = ws::router(dapp, popup, access);

    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    info!(
        bind_addr = %config.server.bind_addr,
        ledger = %config.ledger.rpc_url,
        "Bridge listening on /dapp and /popup"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
