//! WebSocket carrier
//!
//! Each socket becomes one persistent peer link. Envelopes travel as JSON text
//! frames; a binary buffer attached to an envelope rides along base64-encoded in
//! a `transfer` field.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::envelope::MessageEnvelope;
use super::server::{RpcHandler, RpcServer};
use super::{pair, LinkKind, PeerEnd, PeerInfo};

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed transfer buffer: {0}")]
    Transfer(#[from] base64::DecodeError),
    #[error("Binary frame is not UTF-8")]
    NotUtf8,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    #[serde(flatten)]
    envelope: MessageEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transfer: Option<String>,
}

pub fn encode_frame(envelope: MessageEnvelope) -> Result<String, FrameError> {
    let transfer = envelope.transfer.as_ref().map(|buffer| BASE64.encode(buffer));
    Ok(serde_json::to_string(&WireFrame { envelope, transfer })?)
}

pub fn decode_frame(text: &str) -> Result<MessageEnvelope, FrameError> {
    let frame: WireFrame = serde_json::from_str(text)?;
    let mut envelope = frame.envelope;
    if let Some(encoded) = frame.transfer {
        envelope.transfer = Some(Bytes::from(BASE64.decode(encoded)?));
    }
    Ok(envelope)
}

/// Who may attach to `/popup`.
#[derive(Debug, Clone, Default)]
pub struct PopupAccess {
    /// Browser origins that must match exactly
    pub origins: Vec<String>,
    /// Let through clients that send no `Origin` at all. Off unless configured.
    pub allow_originless: bool,
}

impl PopupAccess {
    fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => self.allow_originless,
            Some(origin) => self.origins.iter().any(|candidate| candidate == origin),
        }
    }
}

fn origin_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && *value != "null")
        .map(str::to_string)
}

struct WsState<D: RpcHandler, P: RpcHandler> {
    dapp: Arc<RpcServer<D>>,
    popup: Arc<RpcServer<P>>,
    popup_access: Arc<PopupAccess>,
}

impl<D: RpcHandler, P: RpcHandler> Clone for WsState<D, P> {
    fn clone(&self) -> Self {
        Self {
            dapp: self.dapp.clone(),
            popup: self.popup.clone(),
            popup_access: self.popup_access.clone(),
        }
    }
}

/// `/dapp` for third-party sites, `/popup` for the privileged wallet UI.
pub fn router<D: RpcHandler, P: RpcHandler>(
    dapp: Arc<RpcServer<D>>,
    popup: Arc<RpcServer<P>>,
    popup_access: PopupAccess,
) -> Router {
    let state = WsState {
        dapp,
        popup,
        popup_access: Arc::new(popup_access),
    };
    Router::new()
        .route("/dapp", get(dapp_socket::<D, P>))
        .route("/popup", get(popup_socket::<D, P>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn dapp_socket<D: RpcHandler, P: RpcHandler>(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<WsState<D, P>>,
) -> Response {
    let origin = origin_header(&headers);
    let server = state.dapp.clone();
    ws.on_upgrade(move |socket| run_socket(socket, server, origin))
}

/// The origin gate runs before the upgrade is validated.
async fn popup_socket<D: RpcHandler, P: RpcHandler>(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    State(state): State<WsState<D, P>>,
) -> Response {
    let origin = origin_header(&headers);
    if !state.popup_access.allows(origin.as_deref()) {
        warn!(origin = ?origin, "Rejecting privileged UI connection");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    let server = state.popup.clone();
    ws.on_upgrade(move |socket| run_socket(socket, server, origin))
}

/// Pump one socket through `server` until either side closes.
pub async fn run_socket<H: RpcHandler>(socket: WebSocket, server: Arc<RpcServer<H>>, origin: Option<String>) {
    let info = PeerInfo::new(origin, LinkKind::Persistent);
    let peer_id = info.id.clone();
    info!(peer = %peer_id, origin = ?info.origin, "WebSocket peer connected");

    let (link, end) = pair(info);
    let PeerEnd { sender, mut receiver } = end;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            let text = match encode_frame(envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %writer_peer, error = %e, "Dropping unencodable envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let reader_peer = peer_id.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(peer = %reader_peer, error = %FrameError::NotUtf8, "Dropping frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(peer = %reader_peer, error = %e, "WebSocket read failed");
                    break;
                }
            };
            match decode_frame(&text) {
                Ok(envelope) => {
                    if sender.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(peer = %reader_peer, error = %e, "Dropping malformed frame"),
            }
        }
    });

    server.serve_peer(link).await;
    let _ = reader.await;
    info!(peer = %peer_id, "WebSocket peer disconnected");
}
