//! Cross-context RPC transport
//!
//! The privileged context exposes an API surface ([`RpcHandler`]) to peers over a
//! message link. Each link carries [`MessageEnvelope`]s; envelopes are tagged with a
//! channel so several API surfaces can share one physical connection.
//!
//! ```text
//!   peer (RpcClient)                         privileged (RpcServer)
//!   init ─────────────────────────────────▶  handler.init(updates)
//!   callMethod{id, withCallback} ─────────▶  handler.call(call, ctx)
//!   ◀──────────────── methodCallback{id}      ctx.progress().emit(..)
//!   cancelProgress{id} ───────────────────▶  ctx.is_cancelled() == true
//!   ◀──────────────── methodResponse{id}      exactly once per id
//!   ◀──────────────── update / unhandledError
//! ```

pub mod cancel;
pub mod client;
pub mod envelope;
pub mod server;
pub mod ws;

pub use cancel::CancelToken;
pub use client::{CallHandle, ClientError, ClientEvent, Progress, RpcClient};
pub use envelope::{EnvelopeKind, ErrorSummary, MessageEnvelope, MethodCall, Reply};
pub use server::{CallContext, ProgressSink, RpcHandler, RpcServer, UpdateSink};

use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("API has no init handler")]
    NoInitHandler,
    #[error("Peer is not initialized")]
    NotInitialized,
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
}

/// How the carrier behaves once established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Long-lived connection with a disconnect event (extension port, WebSocket).
    Persistent,
    /// Fire-and-forget channel without a disconnect notion (worker style).
    Ephemeral,
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: String,
    /// Origin vouched for by the carrier, never by the peer itself.
    pub origin: Option<String>,
    pub kind: LinkKind,
}

impl PeerInfo {
    pub fn new(origin: Option<String>, kind: LinkKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin,
            kind,
        }
    }
}

/// Privileged end of a link.
pub struct PeerLink {
    pub info: PeerInfo,
    pub inbound: mpsc::UnboundedReceiver<MessageEnvelope>,
    pub outbound: mpsc::UnboundedSender<MessageEnvelope>,
}

/// Peer end of a link. Dropping `sender` closes the link from the peer side.
pub struct PeerEnd {
    pub sender: mpsc::UnboundedSender<MessageEnvelope>,
    pub receiver: mpsc::UnboundedReceiver<MessageEnvelope>,
}

/// In-process link: both directions are FIFO channels.
pub fn pair(info: PeerInfo) -> (PeerLink, PeerEnd) {
    let (to_server, inbound) = mpsc::unbounded_channel();
    let (outbound, from_server) = mpsc::unbounded_channel();
    (
        PeerLink {
            info,
            inbound,
            outbound,
        },
        PeerEnd {
            sender: to_server,
            receiver: from_server,
        },
    )
}
