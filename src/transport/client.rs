use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::envelope::{EnvelopeKind, MessageEnvelope, Reply};
use super::PeerEnd;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("{0}")]
    Remote(String),
    #[error("Link closed")]
    Disconnected,
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Envelopes the privileged side pushes without a request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Update(Value),
    UnhandledError(String),
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub args: Vec<Value>,
    pub transfer: Option<Bytes>,
}

struct PendingCall {
    response: oneshot::Sender<Result<Reply, ClientError>>,
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

type Pending = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Peer-side view of a link.
#[derive(Clone)]
pub struct RpcClient {
    channel: Option<String>,
    tx: mpsc::UnboundedSender<MessageEnvelope>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Attach to a link; returns the client and its stream of pushed events.
    pub fn connect(end: PeerEnd, channel: Option<&str>) -> (Self, UnboundedReceiverStream<ClientEvent>) {
        let PeerEnd { sender, mut receiver } = end;
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = channel.map(str::to_string);

        let dispatch_pending = pending.clone();
        let dispatch_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if envelope.channel != dispatch_channel {
                    continue;
                }
                dispatch(&dispatch_pending, &events_tx, envelope);
            }
            debug!(channel = ?dispatch_channel, "Link closed; failing outstanding calls");
            if let Ok(mut calls) = dispatch_pending.lock() {
                for (_, call) in calls.drain() {
                    let _ = call.response.send(Err(ClientError::Disconnected));
                }
            }
        });

        let client = Self {
            channel,
            tx: sender,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (client, UnboundedReceiverStream::new(events_rx))
    }

    fn send(&self, envelope: MessageEnvelope) -> Result<(), ClientError> {
        self.tx
            .send(envelope.with_channel(self.channel.as_deref()))
            .map_err(|_| ClientError::Disconnected)
    }

    pub fn init(&self, args: Vec<Value>) -> Result<(), ClientError> {
        self.send(MessageEnvelope::init(args))
    }

    /// Call without expecting any answer.
    pub fn notify(&self, name: &str, args: Vec<Value>) -> Result<(), ClientError> {
        self.send(MessageEnvelope::call_method(None, name, args, false))
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ClientError> {
        let (message_id, response) = self.register(None);
        self.send_registered(&message_id, MessageEnvelope::call_method(Some(message_id.clone()), name, args, false))?;
        Ok(await_reply(response).await?.value)
    }

    pub fn call_with_progress(&self, name: &str, args: Vec<Value>) -> Result<CallHandle, ClientError> {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (message_id, response) = self.register(Some(progress_tx));
        self.send_registered(&message_id, MessageEnvelope::call_method(Some(message_id.clone()), name, args, true))?;
        Ok(CallHandle {
            message_id,
            progress: UnboundedReceiverStream::new(progress_rx),
            response,
            client: self.clone(),
        })
    }

    /// Send a call whose pending entry is already in place; the entry is dropped if the link is gone.
    fn send_registered(&self, message_id: &str, envelope: MessageEnvelope) -> Result<(), ClientError> {
        let sent = self.send(envelope);
        if sent.is_err() {
            if let Ok(mut calls) = self.pending.lock() {
                calls.remove(message_id);
            }
        }
        sent
    }

    fn register(
        &self,
        progress: Option<mpsc::UnboundedSender<Progress>>,
    ) -> (String, oneshot::Receiver<Result<Reply, ClientError>>) {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (response_tx, response_rx) = oneshot::channel();
        if let Ok(mut calls) = self.pending.lock() {
            calls.insert(
                message_id.clone(),
                PendingCall {
                    response: response_tx,
                    progress,
                },
            );
        }
        (message_id, response_rx)
    }
}

fn dispatch(pending: &Pending, events: &mpsc::UnboundedSender<ClientEvent>, envelope: MessageEnvelope) {
    match envelope.kind {
        EnvelopeKind::MethodResponse => {
            let Some(id) = envelope.message_id else { return };
            let call = pending.lock().ok().and_then(|mut calls| calls.remove(&id));
            let Some(call) = call else {
                trace!(message_id = %id, "Response for unknown call");
                return;
            };
            let outcome = match envelope.error {
                Some(error) => Err(ClientError::Remote(error.message)),
                None => Ok(Reply {
                    value: envelope.response.unwrap_or(Value::Null),
                    transfer: envelope.transfer,
                }),
            };
            let _ = call.response.send(outcome);
        }
        EnvelopeKind::MethodCallback => {
            let Some(id) = envelope.message_id else { return };
            if let Ok(calls) = pending.lock() {
                if let Some(progress) = calls.get(&id).and_then(|call| call.progress.as_ref()) {
                    let _ = progress.send(Progress {
                        args: envelope.callback_args.unwrap_or_default(),
                        transfer: envelope.transfer,
                    });
                }
            }
        }
        EnvelopeKind::Update => {
            let _ = events.send(ClientEvent::Update(envelope.update.unwrap_or(Value::Null)));
        }
        EnvelopeKind::UnhandledError => {
            let message = envelope.error.map(|e| e.message).unwrap_or_default();
            let _ = events.send(ClientEvent::UnhandledError(message));
        }
        other => trace!(kind = ?other, "Ignoring envelope addressed to the privileged side"),
    }
}

async fn await_reply(response: oneshot::Receiver<Result<Reply, ClientError>>) -> Result<Reply, ClientError> {
    response.await.map_err(|_| ClientError::Disconnected)?
}

/// A streaming call in flight. The progress stream ends once the final response arrives.
pub struct CallHandle {
    message_id: String,
    progress: UnboundedReceiverStream<Progress>,
    response: oneshot::Receiver<Result<Reply, ClientError>>,
    client: RpcClient,
}

impl CallHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn progress(&mut self) -> &mut UnboundedReceiverStream<Progress> {
        &mut self.progress
    }

    /// Ask the privileged side to stop; it takes effect at the handler's next check.
    pub fn cancel(&self) -> Result<(), ClientError> {
        self.client
            .send(MessageEnvelope::cancel_progress(self.message_id.clone()))
    }

    pub async fn reply(self) -> Result<Reply, ClientError> {
        await_reply(self.response).await
    }

    pub async fn result(self) -> Result<Value, ClientError> {
        Ok(self.reply().await?.value)
    }
}
