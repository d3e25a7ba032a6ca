use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::stream::FuturesOrdered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, trace, warn};

use super::envelope::{EnvelopeKind, MessageEnvelope, MethodCall, Reply};
use super::{CancelToken, LinkKind, PeerInfo, PeerLink, RpcError};

/// An API surface served to peers.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// One-time handshake per peer. The default means "no init handler".
    async fn init(&self, _peer: &PeerInfo, _updates: UpdateSink, _args: Vec<Value>) -> Result<(), RpcError> {
        Err(RpcError::NoInitHandler)
    }

    async fn call(&self, call: MethodCall, ctx: CallContext) -> Result<Reply, RpcError>;

    /// Called when a persistent link closes; drop per-peer subscribers here.
    fn on_disconnect(&self, _peer: &PeerInfo) {}
}

/// Outgoing half of a link, stamping every envelope with the server's channel.
#[derive(Clone)]
pub(crate) struct Outbox {
    channel: Option<Arc<str>>,
    tx: mpsc::UnboundedSender<MessageEnvelope>,
}

impl Outbox {
    fn new(channel: Option<&str>, tx: mpsc::UnboundedSender<MessageEnvelope>) -> Self {
        Self {
            channel: channel.map(Arc::from),
            tx,
        }
    }

    fn send(&self, envelope: MessageEnvelope) -> bool {
        self.tx
            .send(envelope.with_channel(self.channel.as_deref()))
            .is_ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Run `task` detached; a failure or panic surfaces as an `unhandledError` envelope.
    fn spawn_guarded<F>(&self, context: &'static str, task: F)
    where
        F: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let outbox = self.clone();
        tokio::spawn(async move {
            let message = match tokio::spawn(task).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(join_error) => panic_message(join_error),
            };
            error!(context, error = %message, "Unhandled error in privileged context");
            outbox.send(MessageEnvelope::unhandled_error(message));
        });
    }
}

fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return "Task was cancelled".to_string();
    }
    panic_payload_message(join_error.into_panic())
}

fn panic_payload_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Uncaught exception in privileged context".to_string()
    }
}

/// Pushes `update` envelopes to one peer.
#[derive(Clone)]
pub struct UpdateSink {
    peer_id: String,
    outbox: Outbox,
}

impl UpdateSink {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn send<T: Serialize>(&self, update: &T) -> bool {
        match serde_json::to_value(update) {
            Ok(value) => self.outbox.send(MessageEnvelope::update(value)),
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "Dropping unserializable update");
                false
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.outbox.is_closed()
    }

    pub fn spawn_guarded<F>(&self, context: &'static str, task: F)
    where
        F: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.outbox.spawn_guarded(context, task)
    }
}

/// Streams `methodCallback` envelopes for one call.
#[derive(Clone)]
pub struct ProgressSink {
    message_id: String,
    outbox: Outbox,
}

impl ProgressSink {
    pub fn emit(&self, args: Vec<Value>) -> bool {
        self.outbox
            .send(MessageEnvelope::callback(self.message_id.clone(), args, None))
    }

    /// Emit with a trailing binary buffer; the buffer is moved, not copied.
    pub fn emit_with_buffer(&self, args: Vec<Value>, buffer: Bytes) -> bool {
        self.outbox
            .send(MessageEnvelope::callback(self.message_id.clone(), args, Some(buffer)))
    }
}

/// Per-call view handed to the handler.
pub struct CallContext {
    pub peer: PeerInfo,
    progress: Option<ProgressSink>,
    cancel: CancelToken,
    outbox: Outbox,
}

impl CallContext {
    /// Present only when the caller asked for callbacks.
    pub fn progress(&self) -> Option<&ProgressSink> {
        self.progress.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn spawn_background<F>(&self, context: &'static str, task: F)
    where
        F: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.outbox.spawn_guarded(context, task)
    }
}

type PendingCalls = Arc<Mutex<HashMap<String, CancelToken>>>;

/// Resolves to the terminal envelope of one call, if the caller expects one.
type CallFuture = BoxFuture<'static, Option<MessageEnvelope>>;

pub struct RpcServer<H: RpcHandler> {
    handler: Arc<H>,
    channel: Option<String>,
    auto_init: bool,
}

impl<H: RpcHandler> RpcServer<H> {
    pub fn new(handler: Arc<H>, channel: Option<&str>) -> Self {
        Self {
            handler,
            channel: channel.map(str::to_string),
            auto_init: false,
        }
    }

    /// Run the init handshake as soon as a peer attaches instead of waiting for `init`.
    pub fn with_auto_init(mut self) -> Self {
        self.auto_init = true;
        self
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Serve one peer until its link closes.
    ///
    /// Calls from the peer are driven concurrently on this task, so a suspended call
    /// never blocks `cancelProgress`, but responses leave in the order the calls arrived.
    /// Calls still running when the link closes are driven to completion and their
    /// results dropped.
    pub async fn serve_peer(&self, link: PeerLink) {
        let PeerLink {
            info,
            mut inbound,
            outbound,
        } = link;
        let outbox = Outbox::new(self.channel.as_deref(), outbound);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let mut calls: FuturesOrdered<CallFuture> = FuturesOrdered::new();
        let mut initialized = false;

        debug!(peer = %info.id, origin = ?info.origin, channel = ?self.channel, "Peer attached");

        if self.auto_init {
            self.run_init(&info, &outbox, Vec::new()).await;
            initialized = true;
        }

        loop {
            tokio::select! {
                Some(response) = calls.next(), if !calls.is_empty() => {
                    if let Some(response) = response {
                        outbox.send(response);
                    }
                }
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    if envelope.channel != self.channel {
                        trace!(peer = %info.id, channel = ?envelope.channel, "Ignoring envelope for foreign channel");
                        continue;
                    }

                    match envelope.kind {
                        EnvelopeKind::Init => {
                            self.run_init(&info, &outbox, envelope.args.unwrap_or_default()).await;
                            initialized = true;
                        }
                        EnvelopeKind::CallMethod => {
                            if !initialized {
                                warn!(peer = %info.id, method = ?envelope.name, "Call before init");
                                let refusal = envelope
                                    .message_id
                                    .map(|id| MessageEnvelope::error_response(id, RpcError::NotInitialized.to_string()));
                                calls.push_back(Box::pin(future::ready(refusal)));
                                continue;
                            }
                            calls.push_back(self.start_call(&info, &outbox, &pending, envelope));
                        }
                        EnvelopeKind::CancelProgress => {
                            let Some(id) = envelope.message_id else { continue };
                            let token = pending.lock().ok().and_then(|calls| calls.get(&id).cloned());
                            match token {
                                Some(token) => {
                                    debug!(peer = %info.id, message_id = %id, "Progress cancelled");
                                    token.cancel();
                                }
                                None => trace!(peer = %info.id, message_id = %id, "Cancel for unknown call"),
                            }
                        }
                        other => {
                            debug!(peer = %info.id, kind = ?other, "Ignoring envelope addressed to a peer");
                        }
                    }
                }
            }
        }

        if info.kind == LinkKind::Persistent {
            self.handler.on_disconnect(&info);
        }
        if !calls.is_empty() {
            debug!(peer = %info.id, in_flight = calls.len(), "Peer left with calls in flight");
            tokio::spawn(async move { while calls.next().await.is_some() {} });
        }
        info!(peer = %info.id, origin = ?info.origin, "Peer detached");
    }

    async fn run_init(&self, info: &PeerInfo, outbox: &Outbox, args: Vec<Value>) {
        let updates = UpdateSink {
            peer_id: info.id.clone(),
            outbox: outbox.clone(),
        };
        match self.handler.init(info, updates, args).await {
            Ok(()) => debug!(peer = %info.id, "Peer initialized"),
            Err(RpcError::NoInitHandler) => warn!(peer = %info.id, "API has no init handler"),
            Err(e) => warn!(peer = %info.id, error = %e, "Peer init failed"),
        }
    }

    fn start_call(&self, info: &PeerInfo, outbox: &Outbox, pending: &PendingCalls, envelope: MessageEnvelope) -> CallFuture {
        let message_id = envelope.message_id;
        let Some(name) = envelope.name else {
            warn!(peer = %info.id, "callMethod without a method name");
            let refusal = message_id.map(|id| MessageEnvelope::error_response(id, "Missing method name"));
            return Box::pin(future::ready(refusal));
        };

        let cancel = CancelToken::new();
        let progress = match (&message_id, envelope.with_callback) {
            (Some(id), true) => {
                if let Ok(mut calls) = pending.lock() {
                    calls.insert(id.clone(), cancel.clone());
                }
                Some(ProgressSink {
                    message_id: id.clone(),
                    outbox: outbox.clone(),
                })
            }
            _ => None,
        };

        let call = MethodCall::new(name, envelope.args.unwrap_or_default());
        let ctx = CallContext {
            peer: info.clone(),
            progress,
            cancel,
            outbox: outbox.clone(),
        };
        let handler = self.handler.clone();
        let outbox = outbox.clone();
        let pending = pending.clone();

        Box::pin(async move {
            let method = call.name.clone();
            let outcome = match AssertUnwindSafe(handler.call(call, ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_payload_message(payload);
                    error!(method = %method, error = %message, "Handler crashed");
                    outbox.send(MessageEnvelope::unhandled_error(message.clone()));
                    Err(RpcError::Failed(message))
                }
            };

            let Some(id) = message_id else {
                if let Err(e) = outcome {
                    warn!(context = "onMessage:callMethod", method = %method, error = %e, "Notification failed");
                }
                return None;
            };

            if let Ok(mut calls) = pending.lock() {
                calls.remove(&id);
            }
            Some(match outcome {
                Ok(reply) => MessageEnvelope::response(id, reply.value, reply.transfer),
                Err(e) => {
                    warn!(context = "onMessage:callMethod", method = %method, error = %e, "Call failed");
                    MessageEnvelope::error_response(id, e.to_string())
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{pair, PeerEnd};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct EchoApi {
        disconnects: AtomicUsize,
        inits: AtomicUsize,
    }

    #[async_trait]
    impl RpcHandler for EchoApi {
        async fn init(&self, _peer: &PeerInfo, updates: UpdateSink, args: Vec<Value>) -> Result<(), RpcError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            updates.send(&json!({ "type": "hello", "args": args }));
            Ok(())
        }

        async fn call(&self, call: MethodCall, ctx: CallContext) -> Result<Reply, RpcError> {
            match call.name.as_str() {
                "echo" => Ok(Reply::from(json!(call.arg::<String>(0)?))),
                "count" => {
                    let n: u64 = call.arg(0)?;
                    if let Some(progress) = ctx.progress() {
                        for i in 0..n {
                            progress.emit(vec![json!(i)]);
                        }
                    }
                    Ok(Reply::from(json!(n)))
                }
                "blob" => {
                    let buffer = Bytes::from_static(b"\x00\x01\x02");
                    if let Some(progress) = ctx.progress() {
                        progress.emit_with_buffer(vec![json!("chunk")], buffer.clone());
                    }
                    Ok(Reply::from(json!("done")).with_transfer(buffer))
                }
                "delay" => {
                    let millis: u64 = call.arg(0)?;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(Reply::from(json!(millis)))
                }
                "until_cancelled" => {
                    while !ctx.is_cancelled() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(Reply::from(json!("stopped")))
                }
                "fail" => Err(RpcError::Failed("boom".to_string())),
                "panic" => panic!("handler exploded"),
                other => Err(RpcError::MethodNotFound(other.to_string())),
            }
        }

        fn on_disconnect(&self, _peer: &PeerInfo) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoInitApi;

    #[async_trait]
    impl RpcHandler for NoInitApi {
        async fn call(&self, _call: MethodCall, _ctx: CallContext) -> Result<Reply, RpcError> {
            Ok(Reply::from(json!("ok")))
        }
    }

    fn spawn_server<H: RpcHandler>(handler: Arc<H>, channel: Option<&str>, kind: LinkKind) -> PeerEnd {
        let (link, end) = pair(PeerInfo::new(Some("https://app.example".into()), kind));
        let server = RpcServer::new(handler, channel);
        tokio::spawn(async move { server.serve_peer(link).await });
        end
    }

    async fn next(end: &mut PeerEnd) -> MessageEnvelope {
        tokio::time::timeout(Duration::from_secs(2), end.receiver.recv())
            .await
            .expect("timed out")
            .expect("link closed")
    }

    fn call(id: &str, name: &str, args: Vec<Value>, with_callback: bool) -> MessageEnvelope {
        MessageEnvelope::call_method(Some(id.to_string()), name, args, with_callback).with_channel(Some("api"))
    }

    #[tokio::test]
    async fn test_callbacks_then_single_response() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        assert_eq!(next(&mut end).await.kind, EnvelopeKind::Update);

        end.sender.send(call("1", "count", vec![json!(3)], true)).unwrap();
        for i in 0..3 {
            let env = next(&mut end).await;
            assert_eq!(env.kind, EnvelopeKind::MethodCallback);
            assert_eq!(env.message_id.as_deref(), Some("1"));
            assert_eq!(env.callback_args, Some(vec![json!(i)]));
            assert_eq!(env.channel.as_deref(), Some("api"));
        }
        let response = next(&mut end).await;
        assert_eq!(response.kind, EnvelopeKind::MethodResponse);
        assert_eq!(response.response, Some(json!(3)));

        // Nothing else queued for this id
        assert!(tokio::time::timeout(Duration::from_millis(50), end.receiver.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_no_callbacks_without_flag() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        end.sender.send(call("2", "count", vec![json!(5)], false)).unwrap();
        let response = next(&mut end).await;
        assert_eq!(response.kind, EnvelopeKind::MethodResponse);
        assert_eq!(response.response, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_binary_buffer_travels_with_envelope() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        end.sender.send(call("b", "blob", vec![], true)).unwrap();
        let callback = next(&mut end).await;
        assert_eq!(callback.transfer.as_deref(), Some(&b"\x00\x01\x02"[..]));
        let response = next(&mut end).await;
        assert_eq!(response.transfer.as_deref(), Some(&b"\x00\x01\x02"[..]));
    }

    #[tokio::test]
    async fn test_errors_are_reported_once() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        end.sender.send(call("e", "fail", vec![], false)).unwrap();
        let response = next(&mut end).await;
        assert_eq!(response.kind, EnvelopeKind::MethodResponse);
        assert_eq!(response.error.unwrap().message, "boom");

        end.sender.send(call("m", "nope", vec![], false)).unwrap();
        let response = next(&mut end).await;
        assert_eq!(response.error.unwrap().message, "Method not found: nope");
    }

    #[tokio::test]
    async fn test_panic_becomes_unhandled_error_and_response() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        end.sender.send(call("p", "panic", vec![], false)).unwrap();
        let unhandled = next(&mut end).await;
        assert_eq!(unhandled.kind, EnvelopeKind::UnhandledError);
        assert_eq!(unhandled.error.unwrap().message, "handler exploded");
        let response = next(&mut end).await;
        assert_eq!(response.kind, EnvelopeKind::MethodResponse);
        assert_eq!(response.message_id.as_deref(), Some("p"));

        // The server is still alive
        end.sender.send(call("q", "echo", vec![json!("hi")], false)).unwrap();
        assert_eq!(next(&mut end).await.response, Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_call_before_init_is_refused() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(call("1", "echo", vec![json!("x")], false)).unwrap();
        let response = next(&mut end).await;
        assert_eq!(response.error.unwrap().message, "Peer is not initialized");
    }

    #[tokio::test]
    async fn test_missing_init_handler_still_initializes() {
        let mut end = spawn_server(Arc::new(NoInitApi), None, LinkKind::Ephemeral);
        end.sender.send(MessageEnvelope::init(vec![])).unwrap();
        end.sender
            .send(MessageEnvelope::call_method(Some("1".into()), "anything", vec![], false))
            .unwrap();
        assert_eq!(next(&mut end).await.response, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_foreign_channel_is_ignored() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("other"))).unwrap();
        end.sender
            .send(MessageEnvelope::call_method(Some("1".into()), "echo", vec![json!("x")], false).with_channel(Some("other")))
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), end.receiver.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_runs_cleanup_for_persistent_links_only() {
        let api = Arc::new(EchoApi::default());

        let (link, end) = pair(PeerInfo::new(None, LinkKind::Persistent));
        let server = RpcServer::new(api.clone(), None).with_auto_init();
        drop(end);
        server.serve_peer(link).await;
        assert_eq!(api.inits.load(Ordering::SeqCst), 1);
        assert_eq!(api.disconnects.load(Ordering::SeqCst), 1);

        let (link, end) = pair(PeerInfo::new(None, LinkKind::Ephemeral));
        drop(end);
        server.serve_peer(link).await;
        assert_eq!(api.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_call_answers_before_later_fast_call() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        end.sender.send(call("slow", "delay", vec![json!(100)], false)).unwrap();
        end.sender.send(call("fast", "echo", vec![json!("x")], false)).unwrap();
        assert_eq!(next(&mut end).await.message_id.as_deref(), Some("slow"));
        assert_eq!(next(&mut end).await.message_id.as_deref(), Some("fast"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_responses_keep_request_order() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        for i in 0..2000u32 {
            let (name, arg) = if i % 7 == 0 {
                ("delay", json!(u64::from(i % 3)))
            } else {
                ("echo", json!(i.to_string()))
            };
            end.sender.send(call(&i.to_string(), name, vec![arg], false)).unwrap();
        }

        for i in 0..2000u32 {
            let response = next(&mut end).await;
            assert_eq!(response.kind, EnvelopeKind::MethodResponse);
            assert_eq!(response.message_id, Some(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_suspended_call() {
        let mut end = spawn_server(Arc::new(EchoApi::default()), Some("api"), LinkKind::Persistent);
        end.sender.send(MessageEnvelope::init(vec![]).with_channel(Some("api"))).unwrap();
        next(&mut end).await;

        end.sender.send(call("w", "until_cancelled", vec![], true)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        end.sender
            .send(MessageEnvelope::cancel_progress("w".into()).with_channel(Some("api")))
            .unwrap();

        let response = next(&mut end).await;
        assert_eq!(response.message_id.as_deref(), Some("w"));
        assert_eq!(response.response, Some(json!("stopped")));
    }
}
