//! Endpoint - 1 つのチャネル端の dispatcher
//!
//! # 受信時のルーティング順
//! 1. stream 制御（`stream` あり）→ 対応する sink / controller へ
//! 2. 呼び出しの返信（`isReply`）→ PendingCall を解決して捨てる
//! 3. 束縛済みの `action` → handler を別タスクで起動
//! 4. それ以外 → プロトコル違反。ログに残し、endpoint ごと落とす
//!
//! # 所有権
//! PendingCall / StreamSink / StreamController はこの endpoint だけが持つ。
//! read loop は 1 本で、`Transport::recv` を呼ぶのはここだけ。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, warn};

use super::builder::Dispatcher;
use super::lock;
use super::stream::{
    ControllerShared, Link, QueueingStrategy, SinkShared, StreamReader, StreamSink, StreamTable,
};
use crate::config::StreamPolicy;
use crate::domain::{CallId, Envelope, RemoteError, StreamId, StreamKind};
use crate::error::BobbinError;
use crate::observability::{EndpointCounters, EndpointCounts};
use crate::ports::Transport;
use crate::typed::{Action, ActionRegistry, Binding, DynHandler, DynStreamHandler, StreamAction, codec};

type ReplySender = oneshot::Sender<Result<Value, RemoteError>>;

#[derive(Default)]
struct CallTable {
    pending: HashMap<CallId, ReplySender>,
    destroyed: bool,
}

struct EndpointInner {
    link: Link,
    registry: ActionRegistry,
    policy: StreamPolicy,
    streams: Arc<StreamTable>,
    calls: Mutex<CallTable>,
    next_call_id: AtomicU64,
    next_stream_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    fatal: Mutex<Option<String>>,
}

/// Endpoint は host か worker のどちらか一方の端
///
/// clone しても同じ endpoint を指す。使い終わったら `destroy()` を呼ぶこと
/// （呼ばなくても相手が閉じれば read loop は終わる）。
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn spawn(dispatcher: Dispatcher, transport: Arc<dyn Transport>) -> Self {
        let Dispatcher {
            name,
            peer,
            registry,
            policy,
        } = dispatcher;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(EndpointInner {
            link: Link {
                source: Arc::from(name),
                target: Arc::from(peer),
                transport,
                counters: Arc::new(EndpointCounters::default()),
            },
            registry,
            policy,
            streams: Arc::new(StreamTable::default()),
            calls: Mutex::new(CallTable::default()),
            next_call_id: AtomicU64::new(1),
            next_stream_id: AtomicU64::new(1),
            shutdown_tx,
            fatal: Mutex::new(None),
        });
        debug!(endpoint = %inner.link.source, peer = %inner.link.target, "endpoint connected");
        tokio::spawn(read_loop(Arc::clone(&inner), shutdown_rx));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.link.source
    }

    pub fn peer(&self) -> &str {
        &self.inner.link.target
    }

    pub fn stream_policy(&self) -> &StreamPolicy {
        &self.inner.policy
    }

    /// Fire-and-forget. 失敗するのは transport が壊れているときだけ。
    pub fn notify(&self, action: &str, data: Value) -> Result<(), BobbinError> {
        if self.is_destroyed() {
            return Err(RemoteError::abort("endpoint is destroyed").into());
        }
        let link = &self.inner.link;
        link.post(&Envelope::notification(&link.source, &link.target, action, data))?;
        EndpointCounters::bump(&link.counters.notifications_sent);
        Ok(())
    }

    /// Request/response call.
    ///
    /// 返り値の `CallHandle` は返信が来たら完了する future。送信が同期的に失敗した場合は
    /// 送らずにその場で失敗した handle を返す。
    pub fn call(&self, action: &str, data: Value) -> CallHandle {
        let inner = &self.inner;
        let call_id = CallId::new(inner.next_call_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        {
            let mut calls = lock(&inner.calls);
            if calls.destroyed {
                return CallHandle::failed(RemoteError::abort("endpoint is destroyed").into());
            }
            calls.pending.insert(call_id, tx);
        }

        let link = &inner.link;
        let envelope = Envelope::call(&link.source, &link.target, action, call_id, data);
        if let Err(err) = link.post(&envelope) {
            lock(&inner.calls).pending.remove(&call_id);
            return CallHandle::failed(err.into());
        }
        EndpointCounters::bump(&link.counters.calls_sent);
        debug!(endpoint = %link.source, %call_id, action, "call sent");
        CallHandle {
            call_id: Some(call_id),
            state: CallState::Waiting(rx),
        }
    }

    /// Open a stream: registers the controller and sends the initial credit.
    pub fn stream(
        &self,
        action: &str,
        data: Value,
        strategy: QueueingStrategy,
    ) -> Result<StreamReader<Value>, BobbinError> {
        let inner = &self.inner;
        let link = &inner.link;
        let stream_id = StreamId::new(inner.next_stream_id.fetch_add(1, Ordering::Relaxed));
        let controller = ControllerShared::new(
            stream_id,
            link.clone(),
            strategy,
            Arc::downgrade(&inner.streams),
        );
        {
            // teardown と競合しないよう CallTable の lock を持ったまま登録する
            let calls = lock(&inner.calls);
            if calls.destroyed {
                return Err(RemoteError::abort("endpoint is destroyed").into());
            }
            lock(&inner.streams.controllers).insert(stream_id, Arc::clone(&controller));
        }

        let envelope = Envelope::open_stream(
            &link.source,
            &link.target,
            action,
            stream_id,
            data,
            strategy.high_water_mark,
        );
        if let Err(err) = link.post(&envelope) {
            lock(&inner.streams.controllers).remove(&stream_id);
            return Err(err.into());
        }
        EndpointCounters::bump(&link.counters.streams_opened);
        debug!(endpoint = %link.source, %stream_id, action, "stream opened");
        Ok(StreamReader::from_shared(controller))
    }

    pub fn notify_typed<A: Action>(&self, request: &A) -> Result<(), BobbinError> {
        self.notify(A::NAME, codec::encode(request)?)
    }

    pub async fn call_typed<A: Action>(&self, request: &A) -> Result<A::Response, BobbinError> {
        let value = self.call(A::NAME, codec::encode(request)?).await?;
        Ok(codec::decode_remote(value)?)
    }

    pub fn stream_typed<A: StreamAction>(
        &self,
        request: &A,
        strategy: QueueingStrategy,
    ) -> Result<StreamReader<A::Chunk>, BobbinError> {
        let reader = self.stream(A::NAME, codec::encode(request)?, strategy)?;
        Ok(StreamReader::from_shared(reader.into_shared()))
    }

    pub fn counts(&self) -> EndpointCounts {
        self.inner.link.counters.snapshot()
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.calls).pending.len()
    }

    /// (live sinks, live controllers)
    pub fn live_streams(&self) -> (usize, usize) {
        self.inner.streams.live_streams()
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.inner.calls).destroyed
    }

    /// プロトコル違反で落ちた場合、その理由
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.inner.fatal).clone()
    }

    /// 未解決の呼び出しを全部 `Abort` で失敗させ、stream を終わらせ、transport を閉じる
    pub fn destroy(&self) {
        self.inner.teardown(None);
    }
}

impl EndpointInner {
    fn teardown(&self, fatal: Option<String>) {
        if let Some(message) = fatal {
            lock(&self.fatal).get_or_insert(message);
        }
        let pending: Vec<ReplySender> = {
            let mut calls = lock(&self.calls);
            if calls.destroyed {
                return;
            }
            calls.destroyed = true;
            calls.pending.drain().map(|(_, tx)| tx).collect()
        };

        let reason = RemoteError::abort("endpoint disconnected");
        debug!(endpoint = %self.link.source, pending = pending.len(), "endpoint teardown");
        for tx in pending {
            let _ = tx.send(Err(reason.clone()));
        }
        self.streams.abandon_all(&reason);
        let _ = self.shutdown_tx.send(true);
        self.link.transport.close();
    }

    /// 1 envelope をルーティングする。`Err` はプロトコル違反。
    fn route_inbound(self: &Arc<Self>, envelope: Envelope) -> Result<(), BobbinError> {
        if envelope.target_id.as_str() != &*self.link.source {
            debug!(
                endpoint = %self.link.source,
                target = %envelope.target_id,
                "envelope for another endpoint ignored"
            );
            EndpointCounters::bump(&self.link.counters.ignored_envelopes);
            return Ok(());
        }

        if let Some(kind) = envelope.stream {
            let stream_id = envelope
                .stream_id
                .ok_or_else(|| BobbinError::Protocol(format!("stream message {kind:?} without streamId")))?;
            self.route_stream(kind, stream_id, &envelope);
            return Ok(());
        }

        if envelope.is_reply() {
            let call_id = envelope
                .call_id
                .ok_or_else(|| BobbinError::Protocol("reply without callId".to_string()))?;
            self.resolve_call(call_id, envelope);
            return Ok(());
        }

        if let Some(action) = envelope.action.clone() {
            let binding = self
                .registry
                .get(&action)
                .cloned()
                .ok_or_else(|| BobbinError::UnknownAction(action.clone()))?;
            return self.invoke(&action, binding, envelope);
        }

        Err(BobbinError::Protocol(
            "envelope carries neither action, reply nor stream".to_string(),
        ))
    }

    fn route_stream(&self, kind: StreamKind, stream_id: StreamId, envelope: &Envelope) {
        if kind.is_for_sink() {
            match self.streams.sink(stream_id) {
                Some(sink) if kind == StreamKind::Pull => {
                    sink.handle_pull(envelope.desired_size.unwrap_or(0.0));
                }
                Some(sink) => sink.handle_cancel(
                    envelope
                        .remote_error()
                        .unwrap_or_else(|| RemoteError::abort("stream cancelled")),
                ),
                None => {
                    // close と行き違った pull / cancel: 成功として応答しておく
                    let answer = if kind == StreamKind::Pull {
                        StreamKind::PullComplete
                    } else {
                        StreamKind::CancelComplete
                    };
                    debug!(endpoint = %self.link.source, %stream_id, ?kind, "request for retired sink");
                    let reply = Envelope::stream_result(
                        &self.link.source,
                        &self.link.target,
                        answer,
                        stream_id,
                        Ok(()),
                    );
                    if let Err(err) = self.link.post(&reply) {
                        warn!(endpoint = %self.link.source, error = %err, "failed to answer retired stream");
                    }
                }
            }
            return;
        }

        match self.streams.controller(stream_id) {
            Some(controller) => controller.handle(envelope, kind),
            None => {
                debug!(endpoint = %self.link.source, %stream_id, ?kind, "message for retired stream ignored");
                EndpointCounters::bump(&self.link.counters.ignored_envelopes);
            }
        }
    }

    fn resolve_call(&self, call_id: CallId, envelope: Envelope) {
        EndpointCounters::bump(&self.link.counters.replies_received);
        let Some(tx) = lock(&self.calls).pending.remove(&call_id) else {
            warn!(endpoint = %self.link.source, %call_id, "reply for unknown call ignored");
            EndpointCounters::bump(&self.link.counters.ignored_envelopes);
            return;
        };
        let result = match envelope.remote_error() {
            Some(err) => Err(err),
            None => Ok(envelope.data.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
    }

    fn invoke(self: &Arc<Self>, action: &str, binding: Binding, envelope: Envelope) -> Result<(), BobbinError> {
        EndpointCounters::bump(&self.link.counters.handlers_invoked);
        let data = envelope.data.unwrap_or(Value::Null);
        match (binding, envelope.stream_id, envelope.call_id) {
            (Binding::Stream(handler), Some(stream_id), _) => {
                let desired_size = envelope
                    .desired_size
                    .unwrap_or(self.policy.high_water_mark);
                self.start_stream(handler, stream_id, desired_size, data)
            }
            (Binding::Call(handler), None, Some(call_id)) => {
                self.spawn_call(handler, call_id, data);
                Ok(())
            }
            (Binding::Call(handler), None, None) => {
                let endpoint = Arc::clone(&self.link.source);
                let action = action.to_string();
                tokio::spawn(async move {
                    if let Err(err) = handler.handle_dyn(data).await {
                        warn!(%endpoint, action = %action, error = %err, "notification handler failed");
                    }
                });
                Ok(())
            }
            (Binding::Call(_), Some(stream_id), _) => {
                let reason = RemoteError::unknown(format!("action '{action}' does not stream"), None);
                let reply = Envelope::stream_result(
                    &self.link.source,
                    &self.link.target,
                    StreamKind::StartComplete,
                    stream_id,
                    Err(reason),
                );
                self.post_or_warn(&reply);
                Ok(())
            }
            (Binding::Stream(_), None, Some(call_id)) => {
                let reason = RemoteError::unknown(format!("action '{action}' is a stream"), None);
                let reply = Envelope::reply(&self.link.source, &self.link.target, call_id, Err(reason));
                self.post_or_warn(&reply);
                Ok(())
            }
            (Binding::Stream(_), None, None) => {
                warn!(endpoint = %self.link.source, action, "stream action sent as a notification; ignored");
                Ok(())
            }
        }
    }

    fn spawn_call(&self, handler: Arc<dyn DynHandler>, call_id: CallId, data: Value) {
        let link = self.link.clone();
        tokio::spawn(async move {
            // handler の panic も reply にするため、もう 1 段 spawn する
            let joined = tokio::spawn(async move { handler.handle_dyn(data).await }).await;
            let result = match joined {
                Ok(result) => result.map_err(BobbinError::into_remote),
                Err(join) => Err(RemoteError::unknown(format!("handler panicked: {join}"), None)),
            };
            let reply = Envelope::reply(&link.source, &link.target, call_id, result);
            if let Err(err) = link.post(&reply) {
                warn!(endpoint = %link.source, %call_id, error = %err, "failed to post reply");
            }
        });
    }

    /// sink を作って `start_complete` を返してから producer を起動する
    fn start_stream(
        &self,
        handler: Arc<dyn DynStreamHandler>,
        stream_id: StreamId,
        desired_size: f64,
        data: Value,
    ) -> Result<(), BobbinError> {
        let shared = SinkShared::new(
            stream_id,
            self.link.clone(),
            desired_size,
            Arc::downgrade(&self.streams),
        );
        {
            let mut sinks = lock(&self.streams.sinks);
            if sinks.contains_key(&stream_id) {
                return Err(BobbinError::Protocol(format!("{stream_id} reused while still live")));
            }
            sinks.insert(stream_id, Arc::clone(&shared));
        }
        self.post_or_warn(&Envelope::stream_result(
            &self.link.source,
            &self.link.target,
            StreamKind::StartComplete,
            stream_id,
            Ok(()),
        ));

        let sink: StreamSink<Value> = StreamSink::from_shared(shared);
        tokio::spawn(async move {
            let producer = sink.clone();
            let joined = tokio::spawn(async move { handler.handle_dyn(data, producer).await }).await;
            match joined {
                Ok(Ok(())) => sink.close(),
                Ok(Err(err)) => sink.error(err.into_remote()),
                Err(join) => sink.error(RemoteError::unknown(format!("handler panicked: {join}"), None)),
            }
        });
        Ok(())
    }

    fn post_or_warn(&self, envelope: &Envelope) {
        if let Err(err) = self.link.post(envelope) {
            warn!(endpoint = %self.link.source, error = %err, "failed to post envelope");
        }
    }
}

async fn read_loop(inner: Arc<EndpointInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let next = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            next = inner.link.transport.recv() => next,
        };

        match next {
            None => {
                debug!(endpoint = %inner.link.source, "transport closed by peer");
                inner.teardown(None);
                break;
            }
            Some(Err(err)) => {
                error!(endpoint = %inner.link.source, error = %err, "unreadable envelope");
                EndpointCounters::bump(&inner.link.counters.protocol_violations);
                inner.teardown(Some(err.to_string()));
                break;
            }
            Some(Ok(envelope)) => {
                if let Err(violation) = inner.route_inbound(envelope) {
                    error!(endpoint = %inner.link.source, violation = %violation, "protocol violation");
                    EndpointCounters::bump(&inner.link.counters.protocol_violations);
                    inner.teardown(Some(violation.to_string()));
                    break;
                }
            }
        }
    }
    debug!(endpoint = %inner.link.source, "read loop stopped");
}

enum CallState {
    Waiting(oneshot::Receiver<Result<Value, RemoteError>>),
    Failed(Option<BobbinError>),
}

/// 返信待ちの呼び出し。`.await` すると結果が得られる。
pub struct CallHandle {
    call_id: Option<CallId>,
    state: CallState,
}

impl CallHandle {
    fn failed(err: BobbinError) -> Self {
        Self {
            call_id: None,
            state: CallState::Failed(Some(err)),
        }
    }

    /// 送信に失敗した handle には callId が無い
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }
}

impl Future for CallHandle {
    type Output = Result<Value, BobbinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            CallState::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| match received {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(err.into()),
                Err(_) => Err(RemoteError::abort("endpoint disconnected").into()),
            }),
            CallState::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| BobbinError::other("call handle polled after completion")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::EndpointBuilder;
    use crate::impls::{LoopbackChannel, LoopbackPort};
    use crate::typed::Handler;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl Action for Echo {
        const NAME: &'static str = "Echo";
        type Response = String;
    }

    struct EchoHandler;

    #[async_trait]
    impl Handler<Echo> for EchoHandler {
        async fn handle(&self, request: Echo) -> Result<String, BobbinError> {
            if request.text == "slow" {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            if request.text == "bad" {
                return Err(BobbinError::other("boom"));
            }
            Ok(request.text.to_uppercase())
        }
    }

    fn pair() -> (Endpoint, Endpoint) {
        let (a, b) = LoopbackChannel::new();
        let host = EndpointBuilder::new("host-t", "worker-t")
            .build()
            .unwrap()
            .connect(Arc::new(a));
        let worker = EndpointBuilder::new("worker-t", "host-t")
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .build()
            .unwrap()
            .connect(Arc::new(b));
        (host, worker)
    }

    #[tokio::test]
    async fn replies_reach_matching_calls() {
        let (host, _worker) = pair();

        let slow = host.call("Echo", json!({"text": "slow"}));
        let fast = host.call("Echo", json!({"text": "fast"}));
        assert_eq!(slow.call_id(), Some(CallId::new(1)));
        assert_eq!(fast.call_id(), Some(CallId::new(2)));

        // 返信の到着順は逆でも、それぞれの呼び出しに届く
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), json!("SLOW"));
        assert_eq!(fast.unwrap(), json!("FAST"));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn handler_failures_become_unknown_errors() {
        let (host, _worker) = pair();

        let err = host.call_typed(&Echo { text: "bad".into() }).await.unwrap_err();
        match err {
            BobbinError::Remote(RemoteError::Unknown { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn destroy_fails_pending_calls_with_abort() {
        let (a, _b) = LoopbackChannel::new();
        // 相手側に endpoint が無いので返信は来ない
        let host = EndpointBuilder::new("host-t", "worker-t")
            .build()
            .unwrap()
            .connect(Arc::new(a));

        let pending = host.call("Echo", json!({"text": "never"}));
        host.destroy();

        let err = pending.await.unwrap_err();
        assert!(err.is_abort());
        assert!(host.call("Echo", json!({})).await.unwrap_err().is_abort());
        assert!(host.notify("Echo", json!({})).is_err());
    }

    #[tokio::test]
    async fn synchronous_send_failure_fails_the_handle() {
        let (a, b) = LoopbackChannel::new();
        let host = EndpointBuilder::new("host-t", "worker-t")
            .build()
            .unwrap()
            .connect(Arc::new(a));
        drop(b);

        let handle = host.call("Echo", json!({"text": "x"}));
        assert_eq!(handle.call_id(), None);
        assert!(matches!(handle.await, Err(BobbinError::Transport(_))));
        assert_eq!(host.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unbound_action_is_a_fatal_violation() {
        let (host, worker) = pair();

        host.notify("NoSuchAction", json!(null)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(worker.is_destroyed());
        let fatal = worker.fatal_error().unwrap();
        assert!(fatal.contains("NoSuchAction"));
        assert_eq!(worker.counts().protocol_violations, 1);
    }

    #[tokio::test]
    async fn envelopes_for_other_targets_are_ignored() {
        let (a, b) = LoopbackChannel::new();
        let raw: Arc<LoopbackPort> = Arc::new(a);
        let worker = EndpointBuilder::new("worker-t", "host-t")
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .build()
            .unwrap()
            .connect(Arc::new(b));

        raw.post_message(&Envelope::notification("host-t", "worker-other", "Whatever", json!(null)))
            .unwrap();
        raw.post_message(&Envelope::call("host-t", "worker-t", "Echo", CallId::new(1), json!({"text": "hi"})))
            .unwrap();

        let reply = raw.recv().await.unwrap().unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.data, Some(json!("HI")));
        assert_eq!(worker.counts().ignored_envelopes, 1);
        assert!(!worker.is_destroyed());
    }

    #[tokio::test]
    async fn second_reply_for_the_same_call_is_ignored() {
        let (a, b) = LoopbackChannel::new();
        let raw: Arc<LoopbackPort> = Arc::new(b);
        let host = EndpointBuilder::new("host-t", "worker-t")
            .build()
            .unwrap()
            .connect(Arc::new(a));

        let pending = host.call("Echo", json!({"text": "once"}));
        let request = raw.recv().await.unwrap().unwrap();
        let call_id = request.call_id.unwrap();
        for text in ["first", "second"] {
            raw.post_message(&Envelope::reply("worker-t", "host-t", call_id, Ok(json!(text))))
                .unwrap();
        }

        assert_eq!(pending.await.unwrap(), json!("first"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let counts = host.counts();
        assert_eq!(counts.replies_received, 2);
        assert_eq!(counts.ignored_envelopes, 1);
        assert!(!host.is_destroyed());
    }

    #[tokio::test]
    async fn streaming_a_call_action_fails_on_start() {
        let (host, worker) = pair();

        let reader = host
            .stream("Echo", json!({"text": "x"}), QueueingStrategy::count(1.0))
            .unwrap();
        match reader.read().await {
            Err(RemoteError::Unknown { message, .. }) => assert!(message.contains("does not stream")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(host.live_streams(), (0, 0));
        assert!(worker.fatal_error().is_none());
    }

    #[tokio::test]
    async fn pull_and_cancel_for_a_retired_sink_are_answered() {
        let (a, b) = LoopbackChannel::new();
        let raw: Arc<LoopbackPort> = Arc::new(a);
        let worker = EndpointBuilder::new("worker-t", "host-t")
            .register::<Echo, _>(EchoHandler)
            .unwrap()
            .build()
            .unwrap()
            .connect(Arc::new(b));
        let gone = StreamId::new(9);

        raw.post_message(
            &Envelope::stream_control("host-t", "worker-t", StreamKind::Pull, gone).with_desired_size(2.0),
        )
        .unwrap();
        let answer = raw.recv().await.unwrap().unwrap();
        assert_eq!(answer.stream, Some(StreamKind::PullComplete));
        assert_eq!(answer.stream_id, Some(gone));
        assert_eq!(answer.completion(), Ok(()));

        raw.post_message(
            &Envelope::stream_control("host-t", "worker-t", StreamKind::Cancel, gone)
                .with_error(&RemoteError::abort("page hidden")),
        )
        .unwrap();
        let answer = raw.recv().await.unwrap().unwrap();
        assert_eq!(answer.stream, Some(StreamKind::CancelComplete));
        assert_eq!(answer.completion(), Ok(()));
        assert!(worker.fatal_error().is_none());
    }
}
