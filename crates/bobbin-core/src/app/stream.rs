//! Stream protocol - credit ベースの流量制御つきストリーム
//!
//! # 2 つの端
//! - **StreamSink**（producer 側）: `enqueue` のたびに `desiredSize` を cost だけ減らす。
//!   0 以下になったら `pull` で credit が戻るまで待つ。内部に無制限のバッファは持たない。
//! - **StreamReader**（consumer 側、StreamController を包む）: 受け取った chunk をバッファし、
//!   バッファが空になったら `pull` で credit を追加する。未応答の `pull` は常に高々 1 つ。
//!
//! # 終端
//! - `close` / `error` は producer が送る最後の envelope。2 回目以降は no-op
//! - `cancel` はどちらからでも要求できる。producer の onCancel が終わってから `cancel_complete`
//! - cancel と close の行き違いは正常系として扱う（すでに retire 済みなら何もしない）
//!
//! # 状態の持ち主
//! sink も controller も作った endpoint の `StreamTable` に登録される。
//! 相手側は envelope でお願いするだけで、状態を直接触ることはない。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use super::lock;
use crate::config::StreamPolicy;
use crate::domain::{Envelope, RemoteError, StreamId, StreamKind};
use crate::error::BobbinError;
use crate::observability::EndpointCounters;
use crate::ports::{Transport, TransportError};
use crate::typed::codec;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type PullHook = Arc<dyn Fn() -> BoxFuture<Result<(), RemoteError>> + Send + Sync>;
type CancelHook = Arc<dyn Fn(RemoteError) -> BoxFuture<Result<(), RemoteError>> + Send + Sync>;

/// 送信元・送信先の名前と transport の組
#[derive(Clone)]
pub(crate) struct Link {
    pub source: Arc<str>,
    pub target: Arc<str>,
    pub transport: Arc<dyn Transport>,
    pub counters: Arc<EndpointCounters>,
}

impl Link {
    pub fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.transport.post_message(envelope)
    }

    fn control(&self, kind: StreamKind, stream_id: StreamId) -> Envelope {
        Envelope::stream_control(&self.source, &self.target, kind, stream_id)
    }

    fn result(&self, kind: StreamKind, stream_id: StreamId, result: Result<(), RemoteError>) -> Envelope {
        Envelope::stream_result(&self.source, &self.target, kind, stream_id, result)
    }

    /// 返事を送れなくても、その stream 以外には影響しないので warn で済ませる
    fn post_or_warn(&self, envelope: &Envelope) {
        if let Err(err) = self.post(envelope) {
            warn!(
                source = %self.source,
                stream = ?envelope.stream,
                stream_id = ?envelope.stream_id,
                error = %err,
                "failed to post stream envelope"
            );
        }
    }
}

/// Live sinks and controllers of one endpoint.
///
/// 同じ番号でも sink（相手が採番）と controller（自分が採番）は別の名前空間。
#[derive(Default)]
pub(crate) struct StreamTable {
    pub sinks: Mutex<HashMap<StreamId, Arc<SinkShared>>>,
    pub controllers: Mutex<HashMap<StreamId, Arc<ControllerShared>>>,
}

impl StreamTable {
    pub fn sink(&self, id: StreamId) -> Option<Arc<SinkShared>> {
        lock(&self.sinks).get(&id).cloned()
    }

    pub fn controller(&self, id: StreamId) -> Option<Arc<ControllerShared>> {
        lock(&self.controllers).get(&id).cloned()
    }

    /// endpoint の破棄時: 全部を abort で終わらせて空にする
    pub fn abandon_all(&self, reason: &RemoteError) {
        let sinks: Vec<_> = lock(&self.sinks).drain().map(|(_, s)| s).collect();
        for sink in sinks {
            sink.abandon(reason.clone());
        }
        let controllers: Vec<_> = lock(&self.controllers).drain().map(|(_, c)| c).collect();
        for controller in controllers {
            controller.abandon(reason.clone());
        }
    }

    pub fn live_streams(&self) -> (usize, usize) {
        (lock(&self.sinks).len(), lock(&self.controllers).len())
    }
}

// ========================================
// QueueingStrategy
// ========================================

/// consumer 側の credit 計算方法
///
/// `size` は受け取った chunk 1 つが消費する credit。producer 側が
/// `enqueue` に渡す cost と同じ計算にしておくこと。
#[derive(Debug, Clone, Copy)]
pub struct QueueingStrategy {
    pub high_water_mark: f64,
    pub size: fn(&Value) -> f64,
}

fn count_one(_chunk: &Value) -> f64 {
    1.0
}

impl QueueingStrategy {
    /// 1 chunk = 1 credit
    pub fn count(high_water_mark: f64) -> Self {
        Self {
            high_water_mark,
            size: count_one,
        }
    }

    pub fn with_size(high_water_mark: f64, size: fn(&Value) -> f64) -> Self {
        Self {
            high_water_mark,
            size,
        }
    }

    pub fn from_policy(policy: &StreamPolicy) -> Self {
        Self::count(policy.high_water_mark)
    }
}

impl Default for QueueingStrategy {
    fn default() -> Self {
        Self::from_policy(&StreamPolicy::default_v1())
    }
}

// ========================================
// Producer side
// ========================================

struct SinkState {
    desired_size: f64,
    is_closed: bool,
    cancelled: Option<RemoteError>,
    on_pull: Option<PullHook>,
    on_cancel: Option<CancelHook>,
}

pub(crate) struct SinkShared {
    stream_id: StreamId,
    link: Link,
    table: Weak<StreamTable>,
    state: Mutex<SinkState>,
    credit: Notify,
}

impl SinkShared {
    pub fn new(stream_id: StreamId, link: Link, desired_size: f64, table: Weak<StreamTable>) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            link,
            table,
            state: Mutex::new(SinkState {
                desired_size,
                is_closed: false,
                cancelled: None,
                on_pull: None,
                on_cancel: None,
            }),
            credit: Notify::new(),
        })
    }

    fn retire(&self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table.sinks).remove(&self.stream_id);
        }
    }

    /// `pull` envelope: credit を `grant` だけ足す
    ///
    /// `pull_complete` を送ってから credit を足すので、この pull に応えて作られた
    /// `enqueue` が `pull_complete` より先に出ることはない。
    pub fn handle_pull(self: &Arc<Self>, grant: f64) {
        let hook = lock(&self.state).on_pull.clone();
        match hook {
            None => self.complete_pull(grant, Ok(())),
            Some(hook) => {
                let sink = Arc::clone(self);
                tokio::spawn(async move {
                    let result = hook().await;
                    sink.complete_pull(grant, result);
                });
            }
        }
    }

    fn complete_pull(&self, grant: f64, result: Result<(), RemoteError>) {
        let ok = result.is_ok();
        self.link
            .post_or_warn(&self.link.result(StreamKind::PullComplete, self.stream_id, result));
        if ok {
            lock(&self.state).desired_size += grant;
            self.credit.notify_waiters();
        }
    }

    /// `cancel` envelope: 以後の enqueue/close/error を止め、onCancel の完了後に応答する
    pub fn handle_cancel(self: &Arc<Self>, reason: RemoteError) {
        let hook = {
            let mut state = lock(&self.state);
            state.is_closed = true;
            state.cancelled = Some(reason.clone());
            state.on_cancel.take()
        };
        self.credit.notify_waiters();
        self.retire();
        debug!(stream_id = %self.stream_id, reason = %reason, "stream cancelled by consumer");

        match hook {
            None => self.link.post_or_warn(&self.link.result(
                StreamKind::CancelComplete,
                self.stream_id,
                Ok(()),
            )),
            Some(hook) => {
                let link = self.link.clone();
                let stream_id = self.stream_id;
                tokio::spawn(async move {
                    let result = hook(reason).await;
                    link.post_or_warn(&link.result(StreamKind::CancelComplete, stream_id, result));
                });
            }
        }
    }

    /// endpoint の破棄: envelope は送らずに待ち手を起こすだけ
    fn abandon(&self, reason: RemoteError) {
        {
            let mut state = lock(&self.state);
            state.is_closed = true;
            if state.cancelled.is_none() {
                state.cancelled = Some(reason);
            }
        }
        self.credit.notify_waiters();
    }

    fn finish(&self, kind: StreamKind, reason: Option<&RemoteError>) -> bool {
        {
            let mut state = lock(&self.state);
            if state.is_closed {
                return false;
            }
            state.is_closed = true;
            let mut envelope = self.link.control(kind, self.stream_id);
            if let Some(reason) = reason {
                envelope = envelope.with_error(reason);
            }
            self.link.post_or_warn(&envelope);
        }
        self.credit.notify_waiters();
        self.retire();
        true
    }
}

/// StreamSink は producer 側のハンドル
///
/// clone しても同じ stream を指す。型パラメータは chunk の型。
pub struct StreamSink<T = Value> {
    shared: Arc<SinkShared>,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<T> StreamSink<T> {
    pub(crate) fn from_shared(shared: Arc<SinkShared>) -> Self {
        Self {
            shared,
            _marker: PhantomData,
        }
    }

    /// 同じ stream を別の chunk 型で扱う
    pub fn retype<U>(self) -> StreamSink<U> {
        StreamSink::from_shared(self.shared)
    }

    pub fn stream_id(&self) -> StreamId {
        self.shared.stream_id
    }

    pub fn desired_size(&self) -> f64 {
        lock(&self.shared.state).desired_size
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).is_closed
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.shared.state).cancelled.is_some()
    }

    /// Called each time the consumer asks for more data, before `pull_complete`
    /// is sent. The hook must not wait on this sink's `enqueue`.
    pub fn on_pull<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        let hook: PullHook = Arc::new(move || Box::pin(hook()));
        lock(&self.shared.state).on_pull = Some(hook);
    }

    /// Called once when the consumer cancels; `cancel_complete` waits for it.
    pub fn on_cancel<F, Fut>(&self, hook: F)
    where
        F: Fn(RemoteError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        let hook: CancelHook = Arc::new(move |reason| Box::pin(hook(reason)));
        lock(&self.shared.state).on_cancel = Some(hook);
    }

    /// credit が正になるまで待つ
    ///
    /// cancel 済みなら cancel の理由、close 済みなら `Abort` を返す。
    pub async fn ready(&self) -> Result<(), RemoteError> {
        loop {
            let notified = self.shared.credit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = lock(&self.shared.state);
                if let Some(reason) = &state.cancelled {
                    return Err(reason.clone());
                }
                if state.is_closed {
                    return Err(RemoteError::abort("stream is closed"));
                }
                if state.desired_size > 0.0 {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        if self.shared.finish(StreamKind::Close, None) {
            debug!(stream_id = %self.shared.stream_id, "stream closed by producer");
        }
    }

    pub fn error(&self, reason: RemoteError) {
        if self.shared.finish(StreamKind::Error, Some(&reason)) {
            debug!(stream_id = %self.shared.stream_id, reason = %reason, "stream errored by producer");
        }
    }
}

impl<T: Serialize> StreamSink<T> {
    /// chunk を 1 つ送り、`desiredSize` を `cost` だけ減らす
    ///
    /// credit が 0 以下なら `pull` が来るまで待つ。close / cancel 済みなら
    /// 何もせず `Ok(())`（黙って捨てる）。
    pub async fn enqueue(&self, chunk: T, cost: f64) -> Result<(), BobbinError> {
        let value = codec::encode(&chunk)?;
        loop {
            let notified = self.shared.credit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&self.shared.state);
                if state.is_closed {
                    debug!(stream_id = %self.shared.stream_id, "enqueue after close dropped");
                    return Ok(());
                }
                if state.desired_size > 0.0 {
                    let envelope = self
                        .shared
                        .link
                        .control(StreamKind::Enqueue, self.shared.stream_id)
                        .with_chunk(value);
                    self.shared.link.post(&envelope)?;
                    state.desired_size -= cost;
                    EndpointCounters::bump(&self.shared.link.counters.chunks_sent);
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}

// ========================================
// Consumer side
// ========================================

#[derive(Debug, Clone)]
enum Terminal {
    Closed,
    Errored(RemoteError),
    Cancelled(RemoteError),
}

struct ControllerState {
    buffer: VecDeque<Value>,
    /// producer がまだ使える credit（初期値 + Σgrant − Σsize）
    outstanding: f64,
    started: bool,
    pull_pending: bool,
    cancel_waiter: Option<oneshot::Sender<Result<(), RemoteError>>>,
    terminal: Option<Terminal>,
}

pub(crate) struct ControllerShared {
    stream_id: StreamId,
    link: Link,
    strategy: QueueingStrategy,
    table: Weak<StreamTable>,
    state: Mutex<ControllerState>,
    notify: Notify,
}

impl ControllerShared {
    pub fn new(
        stream_id: StreamId,
        link: Link,
        strategy: QueueingStrategy,
        table: Weak<StreamTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream_id,
            link,
            strategy,
            table,
            state: Mutex::new(ControllerState {
                buffer: VecDeque::new(),
                outstanding: strategy.high_water_mark,
                started: false,
                pull_pending: false,
                cancel_waiter: None,
                terminal: None,
            }),
            notify: Notify::new(),
        })
    }

    fn retire(&self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table.controllers).remove(&self.stream_id);
        }
    }

    /// バッファが空で、開始済みで、未応答の pull が無いときだけ credit を追加する
    fn maybe_pull(&self, state: &mut ControllerState) {
        if !state.started || state.pull_pending || state.terminal.is_some() || !state.buffer.is_empty() {
            return;
        }
        let grant = self.strategy.high_water_mark - state.outstanding;
        if grant <= 0.0 {
            return;
        }
        let envelope = self
            .link
            .control(StreamKind::Pull, self.stream_id)
            .with_desired_size(grant);
        match self.link.post(&envelope) {
            Ok(()) => {
                state.pull_pending = true;
                state.outstanding += grant;
                EndpointCounters::bump(&self.link.counters.pulls_sent);
            }
            Err(err) => warn!(stream_id = %self.stream_id, error = %err, "failed to post pull"),
        }
    }

    pub fn handle(&self, envelope: &Envelope, kind: StreamKind) {
        match kind {
            StreamKind::StartComplete => self.on_start_complete(envelope.completion()),
            StreamKind::PullComplete => self.on_pull_complete(envelope.completion()),
            StreamKind::Enqueue => self.on_enqueue(envelope.chunk.clone().unwrap_or(Value::Null)),
            StreamKind::Close => self.on_terminal(Terminal::Closed),
            StreamKind::Error => self.on_terminal(Terminal::Errored(
                envelope
                    .remote_error()
                    .unwrap_or_else(|| RemoteError::unknown("stream error without reason", None)),
            )),
            StreamKind::CancelComplete => self.on_cancel_complete(envelope.completion()),
            StreamKind::Pull | StreamKind::Cancel => {
                warn!(stream_id = %self.stream_id, ?kind, "sink-side message routed to controller");
            }
        }
    }

    fn on_start_complete(&self, result: Result<(), RemoteError>) {
        {
            let mut state = lock(&self.state);
            if state.terminal.is_some() {
                return;
            }
            match result {
                Ok(()) => {
                    state.started = true;
                    self.maybe_pull(&mut state);
                }
                Err(err) => {
                    state.terminal = Some(Terminal::Errored(err));
                    drop(state);
                    self.retire();
                }
            }
        }
        self.notify.notify_waiters();
    }

    fn on_pull_complete(&self, result: Result<(), RemoteError>) {
        {
            let mut state = lock(&self.state);
            state.pull_pending = false;
            if state.terminal.is_some() {
                return;
            }
            if let Err(err) = result {
                state.terminal = Some(Terminal::Errored(err));
                drop(state);
                self.retire();
            } else {
                self.maybe_pull(&mut state);
            }
        }
        self.notify.notify_waiters();
    }

    fn on_enqueue(&self, chunk: Value) {
        EndpointCounters::bump(&self.link.counters.chunks_received);
        {
            let mut state = lock(&self.state);
            if state.terminal.is_some() {
                debug!(stream_id = %self.stream_id, "chunk after termination dropped");
                return;
            }
            state.outstanding -= (self.strategy.size)(&chunk);
            state.buffer.push_back(chunk);
        }
        self.notify.notify_waiters();
    }

    fn on_terminal(&self, terminal: Terminal) {
        {
            let mut state = lock(&self.state);
            // cancel と close/error の行き違い: cancel 側は正常に終わったことにする
            if let Some(waiter) = state.cancel_waiter.take() {
                let _ = waiter.send(Ok(()));
            }
            if state.terminal.is_none() {
                state.terminal = Some(terminal);
            }
        }
        self.retire();
        self.notify.notify_waiters();
    }

    fn on_cancel_complete(&self, result: Result<(), RemoteError>) {
        if let Some(waiter) = lock(&self.state).cancel_waiter.take() {
            let _ = waiter.send(result);
        }
        self.retire();
        self.notify.notify_waiters();
    }

    fn abandon(&self, reason: RemoteError) {
        {
            let mut state = lock(&self.state);
            if let Some(waiter) = state.cancel_waiter.take() {
                let _ = waiter.send(Err(reason.clone()));
            }
            if state.terminal.is_none() {
                state.terminal = Some(Terminal::Errored(reason));
            }
        }
        self.notify.notify_waiters();
    }
}

/// StreamReader は consumer 側のハンドル（StreamController を包む）
///
/// clone しても同じ stream を読む。`read` と `cancel` は別タスクから同時に呼んでよい。
pub struct StreamReader<T = Value> {
    shared: Arc<ControllerShared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for StreamReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<T> StreamReader<T> {
    pub(crate) fn from_shared(shared: Arc<ControllerShared>) -> Self {
        Self {
            shared,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_shared(self) -> Arc<ControllerShared> {
        self.shared
    }

    pub fn stream_id(&self) -> StreamId {
        self.shared.stream_id
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.shared.state).terminal.is_some()
    }

    /// Cancel the stream and wait for the producer's acknowledgement.
    ///
    /// 待っている `read` は `reason` で失敗する。すでに終わった stream に対しては何もしない。
    pub async fn cancel(&self, reason: RemoteError) -> Result<(), RemoteError> {
        let shared = &self.shared;
        let rx = {
            let mut state = lock(&shared.state);
            if state.terminal.is_some() {
                return Ok(());
            }
            state.terminal = Some(Terminal::Cancelled(reason.clone()));
            state.buffer.clear();
            let envelope = shared
                .link
                .control(StreamKind::Cancel, shared.stream_id)
                .with_error(&reason);
            if let Err(err) = shared.link.post(&envelope) {
                drop(state);
                shared.retire();
                shared.notify.notify_waiters();
                return Err(RemoteError::unknown(err.to_string(), Some("Transport".into())));
            }
            EndpointCounters::bump(&shared.link.counters.cancels_sent);
            let (tx, rx) = oneshot::channel();
            state.cancel_waiter = Some(tx);
            rx
        };
        shared.notify.notify_waiters();
        debug!(stream_id = %shared.stream_id, reason = %reason, "stream cancel requested");
        // sender が落ちた = すでに retire 済み
        rx.await.unwrap_or(Ok(()))
    }
}

impl<T: DeserializeOwned> StreamReader<T> {
    /// 次の chunk を待つ。`Ok(None)` は正常終了。
    ///
    /// stream の error / cancel は 1 回だけでなく、以後の read でも同じ理由で失敗する。
    pub async fn read(&self) -> Result<Option<T>, RemoteError> {
        let shared = &self.shared;
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&shared.state);
                if let Some(chunk) = state.buffer.pop_front() {
                    shared.maybe_pull(&mut state);
                    drop(state);
                    return codec::decode_remote(chunk).map(Some);
                }
                if let Some(terminal) = &state.terminal {
                    return match terminal {
                        Terminal::Closed => Ok(None),
                        Terminal::Errored(err) | Terminal::Cancelled(err) => Err(err.clone()),
                    };
                }
                shared.maybe_pull(&mut state);
            }
            notified.await;
        }
    }

    /// 残り全部を読む（テストや小さい stream 向け）
    pub async fn collect(&self) -> Result<Vec<T>, RemoteError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.push(chunk);
        }
        Ok(out)
    }
}
