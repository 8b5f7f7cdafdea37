//! RenderDriver - 描画スケジューラを回す async actor
//!
//! `RenderingQueue`（同期コア）の外側で次のものを持つ:
//! - view ごとの `PageSurface`
//! - (view, intent) ごとの operator list と、それを流し込む読み取りタスク（pump）
//! - idle タイマーと、cancel 後のストリーム破棄を遅らせる猶予タイマー
//!
//! 外からは `RenderDriverHandle` にコマンドを送るだけ。状態はすべてこの actor の中にあり、
//! 1 回のループで 1 つのことしかしない（コマンド / stream イベント / タイマー / 1 バッチの描画）。
//!
//! # cancel の猶予
//! 描画中のタスクを cancel しても、operator list のストリームはすぐには止めない。
//! `cancel_grace` の間に同じ (view, intent) が再要求されれば、そのまま続きを使う。
//! 猶予が切れたら `Abort` で cancel し、溜めた operator list も捨てる。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::lock;
use super::render_task::{RenderError, RenderTask, StepOutcome, TaskKey};
use super::rendering_queue::{Effect, RenderingQueue, VisibleViews};
use crate::config::SessionConfig;
use crate::domain::{OperatorList, OperatorListChunk, RemoteError, RenderIntent, RenderingState, ViewId};
use crate::error::BobbinError;
use crate::ports::{OperatorListSource, OperatorListStream, PageSurface};

/// idle になったときに呼ばれる。引数は描画中でない view。
pub type IdleCallback = Box<dyn Fn(&[ViewId]) + Send + 'static>;

type Waiter = oneshot::Sender<Result<(), RenderError>>;

/// 1 タスク分の状態
#[derive(Debug, Clone, PartialEq)]
pub struct ViewReport {
    pub view: ViewId,
    pub intent: RenderIntent,
    pub state: RenderingState,
    pub error: Option<RemoteError>,
    /// 最後の描画が cancel で止まった
    pub cancelled: bool,
}

enum Command {
    /// `None` なら surface の priority_weight から見えている view を求める
    Update {
        visible: Option<VisibleViews>,
        scrolled_down: bool,
    },
    RenderPrint {
        view: ViewId,
        reply: Waiter,
    },
    Wait {
        key: TaskKey,
        reply: Waiter,
    },
    Cancel(TaskKey),
    Reset(ViewId),
    SetPrinting(bool),
    Snapshot(oneshot::Sender<Vec<ViewReport>>),
    Shutdown,
}

enum StreamEvent {
    Chunk {
        key: TaskKey,
        generation: u64,
        chunk: OperatorListChunk,
    },
    Closed {
        key: TaskKey,
        generation: u64,
    },
    Failed {
        key: TaskKey,
        generation: u64,
        err: RemoteError,
    },
}

/// (view, intent) ごとの operator list とその供給元
struct Feed {
    list: OperatorList,
    stream: Option<Arc<dyn OperatorListStream>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    abandon_at: Option<Instant>,
}

impl Feed {
    /// ストリームを開けなかった (view, intent) の目印
    fn empty(generation: u64) -> Self {
        Self {
            list: OperatorList::new(),
            stream: None,
            generation,
            pump: None,
            abandon_at: None,
        }
    }

    /// ストリームを即座に止める（猶予なし）
    fn abort(self, key: TaskKey, reason: RemoteError) {
        if let Some(pump) = self.pump {
            pump.abort();
        }
        if let Some(stream) = self.stream {
            tokio::spawn(async move {
                if let Err(err) = stream.cancel(reason).await {
                    debug!(task = %key, error = %err, "operator list cancel failed");
                }
            });
        }
    }
}

pub struct RenderDriver {
    queue: RenderingQueue,
    surfaces: HashMap<ViewId, Box<dyn PageSurface>>,
    source: Arc<dyn OperatorListSource>,
    feeds: HashMap<TaskKey, Feed>,
    waiters: HashMap<TaskKey, Vec<Waiter>>,
    cancel_grace: Duration,
    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
    on_idle: Option<IdleCallback>,
    visible: VisibleViews,
    scrolled_down: bool,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl RenderDriver {
    /// `surfaces[i]` が view `i` の描画先になる
    pub fn new(
        surfaces: Vec<Box<dyn PageSurface>>,
        source: Arc<dyn OperatorListSource>,
        config: &SessionConfig,
    ) -> Result<Self, BobbinError> {
        let max_views = config.scheduler.max_views;
        if surfaces.len() > max_views {
            return Err(BobbinError::other(format!(
                "document has {} views, more than scheduler.max_views={max_views}",
                surfaces.len()
            )));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            queue: RenderingQueue::new(surfaces.len()),
            surfaces: surfaces
                .into_iter()
                .enumerate()
                .map(|(index, surface)| (ViewId::new(index), surface))
                .collect(),
            source,
            feeds: HashMap::new(),
            waiters: HashMap::new(),
            cancel_grace: config.stream.cancel_grace(),
            idle_timeout: config.scheduler.idle_timeout(),
            idle_deadline: None,
            on_idle: None,
            visible: VisibleViews::default(),
            scrolled_down: true,
            next_generation: 0,
            events_tx,
            events_rx,
        })
    }

    pub fn on_idle(mut self, callback: impl Fn(&[ViewId]) + Send + 'static) -> Self {
        self.on_idle = Some(Box::new(callback));
        self
    }

    pub fn spawn(self) -> RenderDriverHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(self.run(rx));
        RenderDriverHandle {
            commands,
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let abandon_deadline = self.feeds.values().filter_map(|feed| feed.abandon_at).min();
            let idle_deadline = self.idle_deadline;
            let has_work = self.queue.has_ready();

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = sleep_until(abandon_deadline.unwrap_or_else(Instant::now)), if abandon_deadline.is_some() => {
                    self.expire_abandoned();
                }
                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    self.fire_idle();
                }
                _ = std::future::ready(()), if has_work => {
                    self.step();
                    // 1 バッチごとに他のタスク（pump や endpoint）へ譲る
                    tokio::task::yield_now().await;
                }
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Update {
                visible,
                scrolled_down,
            } => {
                self.visible = visible.unwrap_or_else(|| self.visible_from_surfaces());
                self.scrolled_down = scrolled_down;
                self.queue.release_held();
                self.reschedule();
            }
            Command::RenderPrint { view, reply } => {
                if view.index() >= self.queue.view_count() {
                    let err = RemoteError::unknown(format!("no such view: {view}"), None);
                    let _ = reply.send(Err(RenderError::Failed(err)));
                    return;
                }
                let key = TaskKey::print(view);
                self.waiters.entry(key).or_default().push(reply);
                if let Some(effect) = self.queue.draw_print(view) {
                    self.apply(vec![effect]);
                }
            }
            Command::Wait { key, reply } => match self.queue.task(key) {
                Some(task) if task.state().is_finished() => {
                    let result = match task.error() {
                        Some(err) => Err(RenderError::Failed(err.clone())),
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                }
                _ => self.waiters.entry(key).or_default().push(reply),
            },
            Command::Cancel(key) => self.cancel(key),
            Command::Reset(view) => {
                let key = TaskKey::display(view);
                self.cancel(key);
                self.queue.reset(key);
                if let Some(feed) = self.feeds.remove(&key) {
                    feed.abort(key, RemoteError::abort("rendering was reset"));
                }
                self.reschedule();
            }
            Command::SetPrinting(printing) => {
                if let Some(effect) = self.queue.set_printing(printing) {
                    self.apply(vec![effect]);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn visible_from_surfaces(&self) -> VisibleViews {
        VisibleViews::from_weights((0..self.queue.view_count()).map(|index| {
            let view = ViewId::new(index);
            let weight = self
                .surfaces
                .get(&view)
                .and_then(|surface| surface.priority_weight());
            (view, weight)
        }))
    }

    fn reschedule(&mut self) {
        let effects = self
            .queue
            .render_highest_priority(&self.visible, self.scrolled_down);
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Draw(key) => self.ensure_feed(key),
                Effect::Resume(_) | Effect::Pause(_) => {}
                Effect::ScheduleIdle => {
                    self.idle_deadline = Some(Instant::now() + self.idle_timeout);
                }
                Effect::CancelIdle => self.idle_deadline = None,
            }
        }
    }

    /// operator list を流し始める。猶予中のストリームや完成済みのリストがあれば再利用する。
    fn ensure_feed(&mut self, key: TaskKey) {
        if let Some(feed) = self.feeds.get_mut(&key) {
            if feed.abandon_at.take().is_some() {
                debug!(task = %key, "reusing operator list stream within grace period");
            }
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let stream = match self.source.open(key.view, key.intent) {
            Ok(stream) => stream,
            Err(err) => {
                // reschedule の途中なので、失敗はイベントとして次のループで扱う
                debug!(task = %key, error = %err, "failed to open operator list");
                self.feeds.insert(key, Feed::empty(generation));
                let _ = self.events_tx.send(StreamEvent::Failed {
                    key,
                    generation,
                    err,
                });
                return;
            }
        };
        let pump = tokio::spawn(pump(key, generation, Arc::clone(&stream), self.events_tx.clone()));
        self.feeds.insert(
            key,
            Feed {
                list: OperatorList::new(),
                stream: Some(stream),
                generation,
                pump: Some(pump),
                abandon_at: None,
            },
        );
        debug!(task = %key, generation, "operator list stream opened");
    }

    fn handle_event(&mut self, event: StreamEvent) {
        let (key, generation) = match &event {
            StreamEvent::Chunk { key, generation, .. }
            | StreamEvent::Closed { key, generation }
            | StreamEvent::Failed { key, generation, .. } => (*key, *generation),
        };
        let Some(feed) = self.feeds.get_mut(&key) else {
            return;
        };
        if feed.generation != generation {
            return;
        }

        match event {
            StreamEvent::Chunk { chunk, .. } => {
                feed.list.append(chunk);
                self.queue.wake(key);
            }
            StreamEvent::Closed { .. } => {
                feed.list.mark_complete();
                feed.stream = None;
                feed.pump = None;
                feed.abandon_at = None;
                self.queue.wake(key);
            }
            StreamEvent::Failed { err, .. } => {
                self.feeds.remove(&key);
                self.fail(key, err);
            }
        }
    }

    fn step(&mut self) {
        let Some(key) = self.queue.next_ready() else {
            return;
        };
        let Some(feed) = self.feeds.get(&key) else {
            // まだ何も届いていない（または再オープン待ち）
            return;
        };
        let Some(surface) = self.surfaces.get_mut(&key.view) else {
            self.fail(key, RemoteError::unknown(format!("no surface for {}", key.view), None));
            return;
        };

        match self.queue.execute(key, &feed.list, surface.as_mut()) {
            None | Some(StepOutcome::Yield) | Some(StepOutcome::Waiting) => {}
            Some(StepOutcome::Finished) => {
                info!(task = %key, "rendering finished");
                self.settle(key, Ok(()));
                self.reschedule();
            }
            Some(StepOutcome::Failed(err)) => self.fail(key, err),
        }
    }

    /// `Abort` は cancel として扱い、失敗としては記録しない
    fn fail(&mut self, key: TaskKey, err: RemoteError) {
        let err = match RenderError::from_remote(key, err) {
            RenderError::Cancelled(_) => {
                self.cancel(key);
                return;
            }
            RenderError::Failed(err) => err,
        };
        warn!(task = %key, error = %err, "rendering failed");
        self.queue.fail(key, err.clone());
        if let Some(feed) = self.feeds.remove(&key) {
            feed.abort(key, RemoteError::abort("rendering failed"));
        }
        self.settle(key, Err(RenderError::Failed(err)));
        self.reschedule();
    }

    fn cancel(&mut self, key: TaskKey) {
        if !self.queue.cancel(key) {
            return;
        }
        debug!(task = %key, "rendering cancelled");
        self.settle(key, Err(RenderError::Cancelled(key)));
        if let Some(feed) = self.feeds.get_mut(&key) {
            if !feed.list.is_complete() {
                feed.abandon_at = Some(Instant::now() + self.cancel_grace);
            }
        }
        if key.intent == RenderIntent::Display {
            self.reschedule();
        }
    }

    fn expire_abandoned(&mut self) {
        let now = Instant::now();
        let expired: Vec<TaskKey> = self
            .feeds
            .iter()
            .filter(|(_, feed)| feed.abandon_at.is_some_and(|at| at <= now))
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(feed) = self.feeds.remove(&key) {
                debug!(task = %key, "abandoned operator list stream cancelled");
                feed.abort(key, RemoteError::abort("rendering cancelled"));
            }
        }
    }

    fn fire_idle(&mut self) {
        self.idle_deadline = None;
        self.queue.idle_fired();
        let active = self.queue.active_tasks();
        let idle_views: Vec<ViewId> = (0..self.queue.view_count())
            .map(ViewId::new)
            .filter(|view| !active.iter().any(|key| key.view == *view))
            .collect();
        debug!(views = idle_views.len(), "rendering idle");
        if let Some(callback) = &self.on_idle {
            callback(&idle_views);
        }
    }

    fn settle(&mut self, key: TaskKey, result: Result<(), RenderError>) {
        for waiter in self.waiters.remove(&key).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    fn snapshot(&self) -> Vec<ViewReport> {
        let mut reports: Vec<ViewReport> = (0..self.queue.view_count())
            .map(|index| {
                let view = ViewId::new(index);
                ViewReport {
                    view,
                    intent: RenderIntent::Display,
                    state: self.queue.state(view),
                    error: self.queue.error(view).cloned(),
                    cancelled: self
                        .queue
                        .task(TaskKey::display(view))
                        .is_some_and(RenderTask::was_cancelled),
                }
            })
            .collect();
        reports.extend(
            self.queue
                .tasks()
                .filter(|task| task.key().intent == RenderIntent::Print)
                .map(|task| ViewReport {
                    view: task.key().view,
                    intent: RenderIntent::Print,
                    state: task.state(),
                    error: task.error().cloned(),
                    cancelled: task.was_cancelled(),
                }),
        );
        reports.sort_by_key(|report| (report.view, report.intent == RenderIntent::Print));
        reports
    }

    fn shutdown(&mut self) {
        for key in self.queue.active_tasks() {
            self.queue.cancel(key);
        }
        let keys: Vec<TaskKey> = self.waiters.keys().copied().collect();
        for key in keys {
            self.settle(key, Err(RenderError::Cancelled(key)));
        }
        for (key, feed) in self.feeds.drain() {
            feed.abort(key, RemoteError::abort("render driver shut down"));
        }
        debug!("render driver stopped");
    }
}

async fn pump(
    key: TaskKey,
    generation: u64,
    stream: Arc<dyn OperatorListStream>,
    events: mpsc::UnboundedSender<StreamEvent>,
) {
    loop {
        let event = match stream.read().await {
            Ok(Some(chunk)) => StreamEvent::Chunk {
                key,
                generation,
                chunk,
            },
            Ok(None) => StreamEvent::Closed { key, generation },
            Err(err) => StreamEvent::Failed {
                key,
                generation,
                err,
            },
        };
        let last = !matches!(event, StreamEvent::Chunk { .. });
        if events.send(event).is_err() || last {
            return;
        }
    }
}

/// `RenderDriver` への窓口
#[derive(Clone)]
pub struct RenderDriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RenderDriverHandle {
    fn send(&self, command: Command) -> Result<(), BobbinError> {
        self.commands
            .send(command)
            .map_err(|_| RemoteError::abort("render driver has stopped").into())
    }

    /// 見えている view を更新して、最優先を選び直す
    pub fn update_visibility(&self, visible: VisibleViews, scrolled_down: bool) -> Result<(), BobbinError> {
        self.send(Command::Update {
            visible: Some(visible),
            scrolled_down,
        })
    }

    /// surface の `priority_weight()` から見えている view を求めて選び直す
    pub fn update_from_surfaces(&self, scrolled_down: bool) -> Result<(), BobbinError> {
        self.send(Command::Update {
            visible: None,
            scrolled_down,
        })
    }

    pub async fn render_print(&self, view: ViewId) -> Result<(), RenderError> {
        let key = TaskKey::print(view);
        let (reply, rx) = oneshot::channel();
        if self.send(Command::RenderPrint { view, reply }).is_err() {
            return Err(RenderError::Cancelled(key));
        }
        rx.await.unwrap_or(Err(RenderError::Cancelled(key)))
    }

    /// タスクが終わるまで待つ。cancel されたら `RenderError::Cancelled`。
    pub async fn wait_finished(&self, key: TaskKey) -> Result<(), RenderError> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Wait { key, reply }).is_err() {
            return Err(RenderError::Cancelled(key));
        }
        rx.await.unwrap_or(Err(RenderError::Cancelled(key)))
    }

    pub fn cancel(&self, key: TaskKey) -> Result<(), BobbinError> {
        self.send(Command::Cancel(key))
    }

    /// 失敗や完了を忘れて、もう一度描けるようにする
    pub fn reset(&self, view: ViewId) -> Result<(), BobbinError> {
        self.send(Command::Reset(view))
    }

    pub fn set_printing(&self, printing: bool) -> Result<(), BobbinError> {
        self.send(Command::SetPrinting(printing))
    }

    pub async fn snapshot(&self) -> Result<Vec<ViewReport>, BobbinError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await
            .map_err(|_| RemoteError::abort("render driver has stopped").into())
    }

    /// 全タスクを cancel し、ストリームを即座に止めて actor の終了を待つ
    pub async fn shutdown_and_join(&self) {
        // ignore send error: the driver may already be gone
        let _ = self.commands.send(Command::Shutdown);
        let join = lock(&self.join).take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// 用意した chunk を返し、その後は `tail` に従う
    struct ScriptedStream {
        chunks: Mutex<VecDeque<OperatorListChunk>>,
        tail: Tail,
        cancels: Arc<AtomicUsize>,
        cancelled: Notify,
    }

    #[derive(Clone)]
    enum Tail {
        End,
        Fail(RemoteError),
        /// cancel されるまで待つ
        Hang,
    }

    #[async_trait]
    impl OperatorListStream for ScriptedStream {
        async fn read(&self) -> Result<Option<OperatorListChunk>, RemoteError> {
            if let Some(chunk) = self.chunks.lock().unwrap().pop_front() {
                return Ok(Some(chunk));
            }
            match &self.tail {
                Tail::End => Ok(None),
                Tail::Fail(err) => Err(err.clone()),
                Tail::Hang => {
                    self.cancelled.notified().await;
                    Err(RemoteError::abort("cancelled"))
                }
            }
        }

        async fn cancel(&self, _reason: RemoteError) -> Result<(), RemoteError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.cancelled.notify_one();
            Ok(())
        }
    }

    struct ScriptedSource {
        chunks: Vec<OperatorListChunk>,
        tail: Tail,
        opens: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(chunks: Vec<OperatorListChunk>, tail: Tail) -> Self {
            Self {
                chunks,
                tail,
                opens: Arc::new(AtomicUsize::new(0)),
                cancels: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl OperatorListSource for ScriptedSource {
        fn open(&self, _view: ViewId, _intent: RenderIntent) -> Result<Arc<dyn OperatorListStream>, RemoteError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedStream {
                chunks: Mutex::new(self.chunks.iter().cloned().collect()),
                tail: self.tail.clone(),
                cancels: Arc::clone(&self.cancels),
                cancelled: Notify::new(),
            }))
        }
    }

    /// 1 回に 1 命令だけ実行して記録する
    struct Recording {
        view: ViewId,
        log: Arc<Mutex<Vec<(ViewId, u32)>>>,
    }

    impl PageSurface for Recording {
        fn priority_weight(&self) -> Option<u32> {
            Some(1)
        }

        fn execute_chunk(&mut self, opcodes: &[u32], _: &[Value], cursor: usize) -> Result<usize, RemoteError> {
            self.log.lock().unwrap().push((self.view, opcodes[cursor]));
            Ok(cursor + 1)
        }
    }

    fn surfaces(n: usize, log: &Arc<Mutex<Vec<(ViewId, u32)>>>) -> Vec<Box<dyn PageSurface>> {
        (0..n)
            .map(|index| {
                Box::new(Recording {
                    view: ViewId::new(index),
                    log: Arc::clone(log),
                }) as Box<dyn PageSurface>
            })
            .collect()
    }

    fn config(grace_ms: u64, idle_ms: u64) -> SessionConfig {
        let mut config = SessionConfig::default_v1();
        config.stream.cancel_grace_ms = grace_ms;
        config.scheduler.idle_timeout_ms = idle_ms;
        config
    }

    fn chunk(opcodes: Vec<u32>, last: bool) -> OperatorListChunk {
        OperatorListChunk::new(opcodes, vec![], last)
    }

    fn visible(indices: &[usize]) -> VisibleViews {
        VisibleViews::new(indices.iter().copied().map(ViewId::new).collect())
    }

    #[tokio::test]
    async fn renders_visible_view_then_goes_idle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(
            vec![chunk(vec![1, 2], false), chunk(vec![3], true)],
            Tail::End,
        ));
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
        let handle = RenderDriver::new(surfaces(1, &log), source, &config(100, 20))
            .unwrap()
            .on_idle(move |views| {
                let _ = idle_tx.send(views.to_vec());
            })
            .spawn();

        handle.update_visibility(visible(&[0]), true).unwrap();
        handle.wait_finished(TaskKey::display(ViewId::new(0))).await.unwrap();

        let drawn: Vec<u32> = log.lock().unwrap().iter().map(|(_, op)| *op).collect();
        assert_eq!(drawn, vec![1, 2, 3]);
        let report = handle.snapshot().await.unwrap();
        assert_eq!(report[0].state, RenderingState::Finished);

        let idle = tokio::time::timeout(Duration::from_secs(1), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(idle, vec![ViewId::new(0)]);
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn rerender_within_grace_reuses_the_stream() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(vec![chunk(vec![1], false)], Tail::Hang));
        let opens = Arc::clone(&source.opens);
        let cancels = Arc::clone(&source.cancels);
        let handle = RenderDriver::new(surfaces(1, &log), source, &config(50, 60_000))
            .unwrap()
            .spawn();
        let key = TaskKey::display(ViewId::new(0));

        handle.update_visibility(visible(&[0]), true).unwrap();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_finished(key).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(key).unwrap();
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());

        // 猶予内の再要求は同じストリームを使う
        handle.update_visibility(visible(&[0]), true).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);

        // 猶予が切れるとストリームは cancel される
        handle.cancel(key).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        handle.update_visibility(visible(&[0]), true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn stream_failure_latches_until_reset() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(
            vec![],
            Tail::Fail(RemoteError::InvalidContent {
                message: "bad xref".into(),
            }),
        ));
        let opens = Arc::clone(&source.opens);
        let handle = RenderDriver::new(surfaces(1, &log), source, &config(100, 60_000))
            .unwrap()
            .spawn();
        let key = TaskKey::display(ViewId::new(0));

        handle.update_visibility(visible(&[0]), true).unwrap();
        let err = handle.wait_finished(key).await.unwrap_err();
        assert!(matches!(err, RenderError::Failed(RemoteError::InvalidContent { .. })));

        // 失敗した view は選び直されない
        handle.update_visibility(visible(&[0]), true).unwrap();
        let report = handle.snapshot().await.unwrap();
        assert_eq!(report[0].state, RenderingState::Finished);
        assert!(report[0].error.is_some());
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        handle.reset(ViewId::new(0)).unwrap();
        let _ = handle.wait_finished(key).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        handle.shutdown_and_join().await;
    }

    /// endpoint が閉じたあとの source
    struct ClosedSource;

    impl OperatorListSource for ClosedSource {
        fn open(&self, _view: ViewId, _intent: RenderIntent) -> Result<Arc<dyn OperatorListStream>, RemoteError> {
            Err(RemoteError::abort("endpoint is destroyed"))
        }
    }

    #[tokio::test]
    async fn abort_while_opening_is_a_cancellation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = RenderDriver::new(surfaces(1, &log), Arc::new(ClosedSource), &config(100, 60_000))
            .unwrap()
            .spawn();
        let key = TaskKey::display(ViewId::new(0));

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_finished(key).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.update_visibility(visible(&[0]), true).unwrap();

        assert_eq!(waiter.await.unwrap(), Err(RenderError::Cancelled(key)));
        let report = handle.snapshot().await.unwrap();
        assert_eq!(report[0].state, RenderingState::Initial);
        assert_eq!(report[0].error, None);
        assert!(report[0].cancelled);
        handle.shutdown_and_join().await;
    }

    /// 最初の命令で `Abort` を返す surface
    struct Detached;

    impl PageSurface for Detached {
        fn priority_weight(&self) -> Option<u32> {
            Some(1)
        }

        fn execute_chunk(&mut self, _: &[u32], _: &[Value], _: usize) -> Result<usize, RemoteError> {
            Err(RemoteError::abort("canvas detached"))
        }
    }

    #[tokio::test]
    async fn surface_abort_cancels_without_latching() {
        let source = Arc::new(ScriptedSource::new(vec![chunk(vec![1, 2], false)], Tail::Hang));
        let cancels = Arc::clone(&source.cancels);
        let handle = RenderDriver::new(vec![Box::new(Detached)], source, &config(20, 60_000))
            .unwrap()
            .spawn();
        let key = TaskKey::display(ViewId::new(0));

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_finished(key).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.update_visibility(visible(&[0]), true).unwrap();

        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        let report = handle.snapshot().await.unwrap();
        assert_eq!(report[0].state, RenderingState::Initial);
        assert_eq!(report[0].error, None);
        // 猶予が切れたらストリームも止まる
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn cancelling_the_highest_moves_on_to_the_next_visible_view() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(vec![chunk(vec![5], false)], Tail::Hang));
        let handle = RenderDriver::new(surfaces(2, &log), source, &config(100, 60_000))
            .unwrap()
            .spawn();
        let (first, second) = (ViewId::new(0), ViewId::new(1));

        handle.update_visibility(visible(&[0, 1]), true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(TaskKey::display(first)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = handle.snapshot().await.unwrap();
        assert_eq!(report[0].state, RenderingState::Initial);
        assert_eq!(report[1].state, RenderingState::Running);
        assert!(log.lock().unwrap().contains(&(second, 5)));

        // 見えている view が更新されれば cancel した view も再び選ばれる
        handle.update_visibility(visible(&[0, 1]), true).unwrap();
        let report = handle.snapshot().await.unwrap();
        assert_eq!(report[0].state, RenderingState::Running);
        assert_eq!(report[1].state, RenderingState::Paused);
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn print_renders_off_screen_views() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(vec![chunk(vec![7, 8], true)], Tail::End));
        let handle = RenderDriver::new(surfaces(3, &log), source, &config(100, 60_000))
            .unwrap()
            .spawn();

        handle.set_printing(true).unwrap();
        handle.render_print(ViewId::new(2)).await.unwrap();

        let report = handle.snapshot().await.unwrap();
        let print = report
            .iter()
            .find(|r| r.intent == RenderIntent::Print)
            .unwrap();
        assert_eq!(print.view, ViewId::new(2));
        assert_eq!(print.state, RenderingState::Finished);
        // display 側は何も始まっていない
        assert!(report
            .iter()
            .filter(|r| r.intent == RenderIntent::Display)
            .all(|r| r.state == RenderingState::Initial));

        let missing = handle.render_print(ViewId::new(9)).await;
        assert!(matches!(missing, Err(RenderError::Failed(_))));
        handle.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_waiters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = Arc::new(ScriptedSource::new(vec![], Tail::Hang));
        let cancels = Arc::clone(&source.cancels);
        let handle = RenderDriver::new(surfaces(1, &log), source, &config(100, 60_000))
            .unwrap()
            .spawn();
        let key = TaskKey::display(ViewId::new(0));

        handle.update_visibility(visible(&[0]), true).unwrap();
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_finished(key).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        handle.shutdown_and_join().await;
        assert!(waiter.await.unwrap().unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(handle.update_from_surfaces(true).is_err());
    }

    #[test]
    fn too_many_views_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = SessionConfig::default_v1();
        config.scheduler.max_views = 2;
        let source = Arc::new(ScriptedSource::new(vec![], Tail::End));
        assert!(RenderDriver::new(surfaces(3, &log), source, &config).is_err());
    }
}
