//! RenderingQueue - 優先度つき描画スケジューラ（同期コア）
//!
//! I/O もタイマーも持たない。呼び出し側（`RenderDriver`）が入力を渡し、
//! 返ってきた `Effect` を実行する。
//!
//! # 優先度の決め方（display intent）
//! 1. 見えている view のうち、まだ Finished でない最初のもの（見えている順）
//! 2. 下方向にスクロール中なら、最後に見えている view の次
//! 3. 上方向なら、最初に見えている view の前
//! 4. どれも無ければ idle（猶予のあとで idle callback）
//!
//! cancel された display タスクの view は、次に見えている view が更新されるか
//! reset されるまで選ばない。
//!
//! # 実行
//! ready キューから 1 つ取り出して 1 バッチだけ実行する。display タスクは実行前に
//! 「自分が最優先か」を確かめ、違えば Paused になる（これは任意ではなく必須）。
//! print タスクはこの判定を受けない。

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use super::render_task::{RenderTask, StepOutcome, TaskKey};
use crate::domain::{OperatorList, RemoteError, RenderIntent, RenderingState, ViewId};
use crate::ports::PageSurface;

/// 今見えている view の集合
///
/// `views` は優先して描く順、`first` / `last` は画面上の位置で最初と最後。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisibleViews {
    views: Vec<ViewId>,
    first: Option<ViewId>,
    last: Option<ViewId>,
}

impl VisibleViews {
    /// 画面上の順に並んだ view から作る（描く順も同じ）
    pub fn new(views: Vec<ViewId>) -> Self {
        Self {
            first: views.first().copied(),
            last: views.last().copied(),
            views,
        }
    }

    /// 画面上の順に並んだ `(view, priority_weight)` から作る
    ///
    /// weight が `None` の view は見えていないものとして落とす。
    /// 描く順は weight の大きい順（同じなら画面上の順）。
    pub fn from_weights(weights: impl IntoIterator<Item = (ViewId, Option<u32>)>) -> Self {
        let positional: Vec<(ViewId, u32)> = weights
            .into_iter()
            .filter_map(|(view, weight)| weight.map(|w| (view, w)))
            .collect();
        let mut ordered = positional.clone();
        ordered.sort_by(|a, b| b.1.cmp(&a.1));
        Self {
            views: ordered.into_iter().map(|(view, _)| view).collect(),
            first: positional.first().map(|(view, _)| *view),
            last: positional.last().map(|(view, _)| *view),
        }
    }

    pub fn views(&self) -> &[ViewId] {
        &self.views
    }

    pub fn first(&self) -> Option<ViewId> {
        self.first
    }

    pub fn last(&self) -> Option<ViewId> {
        self.last
    }

    pub fn contains(&self, view: ViewId) -> bool {
        self.views.contains(&view)
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// scheduler が呼び出し側に頼むこと
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// タスクが Initial から動き出した。operator list を流し始める（または再利用する）
    Draw(TaskKey),
    Resume(TaskKey),
    Pause(TaskKey),
    ScheduleIdle,
    CancelIdle,
}

pub struct RenderingQueue {
    view_count: usize,
    tasks: HashMap<TaskKey, RenderTask>,
    ready: VecDeque<TaskKey>,
    highest: Option<ViewId>,
    /// cancel されたので選ばない view
    held: HashSet<ViewId>,
    printing: bool,
    idle_armed: bool,
}

impl RenderingQueue {
    pub fn new(view_count: usize) -> Self {
        Self {
            view_count,
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            highest: None,
            held: HashSet::new(),
            printing: false,
            idle_armed: false,
        }
    }

    pub fn view_count(&self) -> usize {
        self.view_count
    }

    pub fn task(&self, key: TaskKey) -> Option<&RenderTask> {
        self.tasks.get(&key)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &RenderTask> {
        self.tasks.values()
    }

    /// display タスクの状態（まだ作られていなければ Initial）
    pub fn state(&self, view: ViewId) -> RenderingState {
        self.task(TaskKey::display(view))
            .map_or(RenderingState::Initial, RenderTask::state)
    }

    pub fn error(&self, view: ViewId) -> Option<&RemoteError> {
        self.task(TaskKey::display(view)).and_then(RenderTask::error)
    }

    fn is_selectable(&self, view: ViewId) -> bool {
        !self.state(view).is_finished() && !self.held.contains(&view)
    }

    pub fn highest_priority(&self) -> Option<ViewId> {
        self.highest
    }

    pub fn is_highest_priority(&self, view: ViewId) -> bool {
        self.highest == Some(view)
    }

    pub fn get_highest_priority(&self, visible: &VisibleViews, scrolled_down: bool) -> Option<ViewId> {
        if let Some(view) = visible
            .views()
            .iter()
            .copied()
            .find(|view| self.is_selectable(*view))
        {
            return Some(view);
        }

        let neighbour = if scrolled_down {
            visible
                .last()
                .map(|last| last.index() + 1)
                .filter(|next| *next < self.view_count)
        } else {
            visible
                .first()
                .and_then(|first| first.index().checked_sub(1))
        };
        neighbour
            .map(ViewId::new)
            .filter(|view| self.is_selectable(*view))
    }

    /// 最優先を選び直し、それ以外の Running な display タスクを止める
    pub fn render_highest_priority(&mut self, visible: &VisibleViews, scrolled_down: bool) -> Vec<Effect> {
        let next = self.get_highest_priority(visible, scrolled_down);
        let mut effects = Vec::new();

        let mut to_pause: Vec<TaskKey> = self
            .tasks
            .values()
            .filter(|task| {
                task.key().intent == RenderIntent::Display
                    && task.state() == RenderingState::Running
                    && Some(task.key().view) != next
            })
            .map(RenderTask::key)
            .collect();
        to_pause.sort_by_key(|key| key.view);
        for key in to_pause {
            if self.pause(key) {
                effects.push(Effect::Pause(key));
            }
        }

        self.highest = next;
        match next {
            Some(view) => {
                if self.idle_armed {
                    self.idle_armed = false;
                    effects.push(Effect::CancelIdle);
                }
                effects.extend(self.start_or_resume(TaskKey::display(view)));
            }
            None => {
                if !self.printing && !self.idle_armed {
                    self.idle_armed = true;
                    effects.push(Effect::ScheduleIdle);
                }
            }
        }
        effects
    }

    fn start_or_resume(&mut self, key: TaskKey) -> Option<Effect> {
        let task = self.tasks.entry(key).or_insert_with(|| RenderTask::new(key));
        match task.state() {
            RenderingState::Initial => {
                task.draw();
                self.enqueue(key);
                debug!(task = %key, "render task started");
                Some(Effect::Draw(key))
            }
            RenderingState::Paused => {
                task.resume();
                self.enqueue(key);
                debug!(task = %key, "render task resumed");
                Some(Effect::Resume(key))
            }
            RenderingState::Running => {
                self.enqueue(key);
                None
            }
            RenderingState::Finished => None,
        }
    }

    /// print タスクを始める（優先度判定を受けない）
    ///
    /// すでに Finished なら作り直す。
    pub fn draw_print(&mut self, view: ViewId) -> Option<Effect> {
        let key = TaskKey::print(view);
        if self.task(key).is_some_and(|task| task.state().is_finished()) {
            if let Some(task) = self.tasks.get_mut(&key) {
                task.reset();
            }
        }
        self.start_or_resume(key)
    }

    fn enqueue(&mut self, key: TaskKey) {
        if !self.ready.contains(&key) {
            self.ready.push_back(key);
        }
    }

    fn pause(&mut self, key: TaskKey) -> bool {
        let paused = self.tasks.get_mut(&key).is_some_and(RenderTask::pause);
        if paused {
            self.ready.retain(|k| *k != key);
            debug!(task = %key, "render task paused");
        }
        paused
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// 次に実行するタスク（Running のものだけ）
    pub fn next_ready(&mut self) -> Option<TaskKey> {
        while let Some(key) = self.ready.pop_front() {
            if self.task(key).is_some_and(|task| task.state() == RenderingState::Running) {
                return Some(key);
            }
        }
        None
    }

    /// chunk が届いたので、待っていた Running タスクを積み直す
    pub fn wake(&mut self, key: TaskKey) {
        if self.task(key).is_some_and(|task| task.state() == RenderingState::Running) {
            self.enqueue(key);
        }
    }

    /// 1 バッチ実行する
    ///
    /// display タスクが最優先でなければ実行せずに Paused にして `None`。
    pub fn execute(
        &mut self,
        key: TaskKey,
        list: &OperatorList,
        surface: &mut dyn PageSurface,
    ) -> Option<StepOutcome> {
        if key.intent == RenderIntent::Display && !self.is_highest_priority(key.view) {
            self.pause(key);
            return None;
        }
        let task = self.tasks.get_mut(&key)?;
        let outcome = task.step(list, surface);
        match &outcome {
            StepOutcome::Yield => self.enqueue(key),
            StepOutcome::Waiting => {}
            StepOutcome::Finished => debug!(task = %key, "render task finished"),
            StepOutcome::Failed(err) => debug!(task = %key, error = %err, "render task failed"),
        }
        Some(outcome)
    }

    /// stream 側の失敗をタスクに反映する
    pub fn fail(&mut self, key: TaskKey, err: RemoteError) -> bool {
        match self.tasks.get_mut(&key) {
            Some(task) if task.state().is_active() => {
                task.fail(err);
                self.ready.retain(|k| *k != key);
                true
            }
            _ => false,
        }
    }

    /// 動いていたタスクを止めて Initial に戻す。止めたら `true`。
    pub fn cancel(&mut self, key: TaskKey) -> bool {
        let cancelled = self.tasks.get_mut(&key).is_some_and(RenderTask::cancel);
        if cancelled {
            self.ready.retain(|k| *k != key);
            if key.intent == RenderIntent::Display {
                self.held.insert(key.view);
                if self.highest == Some(key.view) {
                    self.highest = None;
                }
            }
        }
        cancelled
    }

    /// 明示的な再要求: 失敗ラッチや完了を解除して Initial に戻す
    pub fn reset(&mut self, key: TaskKey) {
        if let Some(task) = self.tasks.get_mut(&key) {
            task.reset();
        }
        if key.intent == RenderIntent::Display {
            self.held.remove(&key.view);
        }
        self.ready.retain(|k| *k != key);
    }

    /// 見えている view が更新された: cancel で止めていた view も再び選べるようにする
    pub fn release_held(&mut self) {
        self.held.clear();
    }

    pub fn set_printing(&mut self, printing: bool) -> Option<Effect> {
        self.printing = printing;
        if printing && self.idle_armed {
            self.idle_armed = false;
            return Some(Effect::CancelIdle);
        }
        None
    }

    /// idle タイマーが発火した
    pub fn idle_fired(&mut self) {
        self.idle_armed = false;
    }

    /// Running / Paused のタスク
    pub fn active_tasks(&self) -> Vec<TaskKey> {
        self.tasks
            .values()
            .filter(|task| task.state().is_active())
            .map(RenderTask::key)
            .collect()
    }
}
