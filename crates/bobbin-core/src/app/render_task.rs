//! RenderTask - 1 view × 1 intent の描画タスク
//!
//! 「コールバックで yield/resume する」代わりに、作業カーソルを持つ再開可能な状態として表す。
//! 再開は scheduler の ready キューに積み直すこと。
//!
//! # 状態遷移
//! - Initial --draw()--> Running
//! - Running --pause()--> Paused --resume()--> Running
//! - Running --(カーソルが末尾 かつ operator list が完了)--> Finished
//! - Finished 以外 --cancel()--> Initial（`cancelled` が立つ）
//! - 失敗は Finished + error として残り、`reset()` されるまで再選択されない

use std::fmt;

use crate::domain::{OperatorList, RemoteError, RenderIntent, RenderingState, ViewId};
use crate::ports::PageSurface;

/// タスクの識別子（view × intent）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub view: ViewId,
    pub intent: RenderIntent,
}

impl TaskKey {
    pub fn display(view: ViewId) -> Self {
        Self {
            view,
            intent: RenderIntent::Display,
        }
    }

    pub fn print(view: ViewId) -> Self {
        Self {
            view,
            intent: RenderIntent::Print,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.view, self.intent)
    }
}

/// 描画の結果として呼び出し側に返すエラー
///
/// `Cancelled` は失敗ではない。呼び出し側はエラーとして扱わないこと。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("rendering cancelled: {0}")]
    Cancelled(TaskKey),

    #[error("rendering failed: {0}")]
    Failed(RemoteError),
}

impl RenderError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderError::Cancelled(_))
    }

    /// `Abort` は cancel として、それ以外は本物の失敗として扱う
    pub fn from_remote(key: TaskKey, err: RemoteError) -> Self {
        if err.is_abort() {
            RenderError::Cancelled(key)
        } else {
            RenderError::Failed(err)
        }
    }
}

/// 1 ステップ実行した結果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 進んだが、まだ続きがある。priority を見直してから続ける
    Yield,
    /// 手元の命令は使い切った。次の chunk を待つ
    Waiting,
    Finished,
    Failed(RemoteError),
}

#[derive(Debug, Clone)]
pub struct RenderTask {
    key: TaskKey,
    state: RenderingState,
    cursor: usize,
    cancelled: bool,
    error: Option<RemoteError>,
}

impl RenderTask {
    pub fn new(key: TaskKey) -> Self {
        Self {
            key,
            state: RenderingState::Initial,
            cursor: 0,
            cancelled: false,
            error: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        self.key
    }

    pub fn state(&self) -> RenderingState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn error(&self) -> Option<&RemoteError> {
        self.error.as_ref()
    }

    /// Initial からだけ開始できる
    pub fn draw(&mut self) -> bool {
        if self.state != RenderingState::Initial {
            return false;
        }
        self.state = RenderingState::Running;
        self.cursor = 0;
        self.cancelled = false;
        self.error = None;
        true
    }

    pub fn pause(&mut self) -> bool {
        if self.state != RenderingState::Running {
            return false;
        }
        self.state = RenderingState::Paused;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != RenderingState::Paused {
            return false;
        }
        self.state = RenderingState::Running;
        true
    }

    /// Finished 以外なら Initial に戻して `true`
    pub fn cancel(&mut self) -> bool {
        if self.state == RenderingState::Finished {
            return false;
        }
        let was_active = self.state.is_active();
        self.state = RenderingState::Initial;
        self.cursor = 0;
        self.cancelled = was_active;
        was_active
    }

    /// 明示的な再要求: 失敗や完了を忘れて Initial に戻す
    pub fn reset(&mut self) {
        self.state = RenderingState::Initial;
        self.cursor = 0;
        self.cancelled = false;
        self.error = None;
    }

    pub fn fail(&mut self, err: RemoteError) {
        self.state = RenderingState::Finished;
        self.error = Some(err);
    }

    /// 使える命令を 1 バッチ実行する
    ///
    /// Running 以外では何もしない（`Waiting` を返す）。surface の `Abort` では
    /// 失敗を記録せず Running のまま `Failed` を返す。
    pub fn step(&mut self, list: &OperatorList, surface: &mut dyn PageSurface) -> StepOutcome {
        if self.state != RenderingState::Running {
            return StepOutcome::Waiting;
        }
        if self.cursor < list.len() {
            let next = match surface.execute_chunk(list.opcodes(), list.args(), self.cursor) {
                Ok(next) => next,
                // Abort は cancel 扱いなので呼び出し側が Initial に戻す
                Err(err) if err.is_abort() => return StepOutcome::Failed(err),
                Err(err) => {
                    self.fail(err.clone());
                    return StepOutcome::Failed(err);
                }
            };
            if next <= self.cursor || next > list.len() {
                let err = RemoteError::unknown(
                    format!(
                        "surface returned cursor {next} (was {}, list has {})",
                        self.cursor,
                        list.len()
                    ),
                    None,
                );
                self.fail(err.clone());
                return StepOutcome::Failed(err);
            }
            self.cursor = next;
            if self.cursor < list.len() || !list.is_complete() {
                return StepOutcome::Yield;
            }
        }

        if list.is_complete() {
            self.state = RenderingState::Finished;
            StepOutcome::Finished
        } else {
            StepOutcome::Waiting
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OperatorListChunk;
    use serde_json::Value;

    /// 1 回に最大 `batch` 命令だけ実行する surface
    struct Batched {
        batch: usize,
        executed: Vec<u32>,
    }

    impl PageSurface for Batched {
        fn priority_weight(&self) -> Option<u32> {
            Some(1)
        }

        fn execute_chunk(
            &mut self,
            opcodes: &[u32],
            _args: &[Value],
            cursor: usize,
        ) -> Result<usize, RemoteError> {
            let end = (cursor + self.batch).min(opcodes.len());
            self.executed.extend_from_slice(&opcodes[cursor..end]);
            Ok(end)
        }
    }

    fn list(opcodes: Vec<u32>, last: bool) -> OperatorList {
        let mut list = OperatorList::new();
        let args = vec![Value::Null; opcodes.len()];
        list.append(OperatorListChunk::new(opcodes, args, last));
        list
    }

    #[test]
    fn runs_in_batches_until_complete() {
        let mut task = RenderTask::new(TaskKey::display(ViewId::new(0)));
        let mut surface = Batched {
            batch: 2,
            executed: Vec::new(),
        };
        let ops = list(vec![1, 2, 3], true);

        assert!(task.draw());
        assert_eq!(task.step(&ops, &mut surface), StepOutcome::Yield);
        assert_eq!(task.step(&ops, &mut surface), StepOutcome::Finished);
        assert_eq!(task.state(), RenderingState::Finished);
        assert_eq!(surface.executed, vec![1, 2, 3]);
    }

    #[test]
    fn waits_for_more_chunks_when_stream_is_open() {
        let mut task = RenderTask::new(TaskKey::display(ViewId::new(1)));
        let mut surface = Batched {
            batch: 10,
            executed: Vec::new(),
        };
        let mut ops = list(vec![1, 2], false);

        task.draw();
        assert_eq!(task.step(&ops, &mut surface), StepOutcome::Yield);
        assert_eq!(task.step(&ops, &mut surface), StepOutcome::Waiting);

        ops.append(OperatorListChunk::new(vec![3], vec![Value::Null], true));
        assert_eq!(task.step(&ops, &mut surface), StepOutcome::Finished);
        assert_eq!(task.cursor(), 3);
    }

    #[test]
    fn cancel_returns_to_initial_but_not_after_finish() {
        let mut task = RenderTask::new(TaskKey::print(ViewId::new(2)));
        task.draw();
        assert!(task.pause());
        assert!(task.cancel());
        assert_eq!(task.state(), RenderingState::Initial);
        assert!(task.was_cancelled());

        task.draw();
        let mut surface = Batched {
            batch: 5,
            executed: Vec::new(),
        };
        task.step(&list(vec![9], true), &mut surface);
        assert!(!task.cancel());
        assert_eq!(task.state(), RenderingState::Finished);
    }

    #[test]
    fn non_advancing_surface_is_a_failure() {
        struct Stuck;
        impl PageSurface for Stuck {
            fn priority_weight(&self) -> Option<u32> {
                None
            }
            fn execute_chunk(&mut self, _: &[u32], _: &[Value], cursor: usize) -> Result<usize, RemoteError> {
                Ok(cursor)
            }
        }

        let mut task = RenderTask::new(TaskKey::display(ViewId::new(0)));
        task.draw();
        let outcome = task.step(&list(vec![1], true), &mut Stuck);
        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert!(task.error().is_some());
        assert_eq!(task.state(), RenderingState::Finished);
    }

    #[test]
    fn abort_maps_to_cancelled() {
        let key = TaskKey::display(ViewId::new(4));
        assert!(RenderError::from_remote(key, RemoteError::abort("gone")).is_cancelled());
        assert!(!RenderError::from_remote(key, RemoteError::unknown("x", None)).is_cancelled());
    }
}
