//! State - 描画タスクの状態
//!
//! # 状態遷移
//! - Initial --draw()--> Running
//! - Running --(最優先でない)--> Paused --resume()--> Running
//! - Running --(作業カーソルが末尾 かつ producer が close 済み)--> Finished
//! - Finished 以外からは cancel で Initial に戻る（キャンセルは失敗ではない）

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RenderingState {
    Initial,
    Running,
    Paused,
    Finished,
}

impl RenderingState {
    pub fn is_finished(self) -> bool {
        matches!(self, RenderingState::Finished)
    }

    /// Running / Paused のどちらか（描画タスクが生きている）
    pub fn is_active(self) -> bool {
        matches!(self, RenderingState::Running | RenderingState::Paused)
    }
}

/// Rendering intent: one operator list and one task per view per intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderIntent {
    Display,
    Print,
}

impl RenderIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderIntent::Display => "display",
            RenderIntent::Print => "print",
        }
    }
}

impl std::fmt::Display for RenderIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
