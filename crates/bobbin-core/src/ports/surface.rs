//! Presentation-side ports consumed by the rendering scheduler.
//!
//! - [`PageSurface`]: where operator lists get executed (one per page view)
//! - [`OperatorListSource`] / [`OperatorListStream`]: where operator lists come from

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{OperatorListChunk, RemoteError, RenderIntent, ViewId};

/// PageSurface は 1 ページ分の描画先
///
/// scheduler からしか呼ばれない。surface 側から scheduler を呼び戻す手段は
/// `RenderDriverHandle` 経由の resume（再 enqueue）だけ。
pub trait PageSurface: Send {
    /// `None` なら今は描画できない（非表示）。値が大きいほど優先。
    fn priority_weight(&self) -> Option<u32>;

    /// Execute instructions starting at `cursor` and return the new cursor.
    ///
    /// The surface may stop early (time slice); the scheduler yields and
    /// re-checks priority before calling again.
    fn execute_chunk(
        &mut self,
        opcodes: &[u32],
        args: &[Value],
        cursor: usize,
    ) -> Result<usize, RemoteError>;
}

/// 1 本の operator list ストリーム（consumer 側）
#[async_trait]
pub trait OperatorListStream: Send + Sync {
    /// `Ok(None)` is end-of-stream.
    async fn read(&self) -> Result<Option<OperatorListChunk>, RemoteError>;

    async fn cancel(&self, reason: RemoteError) -> Result<(), RemoteError>;
}

/// OperatorListSource は (view, intent) ごとにストリームを開く
pub trait OperatorListSource: Send + Sync {
    fn open(
        &self,
        view: ViewId,
        intent: RenderIntent,
    ) -> Result<Arc<dyn OperatorListStream>, RemoteError>;
}
