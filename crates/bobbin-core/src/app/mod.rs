//! App - アプリケーション層
//!
//! domain と ports を組み合わせて、プロトコルとスケジューラを実装する。
//!
//! # 主要コンポーネント
//! - **EndpointBuilder / Endpoint**: action の束縛、受信ルーティング、call / notify
//! - **stream**: StreamSink / StreamReader による credit ベースのストリーム
//! - **ObjectCache**: 共有リソース（フォント・画像）の非同期解決キャッシュ
//! - **RenderingQueue / RenderTask**: 優先度つきの描画状態機械（同期コア）
//! - **RenderDriver**: operator list の受信と描画ステップを回す async actor
//! - **DocumentProxy**: host 側でこれらを 1 ドキュメント分まとめるファサード

pub mod actions;
pub mod builder;
pub mod document;
pub mod endpoint;
pub mod object_cache;
pub mod render_driver;
pub mod render_task;
pub mod rendering_queue;
pub mod stream;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use self::builder::{BuildError, Dispatcher, EndpointBuilder, Role};
pub use self::document::{DocumentProxy, EndpointOperatorListSource};
pub use self::endpoint::{CallHandle, Endpoint};
pub use self::object_cache::{ObjectCache, Releasable};
pub use self::render_driver::{IdleCallback, RenderDriver, RenderDriverHandle, ViewReport};
pub use self::render_task::{RenderError, RenderTask, StepOutcome, TaskKey};
pub use self::rendering_queue::{Effect, RenderingQueue, VisibleViews};
pub use self::stream::{QueueingStrategy, StreamReader, StreamSink};

/// poison された lock も中身はそのまま使う（状態は毎回整合した形でしか書かない）
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
