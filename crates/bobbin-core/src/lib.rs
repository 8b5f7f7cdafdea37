//! bobbin-core
//!
//! Host/worker messaging and incremental page rendering for a split document renderer.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, errors, state, operator_list）
//! - **ports**: 抽象化レイヤー（Transport, PageSurface, OperatorListSource, Clock, IdGenerator）
//! - **app**: プロトコルとスケジューラ（endpoint, stream, object_cache, rendering_queue, render_driver, document）
//! - **typed**: 型付き action API（Action trait, Handler trait, ActionRegistry, codec）
//! - **impls**: 実装（LoopbackChannel など）
//! - **config** / **error** / **observability**: 設定、エラー型、カウンタ

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod typed;

pub use app::{
    BuildError, CallHandle, Dispatcher, DocumentProxy, Effect, Endpoint, EndpointBuilder,
    ObjectCache, QueueingStrategy, Releasable, RenderDriver, RenderDriverHandle, RenderError,
    RenderTask, RenderingQueue, Role, StreamReader, StreamSink, TaskKey, ViewReport, VisibleViews,
};
pub use config::{SchedulerPolicy, SessionConfig, StreamPolicy};
pub use domain::{
    CallId, DocumentId, Envelope, OperatorList, OperatorListChunk, RemoteError, RenderIntent,
    RenderingState, StreamId, StreamKind, ViewId,
};
pub use error::BobbinError;
pub use impls::{LoopbackChannel, LoopbackPort};
pub use observability::EndpointCounts;
pub use ports::{
    Clock, IdGenerator, OperatorListSource, OperatorListStream, PageSurface, SystemClock,
    Transport, TransportError, UlidGenerator,
};
