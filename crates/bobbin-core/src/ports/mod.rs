//! Ports - 抽象化レイヤー
//!
//! core が外側の世界に求めるインターフェースだけを置く。
//! 実装は `impls`（開発用・テスト用）か、利用側のクレートが持つ。
//!
//! - **Transport**: host と worker をつなぐチャネル
//! - **PageSurface / OperatorListSource**: 描画先と operator list の供給元
//! - **Clock / IdGenerator**: ドキュメント ID の生成

pub mod clock;
pub mod id_generator;
pub mod surface;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::surface::{OperatorListSource, OperatorListStream, PageSurface};
pub use self::transport::{Transport, TransportError};
