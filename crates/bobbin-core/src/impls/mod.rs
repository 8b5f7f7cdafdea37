//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **LoopbackChannel**: 同一プロセス内で host と worker をつなぐ Transport
//!
//! 本物のスレッド/プロセス間チャネルは利用側のクレートが Transport を実装して渡す。

pub mod loopback;

pub use self::loopback::{LoopbackChannel, LoopbackPort};
