//! Transport port - 2 つの endpoint をつなぐ順序付きチャネル
//!
//! # 前提
//! - 1 リンク上では FIFO で届く
//! - `recv` を呼ぶのは endpoint の read loop だけ（1 reader）
//! - 送信は同期。失敗したらその場で `TransportError` を返す

use async_trait::async_trait;

use crate::domain::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to decode envelope: {0}")]
    Decode(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Transport は envelope を相手側へ運ぶ
///
/// # 使用例
/// ```ignore
/// let (host_port, worker_port) = LoopbackChannel::new();
/// host_port.post_message(&Envelope::notification("host-a", "worker-a", "Ready", json!(null)))?;
/// let received = worker_port.recv().await;
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    fn post_message(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// 次の envelope を待つ。`None` は相手側が閉じたことを表す。
    ///
    /// 壊れたメッセージは `Some(Err(..))` で返し、チャネル自体は生きたまま。
    async fn recv(&self) -> Option<Result<Envelope, TransportError>>;

    fn close(&self);
}
