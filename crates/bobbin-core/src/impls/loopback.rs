//! LoopbackChannel - 同一プロセス内の endpoint ペア
//!
//! worker を別スレッドに立てられない環境向けのフォールバック。
//! envelope は毎回 JSON 文字列に直してから渡すので、
//! wire に載らない値はここで落ちる（本物のチャネルと同じ制約）。
//!
//! # 実装詳細
//! - 方向ごとに tokio の unbounded mpsc を 1 本
//! - 送信側は `std::sync::Mutex<Option<Sender>>`。close で drop すると相手の recv が `None` になる
//! - 受信側は read loop だけが触るので `tokio::sync::Mutex`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::Envelope;
use crate::ports::{Transport, TransportError};

pub struct LoopbackChannel;

impl LoopbackChannel {
    /// Create two connected ports.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (LoopbackPort, LoopbackPort) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (LoopbackPort::new(a_tx, b_rx), LoopbackPort::new(b_tx, a_rx))
    }
}

pub struct LoopbackPort {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: AtomicBool,
}

impl LoopbackPort {
    fn new(tx: mpsc::UnboundedSender<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for LoopbackPort {
    fn post_message(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(envelope).map_err(|e| TransportError::Encode(e.to_string()))?;
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Result<Envelope, TransportError>> {
        if self.is_closed() {
            return None;
        }
        let text = self.rx.lock().await.recv().await?;
        Some(serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string())))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        // read loop が recv 中なら lock は取れない。その場合は peer 側の close で終わる
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn envelopes_cross_as_json() {
        let (a, b) = LoopbackChannel::new();
        let env = Envelope::notification("host-x", "worker-x", "Ping", json!({"n": 1}));
        a.post_message(&env).unwrap();

        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got, env);
    }

    #[tokio::test]
    async fn both_directions_are_independent() {
        let (a, b) = LoopbackChannel::new();
        a.post_message(&Envelope::notification("a", "b", "One", json!(1))).unwrap();
        b.post_message(&Envelope::notification("b", "a", "Two", json!(2))).unwrap();

        assert_eq!(b.recv().await.unwrap().unwrap().action.as_deref(), Some("One"));
        assert_eq!(a.recv().await.unwrap().unwrap().action.as_deref(), Some("Two"));
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_peer() {
        let (a, b) = LoopbackChannel::new();
        a.close();

        assert!(b.recv().await.is_none());
        assert_eq!(
            a.post_message(&Envelope::notification("a", "b", "Late", json!(null))),
            Err(TransportError::Closed)
        );
        // close は冪等
        a.close();
        assert!(a.is_closed());
    }
}
