//! Envelope - channel を流れる 1 メッセージ
//!
//! 1 つの envelope は次のどれか 1 つを表す:
//! - 通知 / 呼び出し / stream 開始（`action` あり）
//! - 呼び出しの返信（`isReply: true`）
//! - stream 制御（`stream` あり）
//!
//! wire 上は camelCase の JSON object。未設定のフィールドは出力しない。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RemoteError, WireError};
use super::ids::{CallId, StreamId};

/// stream 制御メッセージの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Enqueue,
    Close,
    Error,
    Pull,
    PullComplete,
    Cancel,
    CancelComplete,
    StartComplete,
}

impl StreamKind {
    /// 生産側（sink）が受け取る種類か
    pub fn is_for_sink(self) -> bool {
        matches!(self, StreamKind::Pull | StreamKind::Cancel)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub source_id: String,
    pub target_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_reply: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_size: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl Envelope {
    fn addressed(source: &str, target: &str) -> Self {
        Self {
            source_id: source.to_string(),
            target_id: target.to_string(),
            ..Self::default()
        }
    }

    /// Fire-and-forget notification.
    pub fn notification(source: &str, target: &str, action: &str, data: Value) -> Self {
        Self {
            action: Some(action.to_string()),
            data: Some(data),
            ..Self::addressed(source, target)
        }
    }

    pub fn call(source: &str, target: &str, action: &str, call_id: CallId, data: Value) -> Self {
        Self {
            call_id: Some(call_id),
            ..Self::notification(source, target, action, data)
        }
    }

    /// Stream-opening envelope carrying the consumer's initial credit.
    pub fn open_stream(
        source: &str,
        target: &str,
        action: &str,
        stream_id: StreamId,
        data: Value,
        desired_size: f64,
    ) -> Self {
        Self {
            stream_id: Some(stream_id),
            desired_size: Some(desired_size),
            ..Self::notification(source, target, action, data)
        }
    }

    pub fn reply(source: &str, target: &str, call_id: CallId, result: Result<Value, RemoteError>) -> Self {
        let mut env = Self {
            call_id: Some(call_id),
            is_reply: Some(true),
            ..Self::addressed(source, target)
        };
        match result {
            Ok(data) => env.data = Some(data),
            Err(err) => env.error = Some(err.to_wire()),
        }
        env
    }

    /// Stream-control envelope without payload.
    pub fn stream_control(source: &str, target: &str, kind: StreamKind, stream_id: StreamId) -> Self {
        Self {
            stream: Some(kind),
            stream_id: Some(stream_id),
            ..Self::addressed(source, target)
        }
    }

    /// `*_complete` envelope: `success: true` or the failure reason.
    pub fn stream_result(
        source: &str,
        target: &str,
        kind: StreamKind,
        stream_id: StreamId,
        result: Result<(), RemoteError>,
    ) -> Self {
        let mut env = Self::stream_control(source, target, kind, stream_id);
        match result {
            Ok(()) => env.success = Some(true),
            Err(err) => env.error = Some(err.to_wire()),
        }
        env
    }

    pub fn with_chunk(mut self, chunk: Value) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn with_desired_size(mut self, desired_size: f64) -> Self {
        self.desired_size = Some(desired_size);
        self
    }

    pub fn with_error(mut self, err: &RemoteError) -> Self {
        self.error = Some(err.to_wire());
        self
    }

    pub fn is_reply(&self) -> bool {
        self.is_reply == Some(true)
    }

    /// The carried failure, if any, decoded into the recognised taxonomy.
    pub fn remote_error(&self) -> Option<RemoteError> {
        self.error.as_ref().map(RemoteError::from_wire)
    }

    /// `*_complete` の結果。`success` も `error` も無い場合は失敗扱い。
    pub fn completion(&self) -> Result<(), RemoteError> {
        if self.success == Some(true) {
            return Ok(());
        }
        Err(self
            .remote_error()
            .unwrap_or_else(|| RemoteError::unknown("completion without success flag", None)))
    }
}
