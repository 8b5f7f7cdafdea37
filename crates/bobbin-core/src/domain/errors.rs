//! Errors - 境界を越えるエラーの分類
//!
//! host と worker の間で受け渡せるのは、ここで定義した種類だけ。
//! それ以外の失敗は `Unknown` に落としてメッセージだけを運ぶ。
//!
//! # wire 形式
//! ```json
//! { "name": "PasswordRequired", "message": "...", "code": 1 }
//! ```

use serde::{Deserialize, Serialize};

/// Password prompt codes carried by [`RemoteError::PasswordRequired`].
pub mod password {
    pub const NEED_PASSWORD: u32 = 1;
    pub const INCORRECT_PASSWORD: u32 = 2;
}

/// RemoteError は endpoint 間で認識される失敗の分類
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Operation deliberately cancelled.
    #[error("aborted: {message}")]
    Abort { message: String },

    #[error("password required (code={code}): {message}")]
    PasswordRequired { message: String, code: u32 },

    /// Malformed input.
    #[error("invalid content: {message}")]
    InvalidContent { message: String },

    /// The source disappeared.
    #[error("content unavailable: {message}")]
    ContentUnavailable { message: String },

    #[error("unexpected transport response (status={status}): {message}")]
    UnexpectedTransport { message: String, status: u16 },

    #[error("unknown error: {message}")]
    Unknown {
        message: String,
        details: Option<String>,
    },
}

impl RemoteError {
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>, details: Option<String>) -> Self {
        Self::Unknown {
            message: message.into(),
            details,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Abort { .. } => "Abort",
            Self::PasswordRequired { .. } => "PasswordRequired",
            Self::InvalidContent { .. } => "InvalidContent",
            Self::ContentUnavailable { .. } => "ContentUnavailable",
            Self::UnexpectedTransport { .. } => "UnexpectedTransport",
            Self::Unknown { .. } => "Unknown",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Abort { message }
            | Self::PasswordRequired { message, .. }
            | Self::InvalidContent { message }
            | Self::ContentUnavailable { message }
            | Self::UnexpectedTransport { message, .. }
            | Self::Unknown { message, .. } => message,
        }
    }

    /// wire 形式に変換
    pub fn to_wire(&self) -> WireError {
        let mut wire = WireError {
            name: self.name().to_string(),
            message: self.message().to_string(),
            details: None,
            code: None,
            status: None,
        };
        match self {
            Self::PasswordRequired { code, .. } => wire.code = Some(*code),
            Self::UnexpectedTransport { status, .. } => wire.status = Some(*status),
            Self::Unknown { details, .. } => wire.details = details.clone(),
            _ => {}
        }
        wire
    }

    /// wire 形式から復元
    ///
    /// 知らない `name` や、必須フィールドが欠けたものは `Unknown` に落とす。
    /// 元の name は details に残す。
    pub fn from_wire(wire: &WireError) -> Self {
        let message = wire.message.clone();
        match (wire.name.as_str(), wire.code, wire.status) {
            ("Abort", _, _) => Self::Abort { message },
            ("PasswordRequired", Some(code), _) => Self::PasswordRequired { message, code },
            ("InvalidContent", _, _) => Self::InvalidContent { message },
            ("ContentUnavailable", _, _) => Self::ContentUnavailable { message },
            ("UnexpectedTransport", _, Some(status)) => {
                Self::UnexpectedTransport { message, status }
            }
            ("Unknown", _, _) => Self::Unknown {
                message,
                details: wire.details.clone(),
            },
            (other, _, _) => Self::Unknown {
                message,
                details: Some(wire.details.clone().unwrap_or_else(|| other.to_string())),
            },
        }
    }
}

/// WireError は envelope の `error` フィールドの形
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl From<&RemoteError> for WireError {
    fn from(err: &RemoteError) -> Self {
        err.to_wire()
    }
}

impl From<&WireError> for RemoteError {
    fn from(wire: &WireError) -> Self {
        RemoteError::from_wire(wire)
    }
}
