use thiserror::Error;

use crate::app::BuildError;
use crate::domain::RemoteError;
use crate::ports::TransportError;
use crate::typed::RegistryError;

#[derive(Debug, Error)]
pub enum BobbinError {
    #[error("handler not found for action={0}")]
    UnknownAction(String),

    #[error("duplicate handler for action={0}")]
    DuplicateAction(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("json codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("object {0} is not resolved yet")]
    NotResolved(String),

    #[error("object cache was cleared while waiting for {0}")]
    CacheCleared(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("{0}")]
    Other(String),
}

impl From<RegistryError> for BobbinError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered(action) => BobbinError::DuplicateAction(action),
        }
    }
}

impl BobbinError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// reply に載せられる形へ変換
    ///
    /// 認識済みの種類はそのまま、それ以外は `Unknown` に落とす。
    pub fn into_remote(self) -> RemoteError {
        match self {
            BobbinError::Remote(err) => err,
            other => RemoteError::unknown(other.to_string(), Some(other.kind_name().to_string())),
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, BobbinError::Remote(err) if err.is_abort())
    }

    fn kind_name(&self) -> &'static str {
        match self {
            BobbinError::UnknownAction(_) => "UnknownAction",
            BobbinError::DuplicateAction(_) => "DuplicateAction",
            BobbinError::Remote(_) => "Remote",
            BobbinError::Transport(_) => "Transport",
            BobbinError::Codec(_) => "Codec",
            BobbinError::Protocol(_) => "Protocol",
            BobbinError::NotResolved(_) => "NotResolved",
            BobbinError::CacheCleared(_) => "CacheCleared",
            BobbinError::Build(_) => "Build",
            BobbinError::Other(_) => "Other",
        }
    }
}
