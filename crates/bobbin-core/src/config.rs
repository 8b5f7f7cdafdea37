//! Session configuration.
//!
//! JSON で読めるようにしてあるが、全フィールドにデフォルトがあるので
//! 空の `{}` でも動く。コードからは `default_v1()` を使う。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BobbinError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub stream: StreamPolicy,
    pub scheduler: SchedulerPolicy,
}

impl SessionConfig {
    pub fn default_v1() -> Self {
        Self {
            stream: StreamPolicy::default_v1(),
            scheduler: SchedulerPolicy::default_v1(),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, BobbinError> {
        let config: SessionConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BobbinError> {
        if !(self.stream.high_water_mark.is_finite() && self.stream.high_water_mark > 0.0) {
            return Err(BobbinError::other(format!(
                "stream.high_water_mark must be a positive number (got {})",
                self.stream.high_water_mark
            )));
        }
        if self.scheduler.max_views == 0 {
            return Err(BobbinError::other("scheduler.max_views must be at least 1"));
        }
        Ok(())
    }
}

/// Stream flow-control knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPolicy {
    /// consumer が持つ credit の上限（初回 desiredSize もこの値）
    pub high_water_mark: f64,

    /// 使われなくなった operator list ストリームを実際に cancel するまでの猶予
    pub cancel_grace_ms: u64,
}

impl StreamPolicy {
    pub fn default_v1() -> Self {
        Self {
            high_water_mark: 4.0,
            cancel_grace_ms: 100,
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerPolicy {
    /// 何も描画するものが無くなってから idle callback を呼ぶまで
    pub idle_timeout_ms: u64,

    /// 1 ドキュメントで扱う view 数の上限
    pub max_views: usize,
}

impl SchedulerPolicy {
    pub fn default_v1() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            max_views: 10_000,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}
