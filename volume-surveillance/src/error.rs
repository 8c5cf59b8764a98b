use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operator mistakes detected while validating a [`TrackerConfig`](crate::config::TrackerConfig)
/// or [`DetectorConfig`](crate::config::DetectorConfig).
///
/// These are returned eagerly at construction or `update_config` time, never at detection time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum ConfigError {
    #[error("{method} thresholds must be finite and positive: {values:?}")]
    InvalidThreshold { method: String, values: [f64; 4] },

    #[error("{method} thresholds must be strictly ascending (low < medium < high < critical): {values:?}")]
    ThresholdsNotAscending { method: String, values: [f64; 4] },

    #[error("at least one detection method must be enabled")]
    NoDetectionMethod,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("failed to parse environment variable {key}={value}")]
    InvalidEnv { key: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// All errors generated by the [`ShardedMonitor`](crate::engine::ShardedMonitor).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum EngineError {
    #[error("shard {0} command channel closed")]
    ShardClosed(usize),

    #[error("shard {0} dropped the reply channel")]
    ReplyDropped(usize),

    #[error("rejected configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("shard count must be at least 1")]
    NoShards,
}

impl EngineError {
    /// Determine if an error means the engine can no longer serve requests.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            EngineError::ShardClosed(_) | EngineError::ReplyDropped(_) => true,
            _ => false,
        }
    }
}
