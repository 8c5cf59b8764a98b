//! # Volume Surveillance
//! Streaming per-entity volume anomaly detection.
//!
//! A [`BaselineTracker`] maintains sliding-window volume statistics per entity (eg/ per market),
//! and a [`SpikeDetector`] scores each new reading against those statistics, classifies its
//! severity and temporal shape, and emits cooldown-gated [`SpikeEvent`]s.
//!
//! All time computations use caller-supplied timestamps, so detection is deterministic and
//! replayable. Wall clock time is only used when a call omits its timestamp.
//!
//! ## Composition
//! * [`VolumeMonitor`]: one tracker plus one detector, for single-threaded use.
//! * [`ShardedMonitor`]: entities hashed across tokio tasks, each owning a [`VolumeMonitor`].
//! * [`SpikeSink`]: observer receiving [`SpikeNotification`]s (closures, or a bounded channel
//!   via [`ChannelSink`]).

/// Rolling baselines: [`VolumeSample`] buffers, [`BaselineStats`] and the [`BaselineSource`] seam.
pub mod baseline;

/// Tracker, detector and monitor configuration, including environment variable overlays.
pub mod config;

/// Sharded asynchronous engine over [`VolumeMonitor`]s.
pub mod engine;

/// [`ConfigError`] and [`EngineError`].
pub mod error;

/// [`VolumeMonitor`] composition root.
pub mod monitor;

mod recency;

/// Alert delivery: [`SpikeNotification`] and [`SpikeSink`].
pub mod sink;

/// Spike scoring, episode tracking and summaries.
pub mod spike;

/// Supported [`RollingWindow`] lengths.
pub mod window;

pub use baseline::{
    BaselineSource, BaselineStats, SampleOptions, VolumeSample,
    tracker::{BaselineTracker, EntityActivity},
};
pub use config::{
    DetectionMethods, DetectorConfig, MonitorConfig, SeverityThresholds, SustainedConfig,
    TrackerConfig,
};
pub use engine::ShardedMonitor;
pub use error::{ConfigError, EngineError};
pub use monitor::{RecordOptions, VolumeMonitor, VolumeReading};
pub use sink::{ChannelSink, SpikeEpisode, SpikeNotification, SpikeSink};
pub use spike::{
    BatchEntry, BatchResult, DetectOptions, SpikeDirection, SpikeEvent, SpikeResult,
    SpikeSeverity, SpikeType,
    detector::SpikeDetector,
    state::SpikeState,
    summary::{EntityFrequency, SeverityCounts, SpikeSummary},
};
pub use window::RollingWindow;
