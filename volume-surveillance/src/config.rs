//! Configuration surface for the [`BaselineTracker`](crate::baseline::tracker::BaselineTracker)
//! and [`SpikeDetector`](crate::spike::detector::SpikeDetector).
//!
//! Every struct has a `Default` impl and deserialises with `#[serde(default)]`, so partial JSON
//! configs are accepted. [`MonitorConfig::from_env`] overlays environment variables on top of the
//! defaults. All configs are validated eagerly; a bad value is a [`ConfigError`], never a silent
//! fallback.

use crate::{error::ConfigError, spike::SpikeSeverity, window::RollingWindow};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Four ascending cutoffs (low < medium < high < critical) for one detection method.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl SeverityThresholds {
    /// Standard deviations above the baseline mean.
    pub const Z_SCORE: Self = Self::new(2.0, 2.5, 3.0, 4.0);
    /// Multiples of the baseline mean (1.5 = 150% of baseline).
    pub const PERCENTAGE: Self = Self::new(1.5, 2.0, 3.0, 5.0);
    /// Raw volume, independent of the baseline statistics.
    pub const ABSOLUTE: Self = Self::new(10_000.0, 50_000.0, 100_000.0, 1_000_000.0);

    pub const fn new(low: f64, medium: f64, high: f64, critical: f64) -> Self {
        Self {
            low,
            medium,
            high,
            critical,
        }
    }

    pub fn values(&self) -> [f64; 4] {
        [self.low, self.medium, self.high, self.critical]
    }

    /// Map a score onto the highest tier it reaches, if any.
    pub fn classify(&self, value: f64) -> Option<SpikeSeverity> {
        if value.is_nan() {
            None
        } else if value >= self.critical {
            Some(SpikeSeverity::Critical)
        } else if value >= self.high {
            Some(SpikeSeverity::High)
        } else if value >= self.medium {
            Some(SpikeSeverity::Medium)
        } else if value >= self.low {
            Some(SpikeSeverity::Low)
        } else {
            None
        }
    }

    pub fn validate(&self, method: &str) -> Result<(), ConfigError> {
        let values = self.values();
        if values.iter().any(|value| !value.is_finite() || *value <= 0.0) {
            return Err(ConfigError::InvalidThreshold {
                method: method.to_string(),
                values,
            });
        }
        if !values.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(ConfigError::ThresholdsNotAscending {
                method: method.to_string(),
                values,
            });
        }
        Ok(())
    }
}

/// `secs` as a [`Duration`], if chrono can represent it.
fn try_seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

fn try_minutes(minutes: u64) -> Option<Duration> {
    i64::try_from(minutes).ok().and_then(Duration::try_minutes)
}

fn try_milliseconds(millis: u64) -> Option<Duration> {
    i64::try_from(millis).ok().and_then(Duration::try_milliseconds)
}

fn representable(field: &str, value: u64, span: Option<Duration>) -> Result<Duration, ConfigError> {
    span.ok_or_else(|| ConfigError::invalid(field, format!("{value} is out of range")))
}

/// Reject a zero or unrepresentable duration field.
fn positive_span(field: &str, value: u64, span: Option<Duration>) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be positive"));
    }
    representable(field, value, span)
}

impl FromStr for SeverityThresholds {
    type Err = ();

    /// Parse "low,medium,high,critical", eg/ "2,2.5,3,4".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<f64>().map_err(|_| ()))
            .collect::<Result<Vec<_>, _>>()?;

        match values.as_slice() {
            [low, medium, high, critical] => Ok(Self::new(*low, *medium, *high, *critical)),
            _ => Err(()),
        }
    }
}

/// Which scoring methods contribute to the severity of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionMethods {
    pub z_score: bool,
    pub percentage: bool,
    pub absolute: bool,
}

impl Default for DetectionMethods {
    fn default() -> Self {
        Self {
            z_score: true,
            percentage: true,
            absolute: false,
        }
    }
}

impl DetectionMethods {
    pub fn any(&self) -> bool {
        self.z_score || self.percentage || self.absolute
    }
}

/// Parameters of the per-entity spike episode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SustainedConfig {
    /// Qualifying points an episode needs before it can be `Sustained`.
    pub min_consecutive_points: u32,
    /// A longer silence between qualifying points restarts the episode.
    pub max_gap_minutes: u64,
    /// Minimum episode age before it can be `Sustained`.
    pub min_duration_minutes: u64,
    /// Largest gap for a second point to count as `Sudden` (one sampling interval).
    pub sudden_gap_secs: u64,
}

impl Default for SustainedConfig {
    fn default() -> Self {
        Self {
            min_consecutive_points: 3,
            max_gap_minutes: 5,
            min_duration_minutes: 2,
            sudden_gap_secs: 60,
        }
    }
}

impl SustainedConfig {
    pub fn max_gap(&self) -> Duration {
        try_minutes(self.max_gap_minutes).unwrap_or(Duration::MAX)
    }

    pub fn min_duration(&self) -> Duration {
        try_minutes(self.min_duration_minutes).unwrap_or(Duration::MAX)
    }

    pub fn sudden_gap(&self) -> Duration {
        try_seconds(self.sudden_gap_secs).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_consecutive_points == 0 {
            return Err(ConfigError::invalid(
                "min_consecutive_points",
                "must be at least 1",
            ));
        }
        let max_gap = positive_span(
            "max_gap_minutes",
            self.max_gap_minutes,
            try_minutes(self.max_gap_minutes),
        )?;
        representable(
            "min_duration_minutes",
            self.min_duration_minutes,
            try_minutes(self.min_duration_minutes),
        )?;
        let sudden_gap = representable(
            "sudden_gap_secs",
            self.sudden_gap_secs,
            try_seconds(self.sudden_gap_secs),
        )?;
        if sudden_gap > max_gap {
            return Err(ConfigError::invalid(
                "sudden_gap_secs",
                "must not exceed max_gap_minutes",
            ));
        }
        Ok(())
    }
}

/// Retention and reliability settings of the [`BaselineTracker`](crate::baseline::tracker::BaselineTracker).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Expected cadence of samples, used to derive data density.
    pub sample_interval_secs: u64,
    /// Minimum samples in a window for its baseline to be reliable.
    pub min_samples: usize,
    /// Minimum data density in [0, 1] for a baseline to be reliable.
    pub min_density: f64,
    pub max_samples_per_entity: usize,
    /// Samples older than this (relative to the newest sample) are evicted.
    pub max_sample_age_secs: u64,
    pub max_tracked_entities: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 60,
            min_samples: 10,
            min_density: 0.1,
            max_samples_per_entity: 10_000,
            max_sample_age_secs: RollingWindow::OneDay.secs() as u64,
            max_tracked_entities: 10_000,
        }
    }
}

impl TrackerConfig {
    pub fn sample_interval(&self) -> Duration {
        try_seconds(self.sample_interval_secs).unwrap_or(Duration::MAX)
    }

    pub fn max_sample_age(&self) -> Duration {
        try_seconds(self.max_sample_age_secs).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive_span(
            "sample_interval_secs",
            self.sample_interval_secs,
            try_seconds(self.sample_interval_secs),
        )?;
        if self.min_samples == 0 {
            return Err(ConfigError::invalid("min_samples", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_density) {
            return Err(ConfigError::invalid(
                "min_density",
                format!("{} is outside [0, 1]", self.min_density),
            ));
        }
        if self.max_samples_per_entity == 0 {
            return Err(ConfigError::invalid(
                "max_samples_per_entity",
                "must be positive",
            ));
        }
        positive_span(
            "max_sample_age_secs",
            self.max_sample_age_secs,
            try_seconds(self.max_sample_age_secs),
        )?;
        if self.max_tracked_entities == 0 {
            return Err(ConfigError::invalid(
                "max_tracked_entities",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Scoring, classification, cooldown and history settings of the
/// [`SpikeDetector`](crate::spike::detector::SpikeDetector).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Window used when a detection call does not name one.
    pub primary_window: RollingWindow,
    pub methods: DetectionMethods,
    pub z_score_thresholds: SeverityThresholds,
    pub percentage_thresholds: SeverityThresholds,
    pub absolute_thresholds: SeverityThresholds,
    /// Also score readings far *below* the baseline (volume droughts) via |z|.
    pub detect_drops: bool,
    pub sustained: SustainedConfig,
    /// Minimum time between two emitted events for the same entity.
    pub cooldown_ms: u64,
    pub entity_history_limit: usize,
    pub global_history_limit: usize,
    /// Horizon used to rank the most active entities in a summary.
    pub frequency_window_secs: u64,
    pub summary_recent_limit: usize,
    pub summary_top_entities: usize,
    pub max_tracked_entities: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            primary_window: RollingWindow::OneHour,
            methods: DetectionMethods::default(),
            z_score_thresholds: SeverityThresholds::Z_SCORE,
            percentage_thresholds: SeverityThresholds::PERCENTAGE,
            absolute_thresholds: SeverityThresholds::ABSOLUTE,
            detect_drops: false,
            sustained: SustainedConfig::default(),
            cooldown_ms: 5 * 60 * 1000,
            entity_history_limit: 100,
            global_history_limit: 1_000,
            frequency_window_secs: 60 * 60,
            summary_recent_limit: 10,
            summary_top_entities: 5,
            max_tracked_entities: 10_000,
        }
    }
}

impl DetectorConfig {
    pub fn cooldown(&self) -> Duration {
        try_milliseconds(self.cooldown_ms).unwrap_or(Duration::MAX)
    }

    pub fn frequency_window(&self) -> Duration {
        try_seconds(self.frequency_window_secs).unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.methods.any() {
            return Err(ConfigError::NoDetectionMethod);
        }
        self.z_score_thresholds.validate("z_score")?;
        self.percentage_thresholds.validate("percentage")?;
        self.absolute_thresholds.validate("absolute")?;
        self.sustained.validate()?;

        representable(
            "cooldown_ms",
            self.cooldown_ms,
            try_milliseconds(self.cooldown_ms),
        )?;
        for (field, value) in [
            ("entity_history_limit", self.entity_history_limit),
            ("global_history_limit", self.global_history_limit),
            ("max_tracked_entities", self.max_tracked_entities),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        positive_span(
            "frequency_window_secs",
            self.frequency_window_secs,
            try_seconds(self.frequency_window_secs),
        )?;
        Ok(())
    }
}

/// Tracker and detector configuration of one [`VolumeMonitor`](crate::monitor::VolumeMonitor).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tracker: TrackerConfig,
    pub detector: DetectorConfig,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracker.validate()?;
        self.detector.validate()
    }

    /// Defaults overlaid with any set environment variables, then validated.
    ///
    /// | Variable                    | Field                                  |
    /// |-----------------------------|----------------------------------------|
    /// | `BASELINE_SAMPLE_INTERVAL_SECS` | `tracker.sample_interval_secs`     |
    /// | `BASELINE_MIN_SAMPLES`      | `tracker.min_samples`                  |
    /// | `BASELINE_MIN_DENSITY`      | `tracker.min_density`                  |
    /// | `BASELINE_MAX_SAMPLES`      | `tracker.max_samples_per_entity`       |
    /// | `BASELINE_MAX_AGE_SECS`     | `tracker.max_sample_age_secs`          |
    /// | `MAX_TRACKED_ENTITIES`      | both `max_tracked_entities`            |
    /// | `SPIKE_PRIMARY_WINDOW`      | `detector.primary_window` (eg/ "1h")   |
    /// | `SPIKE_Z_THRESHOLDS`        | `detector.z_score_thresholds`          |
    /// | `SPIKE_PCT_THRESHOLDS`      | `detector.percentage_thresholds`       |
    /// | `SPIKE_ABSOLUTE_THRESHOLDS` | `detector.absolute_thresholds` (enables the method) |
    /// | `SPIKE_DETECT_DROPS`        | `detector.detect_drops`                |
    /// | `SPIKE_COOLDOWN_MS`         | `detector.cooldown_ms`                 |
    /// | `SPIKE_MIN_CONSECUTIVE`     | `detector.sustained.min_consecutive_points` |
    /// | `SPIKE_MAX_GAP_MINUTES`     | `detector.sustained.max_gap_minutes`   |
    /// | `SPIKE_MIN_DURATION_MINUTES`| `detector.sustained.min_duration_minutes` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] but reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let tracker = &mut config.tracker;
        env.apply("BASELINE_SAMPLE_INTERVAL_SECS", &mut tracker.sample_interval_secs)?;
        env.apply("BASELINE_MIN_SAMPLES", &mut tracker.min_samples)?;
        env.apply("BASELINE_MIN_DENSITY", &mut tracker.min_density)?;
        env.apply("BASELINE_MAX_SAMPLES", &mut tracker.max_samples_per_entity)?;
        env.apply("BASELINE_MAX_AGE_SECS", &mut tracker.max_sample_age_secs)?;
        env.apply("MAX_TRACKED_ENTITIES", &mut tracker.max_tracked_entities)?;

        let detector = &mut config.detector;
        env.apply("MAX_TRACKED_ENTITIES", &mut detector.max_tracked_entities)?;
        if let Some(label) = (env.lookup)("SPIKE_PRIMARY_WINDOW") {
            detector.primary_window =
                RollingWindow::parse(&label).ok_or(ConfigError::InvalidEnv {
                    key: "SPIKE_PRIMARY_WINDOW".to_string(),
                    value: label,
                })?;
        }
        env.apply("SPIKE_Z_THRESHOLDS", &mut detector.z_score_thresholds)?;
        env.apply("SPIKE_PCT_THRESHOLDS", &mut detector.percentage_thresholds)?;
        if env.apply("SPIKE_ABSOLUTE_THRESHOLDS", &mut detector.absolute_thresholds)? {
            detector.methods.absolute = true;
        }
        env.apply("SPIKE_DETECT_DROPS", &mut detector.detect_drops)?;
        env.apply("SPIKE_COOLDOWN_MS", &mut detector.cooldown_ms)?;
        env.apply(
            "SPIKE_MIN_CONSECUTIVE",
            &mut detector.sustained.min_consecutive_points,
        )?;
        env.apply(
            "SPIKE_MAX_GAP_MINUTES",
            &mut detector.sustained.max_gap_minutes,
        )?;
        env.apply(
            "SPIKE_MIN_DURATION_MINUTES",
            &mut detector.sustained.min_duration_minutes,
        )?;

        config.validate()?;
        Ok(config)
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Overwrite `field` if `key` is set. Returns whether it was set.
    fn apply<T: FromStr>(&self, key: &str, field: &mut T) -> Result<bool, ConfigError> {
        let Some(value) = (self.lookup)(key) else {
            return Ok(false);
        };

        *field = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
        Ok(true)
    }
}
