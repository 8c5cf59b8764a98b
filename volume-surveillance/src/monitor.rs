use crate::{
    baseline::{
        BaselineStats, SampleOptions,
        tracker::{BaselineTracker, EntityActivity},
    },
    config::{DetectorConfig, MonitorConfig, TrackerConfig},
    error::ConfigError,
    sink::SpikeSink,
    spike::{
        BatchEntry, BatchResult, DetectOptions, SpikeEvent, SpikeResult, detector::SpikeDetector,
        summary::SpikeSummary,
    },
    window::RollingWindow,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Optional fields of [`VolumeMonitor::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RecordOptions {
    /// Logical time of the reading; wall clock when absent.
    pub timestamp: Option<DateTime<Utc>>,
    pub trade_count: Option<u32>,
    /// Baseline window scored against; the detector's primary window when absent.
    pub window: Option<RollingWindow>,
    pub bypass_cooldown: bool,
}

impl RecordOptions {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn with_trade_count(mut self, trade_count: u32) -> Self {
        self.trade_count = Some(trade_count);
        self
    }
}

/// One reading fed through [`VolumeMonitor::batch_record`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VolumeReading {
    pub entity_id: SmolStr,
    pub volume: f64,
    #[serde(default)]
    pub options: RecordOptions,
}

impl VolumeReading {
    pub fn new(entity_id: impl Into<SmolStr>, volume: f64, options: RecordOptions) -> Self {
        Self {
            entity_id: entity_id.into(),
            volume,
            options,
        }
    }
}

/// Owns one [`BaselineTracker`] and the [`SpikeDetector`] reading from it.
#[derive(Debug)]
pub struct VolumeMonitor {
    tracker: BaselineTracker,
    detector: SpikeDetector,
}

impl VolumeMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            tracker: BaselineTracker::new(config.tracker)?,
            detector: SpikeDetector::new(config.detector)?,
        })
    }

    pub fn with_sink<Sink>(mut self, sink: Sink) -> Self
    where
        Sink: SpikeSink + Send + 'static,
    {
        self.detector.set_sink(sink);
        self
    }

    pub fn tracker(&self) -> &BaselineTracker {
        &self.tracker
    }

    pub fn detector(&self) -> &SpikeDetector {
        &self.detector
    }

    /// Record a sample and score it against the baseline at the same logical time.
    pub fn record(&mut self, entity_id: &str, volume: f64, options: RecordOptions) -> SpikeResult {
        let timestamp = options.timestamp.unwrap_or_else(Utc::now);
        let sample = SampleOptions {
            timestamp: Some(timestamp),
            trade_count: options.trade_count,
        };
        // A rejected sample is also rejected by detection
        self.tracker.add_sample(entity_id, volume, sample);

        self.detector.detect_spike(
            &self.tracker,
            entity_id,
            volume,
            DetectOptions {
                timestamp: Some(timestamp),
                window: options.window,
                bypass_cooldown: options.bypass_cooldown,
            },
        )
    }

    pub fn batch_record<Iter>(&mut self, readings: Iter) -> BatchResult
    where
        Iter: IntoIterator<Item = VolumeReading>,
    {
        readings
            .into_iter()
            .fold(BatchResult::default(), |mut batch, reading| {
                batch.push(self.record(&reading.entity_id, reading.volume, reading.options));
                batch
            })
    }

    /// Record a sample without scoring it.
    pub fn add_sample(&mut self, entity_id: &str, volume: f64, options: SampleOptions) -> bool {
        self.tracker.add_sample(entity_id, volume, options)
    }

    /// Score a reading without recording it.
    pub fn detect(&mut self, entity_id: &str, volume: f64, options: DetectOptions) -> SpikeResult {
        self.detector
            .detect_spike(&self.tracker, entity_id, volume, options)
    }

    pub fn batch_detect<Iter>(&mut self, entries: Iter) -> BatchResult
    where
        Iter: IntoIterator<Item = BatchEntry>,
    {
        self.detector.batch_detect_spikes(&self.tracker, entries)
    }

    pub fn baseline(&self, entity_id: &str, window: RollingWindow) -> BaselineStats {
        self.tracker.baseline(entity_id, window)
    }

    pub fn summary(&self) -> SpikeSummary {
        self.detector.summary(&self.tracker)
    }

    /// See [`SpikeDetector::summary_at`].
    pub fn summary_at(&self, frequency_reference: Option<DateTime<Utc>>) -> SpikeSummary {
        self.detector.summary_at(&self.tracker, frequency_reference)
    }

    pub fn recent_spikes(&self, limit: usize) -> Vec<SpikeEvent> {
        self.detector.recent_spikes(limit)
    }

    pub fn is_in_spike_state(&self, entity_id: &str) -> bool {
        self.detector.is_in_spike_state(entity_id)
    }

    pub fn activity(&self, entity_id: &str) -> Option<EntityActivity> {
        self.tracker.activity(entity_id)
    }

    /// Forget everything held for an entity in both the tracker and the detector.
    pub fn clear_entity(&mut self, entity_id: &str) -> bool {
        let tracked = self.tracker.clear_entity(entity_id);
        let detected = self.detector.clear_entity(entity_id);
        tracked || detected
    }

    pub fn clear(&mut self) {
        self.tracker.clear();
        self.detector.clear();
    }

    pub fn update_tracker_config(&mut self, config: TrackerConfig) -> Result<(), ConfigError> {
        self.tracker.update_config(config)
    }

    pub fn update_detector_config(&mut self, config: DetectorConfig) -> Result<(), ConfigError> {
        self.detector.update_config(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn monitor() -> VolumeMonitor {
        VolumeMonitor::new(MonitorConfig {
            tracker: TrackerConfig {
                min_samples: 10,
                min_density: 0.1,
                ..Default::default()
            },
            detector: DetectorConfig {
                cooldown_ms: 0,
                ..Default::default()
            },
        })
        .unwrap()
    }

    // Alternating 90 / 110 gives mean 100 and std 10
    fn warm_up(monitor: &mut VolumeMonitor, entity_id: &str, samples: i64) {
        for index in 0..samples {
            let volume = if index % 2 == 0 { 90.0 } else { 110.0 };
            let result = monitor.record(entity_id, volume, RecordOptions::at(t(index * 60)));
            assert!(!result.is_spike, "warm up reading {} spiked", index);
        }
    }

    #[test]
    fn test_record_detects_spike_after_warm_up() {
        let mut monitor = monitor();

        // Too few samples to trust the baseline
        let early = monitor.record("market", 10_000.0, RecordOptions::at(t(0)));
        assert!(!early.is_spike);
        assert!(!early.baseline.is_reliable);
        monitor.clear_entity("market");

        warm_up(&mut monitor, "market", 40);
        let actual = monitor.record(
            "market",
            1_000.0,
            RecordOptions::at(t(40 * 60)).with_trade_count(12),
        );

        assert!(actual.is_spike);
        assert!(actual.baseline.is_reliable);
        assert!(actual.spike_event.is_some());
        assert!(monitor.is_in_spike_state("market"));

        let activity = monitor.activity("market").unwrap();
        assert_eq!(activity.samples_recorded, 41);
        assert_eq!(activity.trade_count, 12);
    }

    #[test]
    fn test_clear_entity_resets_tracker_and_detector() {
        let mut monitor = monitor();
        warm_up(&mut monitor, "market", 40);
        monitor.record("market", 1_000.0, RecordOptions::at(t(40 * 60)));
        assert!(monitor.is_in_spike_state("market"));

        assert!(monitor.clear_entity("market"));

        assert!(!monitor.is_in_spike_state("market"));
        assert!(monitor.activity("market").is_none());
        assert!(!monitor.baseline("market", RollingWindow::OneHour).is_reliable);
        assert!(monitor.recent_spikes(10).is_empty());
    }

    #[test]
    fn test_batch_record_keeps_entities_independent() {
        let mut monitor = monitor();
        warm_up(&mut monitor, "a", 40);
        warm_up(&mut monitor, "b", 40);

        let batch = monitor.batch_record(vec![
            VolumeReading::new("a", 1_000.0, RecordOptions::at(t(40 * 60))),
            VolumeReading::new("b", 100.0, RecordOptions::at(t(40 * 60))),
        ]);

        assert_eq!(batch.spiking, vec!["a"]);
        assert!(!batch.results["b"].is_spike);
        assert!(!monitor.is_in_spike_state("b"));

        let summary = monitor.summary();
        assert_eq!(summary.tracked_entities, 2);
        assert_eq!(summary.entities_in_spike, 1);
    }

    #[test]
    fn test_detect_does_not_record() {
        let mut monitor = monitor();
        warm_up(&mut monitor, "market", 40);

        let actual = monitor.detect("market", 1_000.0, DetectOptions::at(t(40 * 60)));

        assert!(actual.is_spike);
        assert_eq!(monitor.activity("market").unwrap().samples_recorded, 40);
    }
}
