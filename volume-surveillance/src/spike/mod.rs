//! Spike scoring, classification and emission.

use crate::{baseline::BaselineStats, window::RollingWindow};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// [`SpikeDetector`](detector::SpikeDetector): per-entity episode tracking, cooldown and history.
pub mod detector;

/// Severity scoring of a single reading against a baseline.
pub mod score;

/// Per-entity spike episode state machine.
pub mod state;

/// Aggregated views over emitted spike events.
pub mod summary;

/// Ordinal classification of how far a reading deviates from its baseline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Deserialize, Serialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpikeSeverity {
    #[display("LOW")]
    Low,
    #[display("MEDIUM")]
    Medium,
    #[display("HIGH")]
    High,
    #[display("CRITICAL")]
    Critical,
}

impl SpikeSeverity {
    pub const ALL: [SpikeSeverity; 4] = [
        SpikeSeverity::Low,
        SpikeSeverity::Medium,
        SpikeSeverity::High,
        SpikeSeverity::Critical,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpikeDirection {
    #[default]
    #[display("UP")]
    Up,
    #[display("DOWN")]
    Down,
}

/// Temporal shape of a spike episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpikeType {
    /// First, isolated qualifying point.
    #[display("MOMENTARY")]
    Momentary,
    /// Second point arriving within one sampling interval of the first.
    #[display("SUDDEN")]
    Sudden,
    /// Points accumulating with wider gaps, still within the episode's max gap.
    #[display("GRADUAL")]
    Gradual,
    /// Enough points over a long enough episode.
    #[display("SUSTAINED")]
    Sustained,
}

/// Immutable record of one emitted spike alert.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpikeEvent {
    pub entity_id: SmolStr,
    pub timestamp: DateTime<Utc>,
    pub current_volume: f64,
    pub baseline_average: f64,
    pub baseline_std_dev: f64,
    pub z_score: f64,
    /// `current_volume / baseline_average`; infinite for a zero baseline.
    pub percentage_of_baseline: f64,
    pub severity: SpikeSeverity,
    pub direction: SpikeDirection,
    pub spike_type: SpikeType,
    pub window: RollingWindow,
    /// Position of this reading inside its episode (1 = first point).
    pub consecutive_points: u32,
}

/// Optional fields of [`SpikeDetector::detect_spike`](detector::SpikeDetector::detect_spike).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct DetectOptions {
    /// Logical time of the reading; wall clock when absent.
    pub timestamp: Option<DateTime<Utc>>,
    /// Baseline window; the configured primary window when absent.
    pub window: Option<RollingWindow>,
    /// Emit even if the entity is inside its cooldown.
    pub bypass_cooldown: bool,
}

impl DetectOptions {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn with_window(mut self, window: RollingWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn bypass_cooldown(mut self) -> Self {
        self.bypass_cooldown = true;
        self
    }
}

/// Outcome of scoring one reading.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpikeResult {
    pub entity_id: SmolStr,
    pub is_spike: bool,
    /// The emitted event, `None` for non-spikes and for spikes inside the cooldown.
    pub spike_event: Option<SpikeEvent>,
    pub baseline: BaselineStats,
    pub z_score: f64,
    pub percentage_of_baseline: f64,
    pub severity: Option<SpikeSeverity>,
    pub direction: SpikeDirection,
    pub spike_type: Option<SpikeType>,
    /// A spike was found but its emission was withheld by the cooldown.
    pub suppressed: bool,
}

impl SpikeResult {
    /// Conservative non-spike result for readings that could not be scored.
    pub fn unscored(entity_id: &str, baseline: BaselineStats) -> Self {
        Self {
            entity_id: SmolStr::new(entity_id),
            is_spike: false,
            spike_event: None,
            baseline,
            z_score: 0.0,
            percentage_of_baseline: 0.0,
            severity: None,
            direction: SpikeDirection::Up,
            spike_type: None,
            suppressed: false,
        }
    }
}

/// One entry of [`SpikeDetector::batch_detect_spikes`](detector::SpikeDetector::batch_detect_spikes).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchEntry {
    pub entity_id: SmolStr,
    pub volume: f64,
    #[serde(default)]
    pub options: DetectOptions,
}

impl BatchEntry {
    pub fn new(entity_id: impl Into<SmolStr>, volume: f64, options: DetectOptions) -> Self {
        Self {
            entity_id: entity_id.into(),
            volume,
            options,
        }
    }
}

/// Results of a batch, in input order, plus the entities that produced a spike.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct BatchResult {
    pub results: indexmap::IndexMap<SmolStr, SpikeResult>,
    pub spiking: Vec<SmolStr>,
}

impl BatchResult {
    pub(crate) fn push(&mut self, result: SpikeResult) {
        if result.is_spike && !self.spiking.contains(&result.entity_id) {
            self.spiking.push(result.entity_id.clone());
        }
        self.results.insert(result.entity_id.clone(), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_serde_label() {
        struct TestCase {
            display: String,
            json: String,
            expected: &'static str,
        }

        let tests = vec![
            TestCase {
                // TC0: severity
                display: SpikeSeverity::Critical.to_string(),
                json: serde_json::to_string(&SpikeSeverity::Critical).unwrap(),
                expected: "CRITICAL",
            },
            TestCase {
                // TC1: direction
                display: SpikeDirection::Down.to_string(),
                json: serde_json::to_string(&SpikeDirection::Down).unwrap(),
                expected: "DOWN",
            },
            TestCase {
                // TC2: shape
                display: SpikeType::Sustained.to_string(),
                json: serde_json::to_string(&SpikeType::Sustained).unwrap(),
                expected: "SUSTAINED",
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.display, test.expected, "TC{} failed", index);
            assert_eq!(test.json, format!("\"{}\"", test.expected), "TC{} failed", index);
        }

        let labels: Vec<String> = SpikeSeverity::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(labels, vec!["LOW", "MEDIUM", "HIGH", "CRITICAL"]);
    }
}
