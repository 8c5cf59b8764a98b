//! Rolling per-entity volume baselines.
//!
//! The [`BaselineTracker`](tracker::BaselineTracker) owns the sample buffers; consumers such as
//! the [`SpikeDetector`](crate::spike::detector::SpikeDetector) only see [`BaselineStats`]
//! snapshots through the [`BaselineSource`] trait.

use crate::window::RollingWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Welford accumulator used to build [`BaselineStats`].
pub mod stats;

/// Sample buffers, eviction and cached baselines per entity.
pub mod tracker;

/// One recorded volume observation for an entity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VolumeSample {
    pub entity_id: SmolStr,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub trade_count: Option<u32>,
}

/// Optional fields of [`BaselineTracker::add_sample`](tracker::BaselineTracker::add_sample).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct SampleOptions {
    /// Logical time of the sample; wall clock when absent.
    pub timestamp: Option<DateTime<Utc>>,
    pub trade_count: Option<u32>,
}

impl SampleOptions {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp: Some(timestamp),
            trade_count: None,
        }
    }

    pub fn with_trade_count(mut self, trade_count: u32) -> Self {
        self.trade_count = Some(trade_count);
        self
    }
}

/// Volume statistics of one entity over one [`RollingWindow`] ending at `reference_time`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct BaselineStats {
    pub window: RollingWindow,
    /// Mean volume per sample inside the window.
    pub average_volume: f64,
    /// Population standard deviation of the sample volumes.
    pub standard_deviation: f64,
    pub sample_count: usize,
    /// Observed ÷ expected samples for the window, capped at 1.
    pub data_density: f64,
    /// `sample_count >= min_samples && data_density >= min_density`.
    pub is_reliable: bool,
    pub reference_time: Option<DateTime<Utc>>,
}

impl BaselineStats {
    /// Explicit "no data" baseline: never reliable.
    pub fn empty(window: RollingWindow) -> Self {
        Self {
            window,
            average_volume: 0.0,
            standard_deviation: 0.0,
            sample_count: 0,
            data_density: 0.0,
            is_reliable: false,
            reference_time: None,
        }
    }
}

/// Read-only access to per-entity baselines.
///
/// Implemented by [`BaselineTracker`](tracker::BaselineTracker). Detection only depends on this
/// trait, so fixed baselines can be injected where a full tracker is not wanted.
pub trait BaselineSource {
    /// Baseline of `entity_id` over `window`, ending at `reference`.
    fn baseline_at(
        &self,
        entity_id: &str,
        window: RollingWindow,
        reference: DateTime<Utc>,
    ) -> BaselineStats;

    /// Number of entities this source currently holds data for.
    fn tracked_entities(&self) -> usize;
}

impl<T> BaselineSource for &T
where
    T: BaselineSource + ?Sized,
{
    fn baseline_at(
        &self,
        entity_id: &str,
        window: RollingWindow,
        reference: DateTime<Utc>,
    ) -> BaselineStats {
        (**self).baseline_at(entity_id, window, reference)
    }

    fn tracked_entities(&self) -> usize {
        (**self).tracked_entities()
    }
}
