use super::{BaselineSource, BaselineStats, SampleOptions, VolumeSample, stats::RunningStats};
use crate::{
    config::TrackerConfig, error::ConfigError, recency::RecencyIndex, window::RollingWindow,
};
use chrono::{DateTime, Duration, Utc};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::debug;

/// Lifetime counters of one tracked entity. Zeroed by [`BaselineTracker::clear_entity`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct EntityActivity {
    /// Samples accepted since the entity was first seen (including evicted ones).
    pub samples_recorded: u64,
    /// Samples currently buffered.
    pub samples_buffered: usize,
    pub trade_count: u64,
    pub total_volume: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl EntityActivity {
    fn new(time: DateTime<Utc>) -> Self {
        Self {
            samples_recorded: 0,
            samples_buffered: 0,
            trade_count: 0,
            total_volume: 0.0,
            first_seen: time,
            last_seen: time,
        }
    }
}

#[derive(Debug)]
struct EntitySamples {
    // Ordered by timestamp, oldest first
    samples: VecDeque<VolumeSample>,
    activity: EntityActivity,
    // Computed baselines keyed by window; an entry only answers queries for its reference_time
    cache: Mutex<FnvHashMap<RollingWindow, BaselineStats>>,
}

impl EntitySamples {
    fn new(time: DateTime<Utc>) -> Self {
        Self {
            samples: VecDeque::new(),
            activity: EntityActivity::new(time),
            cache: Mutex::new(FnvHashMap::default()),
        }
    }

    fn insert(&mut self, sample: VolumeSample) {
        self.activity.samples_recorded += 1;
        self.activity.trade_count += u64::from(sample.trade_count.unwrap_or(0));
        self.activity.total_volume += sample.volume;
        self.activity.first_seen = self.activity.first_seen.min(sample.timestamp);
        self.activity.last_seen = self.activity.last_seen.max(sample.timestamp);

        // Appending is the common case; late samples are placed in order
        let position = self
            .samples
            .partition_point(|existing| existing.timestamp <= sample.timestamp);
        if position == self.samples.len() {
            self.samples.push_back(sample);
        } else {
            self.samples.insert(position, sample);
        }

        self.cache.get_mut().clear();
    }

    /// Trim to the count cap, then drop samples older than `max_age` before the newest sample.
    fn evict(&mut self, max_samples: usize, max_age: Duration) -> usize {
        let before = self.samples.len();

        while self.samples.len() > max_samples {
            self.samples.pop_front();
        }

        // Ages too long to subtract from the newest timestamp keep everything
        let cutoff = self
            .newest()
            .and_then(|newest| newest.checked_sub_signed(max_age));
        if let Some(cutoff) = cutoff {
            while let Some(front) = self.samples.front() {
                if front.timestamp < cutoff {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }

        self.activity.samples_buffered = self.samples.len();
        let evicted = before - self.samples.len();
        if evicted > 0 {
            self.cache.get_mut().clear();
        }
        evicted
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|sample| sample.timestamp)
    }

    fn compute(
        &self,
        window: RollingWindow,
        reference: DateTime<Utc>,
        config: &TrackerConfig,
    ) -> BaselineStats {
        let cutoff = reference.checked_sub_signed(window.duration());

        // Window is (reference - window, reference]
        let stats: RunningStats = self
            .samples
            .iter()
            .rev()
            .skip_while(|sample| sample.timestamp > reference)
            .take_while(|sample| cutoff.is_none_or(|cutoff| sample.timestamp > cutoff))
            .map(|sample| sample.volume)
            .collect();

        let expected = (window.secs() as f64 / config.sample_interval_secs as f64).max(1.0);
        let data_density = (stats.count() as f64 / expected).min(1.0);
        let is_reliable =
            stats.count() >= config.min_samples && data_density >= config.min_density;

        BaselineStats {
            window,
            average_volume: stats.mean(),
            standard_deviation: stats.std_dev(),
            sample_count: stats.count(),
            data_density,
            is_reliable,
            reference_time: Some(reference),
        }
    }
}

/// Per-entity sliding-window volume statistics.
///
/// Samples are held in timestamp order per entity and evicted inline on write, by count
/// (`max_samples_per_entity`) and by age relative to the newest sample (`max_sample_age_secs`).
/// Baselines are computed lazily and cached until the next sample for that entity.
#[derive(Debug)]
pub struct BaselineTracker {
    config: TrackerConfig,
    entities: FnvHashMap<SmolStr, EntitySamples>,
    // Entities by last_seen, for cap eviction
    recency: RecencyIndex<DateTime<Utc>>,
}

impl BaselineTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            entities: FnvHashMap::default(),
            recency: RecencyIndex::default(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Replace the configuration, re-applying the retention caps to existing buffers.
    pub fn update_config(&mut self, config: TrackerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;

        let (max_samples, max_age) = (
            self.config.max_samples_per_entity,
            self.config.max_sample_age(),
        );
        for entity in self.entities.values_mut() {
            entity.evict(max_samples, max_age);
            entity.cache.get_mut().clear();
        }
        while self.entities.len() > self.config.max_tracked_entities {
            self.evict_idle_entity();
        }
        Ok(())
    }

    /// Record a volume observation.
    ///
    /// Returns `false` (and records nothing) for an empty `entity_id` or a negative/non-finite
    /// `volume`.
    pub fn add_sample(&mut self, entity_id: &str, volume: f64, options: SampleOptions) -> bool {
        if entity_id.is_empty() || !volume.is_finite() || volume < 0.0 {
            debug!(entity_id, volume, "rejected malformed volume sample");
            return false;
        }

        let timestamp = options.timestamp.unwrap_or_else(Utc::now);

        if !self.entities.contains_key(entity_id)
            && self.entities.len() >= self.config.max_tracked_entities
        {
            self.evict_idle_entity();
        }

        let (max_samples, max_age) = (
            self.config.max_samples_per_entity,
            self.config.max_sample_age(),
        );
        let entity_id = SmolStr::new(entity_id);
        let entity = self
            .entities
            .entry(entity_id.clone())
            .or_insert_with(|| EntitySamples::new(timestamp));

        entity.insert(VolumeSample {
            entity_id: entity_id.clone(),
            volume,
            timestamp,
            trade_count: options.trade_count,
        });
        self.recency.touch(&entity_id, entity.activity.last_seen);

        let evicted = entity.evict(max_samples, max_age);
        if evicted > 0 {
            debug!(%entity_id, evicted, "evicted stale volume samples");
        }

        true
    }

    /// Baseline ending at the entity's newest sample (the tracker's logical clock).
    pub fn baseline(&self, entity_id: &str, window: RollingWindow) -> BaselineStats {
        match self.entities.get(entity_id).and_then(EntitySamples::newest) {
            Some(newest) => self.baseline_at(entity_id, window, newest),
            None => BaselineStats::empty(window),
        }
    }

    /// Baselines for every [`RollingWindow`], ending at the entity's newest sample.
    pub fn baselines(&self, entity_id: &str) -> Vec<BaselineStats> {
        RollingWindow::ALL
            .into_iter()
            .map(|window| self.baseline(entity_id, window))
            .collect()
    }

    pub fn activity(&self, entity_id: &str) -> Option<EntityActivity> {
        self.entities.get(entity_id).map(|entity| entity.activity)
    }

    /// Buffered samples of an entity, oldest first.
    pub fn samples(&self, entity_id: &str) -> Vec<VolumeSample> {
        self.entities
            .get(entity_id)
            .map(|entity| entity.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &SmolStr> {
        self.entities.keys()
    }

    /// Forget an entity's samples, cached baselines and counters.
    pub fn clear_entity(&mut self, entity_id: &str) -> bool {
        self.recency.remove(entity_id);
        self.entities.remove(entity_id).is_some()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.recency.clear();
    }

    fn evict_idle_entity(&mut self) {
        if let Some(entity_id) = self.recency.pop_lowest() {
            debug!(%entity_id, "tracked entity cap reached, evicting least recently seen");
            self.entities.remove(&entity_id);
        }
    }
}

impl BaselineSource for BaselineTracker {
    fn baseline_at(
        &self,
        entity_id: &str,
        window: RollingWindow,
        reference: DateTime<Utc>,
    ) -> BaselineStats {
        let Some(entity) = self.entities.get(entity_id) else {
            return BaselineStats::empty(window);
        };

        let mut cache = entity.cache.lock();
        if let Some(cached) = cache
            .get(&window)
            .filter(|cached| cached.reference_time == Some(reference))
        {
            return *cached;
        }

        let stats = entity.compute(window, reference, &self.config);
        cache.insert(window, stats);
        stats
    }

    fn tracked_entities(&self) -> usize {
        self.entities.len()
    }
}
