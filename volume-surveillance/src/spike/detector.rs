use super::{
    BatchEntry, BatchResult, DetectOptions, SpikeEvent, SpikeResult, SpikeSeverity, SpikeType,
    score::score,
    state::SpikeState,
    summary::{EntityFrequency, SeverityCounts, SpikeSummary, rank_frequencies},
};
use crate::{
    baseline::{BaselineSource, BaselineStats},
    config::DetectorConfig,
    error::ConfigError,
    recency::RecencyIndex,
    sink::{SpikeNotification, SpikeSink},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Scores readings against [`BaselineSource`] snapshots and tracks spike episodes per entity.
///
/// The detector never mutates baselines; each call receives the source to read from. It owns the
/// per-entity [`SpikeState`], the cooldown timestamps and the bounded event histories.
pub struct SpikeDetector {
    config: DetectorConfig,
    states: FnvHashMap<SmolStr, SpikeState>,
    // States by SpikeState::eviction_rank, for cap eviction
    recency: RecencyIndex<(bool, Option<DateTime<Utc>>)>,
    entity_history: FnvHashMap<SmolStr, VecDeque<SpikeEvent>>,
    // Newest at the back
    recent: VecDeque<SpikeEvent>,
    severity_counts: SeverityCounts,
    total_events: u64,
    sink: Option<Box<dyn SpikeSink + Send>>,
}

impl std::fmt::Debug for SpikeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpikeDetector")
            .field("config", &self.config)
            .field("states", &self.states.len())
            .field("recent", &self.recent.len())
            .field("total_events", &self.total_events)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl SpikeDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            states: FnvHashMap::default(),
            recency: RecencyIndex::default(),
            entity_history: FnvHashMap::default(),
            recent: VecDeque::new(),
            severity_counts: SeverityCounts::default(),
            total_events: 0,
            sink: None,
        })
    }

    pub fn with_sink<Sink>(mut self, sink: Sink) -> Self
    where
        Sink: SpikeSink + Send + 'static,
    {
        self.set_sink(sink);
        self
    }

    pub fn set_sink<Sink>(&mut self, sink: Sink)
    where
        Sink: SpikeSink + Send + 'static,
    {
        self.sink = Some(Box::new(sink));
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Replace the configuration. Histories and spike states are trimmed to the new bounds.
    pub fn update_config(&mut self, config: DetectorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;

        for history in self.entity_history.values_mut() {
            truncate_front(history, self.config.entity_history_limit);
        }
        truncate_front(&mut self.recent, self.config.global_history_limit);
        while self.states.len() > self.config.max_tracked_entities && self.evict_idle_state() {}
        Ok(())
    }

    /// Score one reading, advance the entity's episode and emit an event unless the entity is
    /// inside its cooldown.
    ///
    /// Malformed input and unreliable baselines produce a non-spike result. The only state they
    /// touch is an episode whose last point is more than `max_gap_minutes` old, which ends.
    pub fn detect_spike<B>(
        &mut self,
        baselines: &B,
        entity_id: &str,
        volume: f64,
        options: DetectOptions,
    ) -> SpikeResult
    where
        B: BaselineSource + ?Sized,
    {
        let window = options.window.unwrap_or(self.config.primary_window);

        if entity_id.is_empty() || !volume.is_finite() || volume < 0.0 {
            debug!(entity_id, volume, "skipping detection for malformed reading");
            return SpikeResult::unscored(entity_id, BaselineStats::empty(window));
        }

        let timestamp = options.timestamp.unwrap_or_else(Utc::now);
        let baseline = baselines.baseline_at(entity_id, window, timestamp);
        if !baseline.is_reliable {
            self.end_stale_episode(entity_id, timestamp);
            return SpikeResult::unscored(entity_id, baseline);
        }

        let score = score(&self.config, &baseline, volume);
        let entity_id = SmolStr::new(entity_id);
        let mut result = SpikeResult {
            entity_id: entity_id.clone(),
            is_spike: score.severity.is_some(),
            spike_event: None,
            baseline,
            z_score: score.z_score,
            percentage_of_baseline: score.percentage_of_baseline,
            severity: score.severity,
            direction: score.direction,
            spike_type: None,
            suppressed: false,
        };

        let Some(severity) = score.severity else {
            self.end_episode(&entity_id, timestamp);
            return result;
        };

        if !self.states.contains_key(&entity_id)
            && self.states.len() >= self.config.max_tracked_entities
        {
            self.evict_idle_state();
        }

        let cooldown = self.config.cooldown();
        let state = self.states.entry(entity_id.clone()).or_default();
        let (spike_type, replaced) =
            state.observe_spike(&entity_id, volume, timestamp, &self.config.sustained);
        let consecutive_points = state.consecutive_points;
        self.recency.touch(&entity_id, state.eviction_rank());

        let emit = options.bypass_cooldown || !state.in_cooldown(timestamp, cooldown);
        let first_sustained = emit && spike_type == SpikeType::Sustained && !state.sustained_notified;
        if emit {
            state.last_emitted_at = Some(timestamp);
            state.sustained_notified |= first_sustained;
        }

        result.spike_type = Some(spike_type);

        if let Some(episode) = replaced {
            debug!(%entity_id, points = episode.points, "spike episode restarted after gap");
            self.notify(SpikeNotification::Ended(episode));
        }

        if !emit {
            debug!(%entity_id, %severity, %spike_type, "spike suppressed by cooldown");
            result.suppressed = true;
            return result;
        }

        let event = SpikeEvent {
            entity_id,
            timestamp,
            current_volume: volume,
            baseline_average: baseline.average_volume,
            baseline_std_dev: baseline.standard_deviation,
            z_score: score.z_score,
            percentage_of_baseline: score.percentage_of_baseline,
            severity,
            direction: score.direction,
            spike_type,
            window,
            consecutive_points,
        };

        self.record_event(&event);
        self.notify(SpikeNotification::Spike(event.clone()));
        if first_sustained {
            self.notify(SpikeNotification::Sustained(event.clone()));
        }

        result.spike_event = Some(event);
        result
    }

    /// Run [`Self::detect_spike`] for every entry in order. A repeated entity keeps its last result.
    pub fn batch_detect_spikes<B, Iter>(&mut self, baselines: &B, entries: Iter) -> BatchResult
    where
        B: BaselineSource + ?Sized,
        Iter: IntoIterator<Item = BatchEntry>,
    {
        entries
            .into_iter()
            .fold(BatchResult::default(), |mut batch, entry| {
                batch.push(self.detect_spike(
                    baselines,
                    &entry.entity_id,
                    entry.volume,
                    entry.options,
                ));
                batch
            })
    }

    /// Summary with `most_active` counted over the frequency window ending at the newest event.
    pub fn summary<B>(&self, baselines: &B) -> SpikeSummary
    where
        B: BaselineSource + ?Sized,
    {
        self.summary_at(baselines, self.newest_event_time())
    }

    /// Summary with `most_active` counted over the frequency window ending at
    /// `frequency_reference`. No reference counts nothing.
    ///
    /// Summaries of several detectors must share one reference to be merged with
    /// [`SpikeSummary::merge`].
    pub fn summary_at<B>(
        &self,
        baselines: &B,
        frequency_reference: Option<DateTime<Utc>>,
    ) -> SpikeSummary
    where
        B: BaselineSource + ?Sized,
    {
        let mut spiking_entities: Vec<SmolStr> = self
            .states
            .iter()
            .filter(|(_, state)| state.in_spike)
            .map(|(entity_id, _)| entity_id.clone())
            .collect();
        spiking_entities.sort();

        SpikeSummary {
            tracked_entities: baselines.tracked_entities(),
            entities_in_spike: spiking_entities.len(),
            spiking_entities,
            total_events: self.total_events,
            severity_counts: self.severity_counts,
            recent_events: self.recent_spikes(self.config.summary_recent_limit),
            most_active: frequency_reference
                .map(|reference| self.most_active(reference))
                .unwrap_or_default(),
        }
    }

    /// Timestamp of the newest event in the global history.
    pub fn newest_event_time(&self) -> Option<DateTime<Utc>> {
        self.recent.iter().map(|event| event.timestamp).max()
    }

    // Event counts per entity within the frequency window ending at reference
    fn most_active(&self, reference: DateTime<Utc>) -> Vec<EntityFrequency> {
        // A window reaching past the earliest representable time counts everything before
        let cutoff = reference.checked_sub_signed(self.config.frequency_window());

        let frequencies = self.entity_history.iter().map(|(entity_id, history)| {
            EntityFrequency::new(
                entity_id.clone(),
                history
                    .iter()
                    .filter(|event| {
                        event.timestamp <= reference
                            && cutoff.is_none_or(|cutoff| event.timestamp >= cutoff)
                    })
                    .count(),
            )
        });
        rank_frequencies(frequencies, self.config.summary_top_entities)
    }

    /// Most recently emitted events across all entities, newest first.
    pub fn recent_spikes(&self, limit: usize) -> Vec<SpikeEvent> {
        self.recent.iter().rev().take(limit).cloned().collect()
    }

    /// Most recently emitted events of one entity, newest first.
    pub fn entity_spikes(&self, entity_id: &str, limit: usize) -> Vec<SpikeEvent> {
        self.entity_history
            .get(entity_id)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_in_spike_state(&self, entity_id: &str) -> bool {
        self.states
            .get(entity_id)
            .is_some_and(|state| state.in_spike)
    }

    pub fn spike_state(&self, entity_id: &str) -> Option<&SpikeState> {
        self.states.get(entity_id)
    }

    /// Forget an entity's spike state, cooldown and event history. Returns whether anything was
    /// held for it. Severity counters are lifetime totals and are kept.
    pub fn clear_entity(&mut self, entity_id: &str) -> bool {
        self.recency.remove(entity_id);
        let had_state = self.states.remove(entity_id).is_some();
        let had_history = self.entity_history.remove(entity_id).is_some();
        self.recent.retain(|event| event.entity_id != entity_id);
        had_state || had_history
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.recency.clear();
        self.entity_history.clear();
        self.recent.clear();
        self.severity_counts = SeverityCounts::default();
        self.total_events = 0;
    }

    fn end_episode(&mut self, entity_id: &SmolStr, ended_at: DateTime<Utc>) {
        let Some(state) = self.states.get_mut(entity_id) else {
            return;
        };
        let Some(episode) = state.end_episode(entity_id, ended_at) else {
            return;
        };
        self.recency.touch(entity_id, state.eviction_rank());

        debug!(
            %entity_id,
            points = episode.points,
            peak_volume = episode.peak_volume,
            "spike episode ended"
        );
        self.notify(SpikeNotification::Ended(episode));
    }

    // An unscored reading more than max_gap after the episode's last point ends it at that point
    fn end_stale_episode(&mut self, entity_id: &str, timestamp: DateTime<Utc>) {
        let max_gap = self.config.sustained.max_gap();
        let Some(last_point_time) = self
            .states
            .get(entity_id)
            .filter(|state| state.in_spike)
            .and_then(|state| state.last_point_time)
            .filter(|last_point_time| timestamp - *last_point_time > max_gap)
        else {
            return;
        };
        self.end_episode(&SmolStr::new(entity_id), last_point_time);
    }

    fn record_event(&mut self, event: &SpikeEvent) {
        match event.severity {
            SpikeSeverity::Low | SpikeSeverity::Medium => info!(
                entity_id = %event.entity_id,
                severity = %event.severity,
                spike_type = %event.spike_type,
                direction = %event.direction,
                volume = event.current_volume,
                baseline = event.baseline_average,
                z_score = event.z_score,
                "volume spike detected"
            ),
            SpikeSeverity::High | SpikeSeverity::Critical => warn!(
                entity_id = %event.entity_id,
                severity = %event.severity,
                spike_type = %event.spike_type,
                direction = %event.direction,
                volume = event.current_volume,
                baseline = event.baseline_average,
                z_score = event.z_score,
                "volume spike detected"
            ),
        }

        let history = self
            .entity_history
            .entry(event.entity_id.clone())
            .or_default();
        history.push_back(event.clone());
        truncate_front(history, self.config.entity_history_limit);

        self.recent.push_back(event.clone());
        truncate_front(&mut self.recent, self.config.global_history_limit);

        self.severity_counts.increment(event.severity);
        self.total_events += 1;
    }

    fn notify(&mut self, notification: SpikeNotification) {
        if let Some(sink) = self.sink.as_mut() {
            sink.deliver(notification);
        }
    }

    // Prefer entities outside a spike, then the least recently spiking
    fn evict_idle_state(&mut self) -> bool {
        let Some(entity_id) = self.recency.pop_lowest() else {
            return false;
        };
        debug!(%entity_id, "spike state cap reached, evicting idle entity");
        self.states.remove(&entity_id);
        self.entity_history.remove(&entity_id);
        true
    }
}

fn truncate_front<T>(buffer: &mut VecDeque<T>, limit: usize) {
    while buffer.len() > limit {
        buffer.pop_front();
    }
}
