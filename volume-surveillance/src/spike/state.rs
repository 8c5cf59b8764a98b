use super::SpikeType;
use crate::{config::SustainedConfig, sink::SpikeEpisode};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Live spike episode of one entity.
///
/// An episode starts on the first qualifying reading and ends on the first non-qualifying
/// reading, or restarts when qualifying readings are separated by more than `max_gap_minutes`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SpikeState {
    pub in_spike: bool,
    pub consecutive_points: u32,
    pub peak_volume: f64,
    pub spike_start_time: Option<DateTime<Utc>>,
    pub last_point_time: Option<DateTime<Utc>>,
    /// Survives episode boundaries so the cooldown spans episodes.
    pub last_emitted_at: Option<DateTime<Utc>>,
    pub spike_type: Option<SpikeType>,
    /// The episode already delivered its sustained notification.
    pub sustained_notified: bool,
}

impl SpikeState {
    /// Advance the episode with a qualifying reading and classify its shape.
    ///
    /// Returns the classification and, if a stale episode was replaced because the gap exceeded
    /// `max_gap`, that episode.
    pub fn observe_spike(
        &mut self,
        entity_id: &SmolStr,
        volume: f64,
        timestamp: DateTime<Utc>,
        config: &SustainedConfig,
    ) -> (SpikeType, Option<SpikeEpisode>) {
        let gap = self.last_point_time.map(|last| timestamp - last);
        let continues = self.in_spike && gap.is_some_and(|gap| gap <= config.max_gap());

        let replaced = if continues {
            self.consecutive_points = self.consecutive_points.saturating_add(1);
            self.peak_volume = self.peak_volume.max(volume);
            None
        } else {
            let replaced = self.take_episode(entity_id, self.last_point_time);
            self.in_spike = true;
            self.consecutive_points = 1;
            self.peak_volume = volume;
            self.spike_start_time = Some(timestamp);
            self.sustained_notified = false;
            replaced
        };
        self.last_point_time = Some(timestamp);

        let spike_type = self.classify(gap.unwrap_or_else(Duration::zero), timestamp, config);
        self.spike_type = Some(spike_type);
        (spike_type, replaced)
    }

    fn classify(
        &self,
        gap: Duration,
        timestamp: DateTime<Utc>,
        config: &SustainedConfig,
    ) -> SpikeType {
        let duration = self
            .spike_start_time
            .map(|start| timestamp - start)
            .unwrap_or_else(Duration::zero);

        if self.consecutive_points >= config.min_consecutive_points
            && duration >= config.min_duration()
        {
            SpikeType::Sustained
        } else if self.consecutive_points == 1 {
            SpikeType::Momentary
        } else if gap > config.sudden_gap() {
            SpikeType::Gradual
        } else if self.consecutive_points == 2 {
            SpikeType::Sudden
        } else {
            // Later tight points keep the shape the episode already has
            self.spike_type.unwrap_or(SpikeType::Sudden)
        }
    }

    /// End the live episode, if any, at `ended_at`.
    pub fn end_episode(
        &mut self,
        entity_id: &SmolStr,
        ended_at: DateTime<Utc>,
    ) -> Option<SpikeEpisode> {
        let episode = self.take_episode(entity_id, Some(ended_at));
        self.in_spike = false;
        self.consecutive_points = 0;
        self.peak_volume = 0.0;
        self.spike_start_time = None;
        self.spike_type = None;
        self.sustained_notified = false;
        episode
    }

    fn take_episode(
        &self,
        entity_id: &SmolStr,
        ended_at: Option<DateTime<Utc>>,
    ) -> Option<SpikeEpisode> {
        if !self.in_spike {
            return None;
        }
        let started_at = self.spike_start_time?;
        Some(SpikeEpisode {
            entity_id: entity_id.clone(),
            started_at,
            ended_at: ended_at.unwrap_or(started_at),
            points: self.consecutive_points,
            peak_volume: self.peak_volume,
            spike_type: self.spike_type,
        })
    }

    /// Orders states for cap eviction: outside a spike first, then by oldest last point.
    pub(crate) fn eviction_rank(&self) -> (bool, Option<DateTime<Utc>>) {
        (self.in_spike, self.last_point_time)
    }

    /// An emission at `timestamp` would come less than `cooldown` after the previous one.
    pub fn in_cooldown(&self, timestamp: DateTime<Utc>, cooldown: Duration) -> bool {
        self.last_emitted_at
            .is_some_and(|last| timestamp - last < cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn config(min_points: u32, max_gap_minutes: u64, min_duration_minutes: u64) -> SustainedConfig {
        SustainedConfig {
            min_consecutive_points: min_points,
            max_gap_minutes,
            min_duration_minutes,
            sudden_gap_secs: 60,
        }
    }

    #[test]
    fn test_sustained_on_third_tight_point() {
        let entity = SmolStr::new("market");
        let config = config(3, 5, 0);
        let mut state = SpikeState::default();

        let types: Vec<SpikeType> = [0, 1, 2]
            .into_iter()
            .map(|secs| state.observe_spike(&entity, 200.0, t(secs), &config).0)
            .collect();

        assert_eq!(
            types,
            vec![SpikeType::Momentary, SpikeType::Sudden, SpikeType::Sustained]
        );
        assert_eq!(state.consecutive_points, 3);
    }

    #[test]
    fn test_classification_sequences() {
        struct TestCase {
            offsets_secs: Vec<i64>,
            expected: Vec<SpikeType>,
        }

        let tests = vec![
            TestCase {
                // TC0: wide gap is gradual, a later tight point keeps the shape
                offsets_secs: vec![0, 90, 110],
                expected: vec![SpikeType::Momentary, SpikeType::Gradual, SpikeType::Gradual],
            },
            TestCase {
                // TC1: tight points below min duration stay sudden
                offsets_secs: vec![0, 10, 20, 30],
                expected: vec![
                    SpikeType::Momentary,
                    SpikeType::Sudden,
                    SpikeType::Sudden,
                    SpikeType::Sudden,
                ],
            },
            TestCase {
                // TC2: sustained once points and duration are both met
                offsets_secs: vec![0, 60, 120, 180],
                expected: vec![
                    SpikeType::Momentary,
                    SpikeType::Sudden,
                    SpikeType::Sustained,
                    SpikeType::Sustained,
                ],
            },
            TestCase {
                // TC3: gap above max gap restarts the episode
                offsets_secs: vec![0, 30, 30 + 6 * 60],
                expected: vec![SpikeType::Momentary, SpikeType::Sudden, SpikeType::Momentary],
            },
        ];

        // 3 points, 5 minute max gap, 2 minute min duration
        let config = config(3, 5, 2);
        let entity = SmolStr::new("market");
        for (index, test) in tests.into_iter().enumerate() {
            let mut state = SpikeState::default();
            let actual: Vec<SpikeType> = test
                .offsets_secs
                .into_iter()
                .map(|secs| state.observe_spike(&entity, 1.0, t(secs), &config).0)
                .collect();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_gap_reset_returns_replaced_episode() {
        let entity = SmolStr::new("market");
        let config = config(3, 1, 0);
        let mut state = SpikeState::default();

        state.observe_spike(&entity, 150.0, t(0), &config);
        state.observe_spike(&entity, 180.0, t(30), &config);
        let (spike_type, replaced) = state.observe_spike(&entity, 120.0, t(30 + 120), &config);

        assert_eq!(spike_type, SpikeType::Momentary);
        assert_eq!(state.consecutive_points, 1);
        assert_eq!(state.peak_volume, 120.0);
        let replaced = replaced.unwrap();
        assert_eq!(replaced.points, 2);
        assert_eq!(replaced.peak_volume, 180.0);
        assert_eq!(replaced.ended_at, t(30));
    }

    #[test]
    fn test_end_episode() {
        let entity = SmolStr::new("market");
        let config = config(3, 5, 0);
        let mut state = SpikeState::default();
        assert!(state.end_episode(&entity, t(0)).is_none());

        state.observe_spike(&entity, 150.0, t(0), &config);
        state.last_emitted_at = Some(t(0));
        let episode = state.end_episode(&entity, t(10)).unwrap();

        assert_eq!(episode.started_at, t(0));
        assert_eq!(episode.ended_at, t(10));
        assert!(!state.in_spike);
        assert_eq!(state.consecutive_points, 0);
        assert_eq!(state.last_emitted_at, Some(t(0)));
    }

    #[test]
    fn test_in_cooldown() {
        let mut state = SpikeState::default();
        let cooldown = Duration::seconds(60);
        assert!(!state.in_cooldown(t(0), cooldown));

        state.last_emitted_at = Some(t(0));
        assert!(state.in_cooldown(t(59), cooldown));
        assert!(!state.in_cooldown(t(60), cooldown));
    }
}
