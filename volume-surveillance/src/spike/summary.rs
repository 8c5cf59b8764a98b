use super::{SpikeEvent, SpikeSeverity};
use derive_more::Constructor;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::cmp::Reverse;

/// Number of emitted events per [`SpikeSeverity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct SeverityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl SeverityCounts {
    pub fn increment(&mut self, severity: SpikeSeverity) {
        *self.get_mut(severity) += 1;
    }

    pub fn get(&self, severity: SpikeSeverity) -> u64 {
        match severity {
            SpikeSeverity::Low => self.low,
            SpikeSeverity::Medium => self.medium,
            SpikeSeverity::High => self.high,
            SpikeSeverity::Critical => self.critical,
        }
    }

    fn get_mut(&mut self, severity: SpikeSeverity) -> &mut u64 {
        match severity {
            SpikeSeverity::Low => &mut self.low,
            SpikeSeverity::Medium => &mut self.medium,
            SpikeSeverity::High => &mut self.high,
            SpikeSeverity::Critical => &mut self.critical,
        }
    }

    pub fn total(&self) -> u64 {
        SpikeSeverity::ALL
            .iter()
            .map(|severity| self.get(*severity))
            .sum()
    }

    pub fn merge(&mut self, other: &SeverityCounts) {
        for severity in SpikeSeverity::ALL {
            *self.get_mut(severity) += other.get(severity);
        }
    }
}

/// Spike event count of one entity inside the frequency window.
#[derive(Debug, Clone, PartialEq, Eq, Constructor, Deserialize, Serialize)]
pub struct EntityFrequency {
    pub entity_id: SmolStr,
    pub spike_count: usize,
}

/// Point-in-time overview of a [`SpikeDetector`](super::detector::SpikeDetector).
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct SpikeSummary {
    /// Entities the baseline source holds samples for.
    pub tracked_entities: usize,
    pub entities_in_spike: usize,
    pub spiking_entities: Vec<SmolStr>,
    /// Events emitted since construction or the last `clear`.
    pub total_events: u64,
    pub severity_counts: SeverityCounts,
    /// Newest first.
    pub recent_events: Vec<SpikeEvent>,
    /// Highest recent spike frequency first.
    pub most_active: Vec<EntityFrequency>,
}

impl SpikeSummary {
    /// Combine summaries of disjoint entity sets, keeping `recent_limit` events and
    /// `top_entities` frequencies.
    ///
    /// Frequencies are ranked as given, so the inputs should come from
    /// [`SpikeDetector::summary_at`](super::detector::SpikeDetector::summary_at) with one shared
    /// reference.
    pub fn merge<Iter>(summaries: Iter, recent_limit: usize, top_entities: usize) -> Self
    where
        Iter: IntoIterator<Item = SpikeSummary>,
    {
        let mut merged = SpikeSummary::default();
        let mut recent = Vec::new();
        let mut frequencies = Vec::new();

        for summary in summaries {
            merged.tracked_entities += summary.tracked_entities;
            merged.entities_in_spike += summary.entities_in_spike;
            merged.spiking_entities.extend(summary.spiking_entities);
            merged.total_events += summary.total_events;
            merged.severity_counts.merge(&summary.severity_counts);
            recent.push(summary.recent_events);
            frequencies.extend(summary.most_active);
        }

        merged.spiking_entities.sort();
        merged.recent_events = recent
            .into_iter()
            .kmerge_by(|a, b| a.timestamp > b.timestamp)
            .take(recent_limit)
            .collect();
        merged.most_active = rank_frequencies(frequencies, top_entities);
        merged
    }
}

/// Order by descending spike count, ties by entity id, and keep the first `limit`.
pub(crate) fn rank_frequencies<Iter>(frequencies: Iter, limit: usize) -> Vec<EntityFrequency>
where
    Iter: IntoIterator<Item = EntityFrequency>,
{
    frequencies
        .into_iter()
        .filter(|frequency| frequency.spike_count > 0)
        .sorted_by(|a, b| {
            Reverse(a.spike_count)
                .cmp(&Reverse(b.spike_count))
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        })
        .take(limit)
        .collect()
}
