//! Alert delivery out of the [`SpikeDetector`](crate::spike::detector::SpikeDetector).
//!
//! Consumers either poll (`summary`, `recent_spikes`) or register a [`SpikeSink`]. Delivery is
//! at-most-once: a full channel drops the notification rather than blocking detection.

use crate::spike::{SpikeEvent, SpikeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A finished spike episode.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SpikeEpisode {
    pub entity_id: SmolStr,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub points: u32,
    pub peak_volume: f64,
    pub spike_type: Option<SpikeType>,
}

/// Everything a [`SpikeSink`] can receive.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SpikeNotification {
    /// A spike event passed the cooldown gate.
    Spike(SpikeEvent),
    /// First emitted event of an episode classified as sustained.
    Sustained(SpikeEvent),
    /// An episode ended: a non-spike reading, or a gap longer than the max gap.
    Ended(SpikeEpisode),
}

impl SpikeNotification {
    pub fn entity_id(&self) -> &SmolStr {
        match self {
            SpikeNotification::Spike(event) | SpikeNotification::Sustained(event) => {
                &event.entity_id
            }
            SpikeNotification::Ended(episode) => &episode.entity_id,
        }
    }
}

/// Observer of [`SpikeNotification`]s.
pub trait SpikeSink {
    fn deliver(&mut self, notification: SpikeNotification);
}

impl<F> SpikeSink for F
where
    F: FnMut(SpikeNotification),
{
    fn deliver(&mut self, notification: SpikeNotification) {
        self(notification)
    }
}

/// [`SpikeSink`] writing into a bounded [`mpsc`] channel without ever awaiting.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SpikeNotification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<SpikeNotification>) -> Self {
        Self { tx }
    }
}

impl SpikeSink for ChannelSink {
    fn deliver(&mut self, notification: SpikeNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    entity_id = %dropped.entity_id(),
                    "spike notification channel full, dropping notification"
                );
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                debug!(
                    entity_id = %dropped.entity_id(),
                    "spike notification channel closed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn episode(entity_id: &str) -> SpikeNotification {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        SpikeNotification::Ended(SpikeEpisode {
            entity_id: SmolStr::new(entity_id),
            started_at: time,
            ended_at: time,
            points: 1,
            peak_volume: 10.0,
            spike_type: Some(SpikeType::Momentary),
        })
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);

        sink.deliver(episode("a"));
        sink.deliver(episode("b"));

        assert_eq!(rx.try_recv().unwrap().entity_id(), "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        sink.deliver(episode("a"));
    }

    #[test]
    fn test_closure_sink() {
        let mut received = Vec::new();
        {
            let mut sink = |notification: SpikeNotification| received.push(notification);
            sink.deliver(episode("a"));
        }
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn test_notification_serde_is_tagged() {
        let json = serde_json::to_value(episode("a")).unwrap();
        assert_eq!(json["kind"], "ended");
        assert_eq!(json["data"]["entity_id"], "a");
    }
}
