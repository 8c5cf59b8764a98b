//! Sharded, concurrent front end over [`VolumeMonitor`]s.
//!
//! Entities are hashed to one of N tokio tasks. Each task owns its [`VolumeMonitor`] exclusively
//! and serves [`Command`]s from a bounded channel, so no state is shared between shards and no
//! locks are taken on the hot path. A full command channel applies backpressure to the caller.

use crate::{
    config::{DetectorConfig, MonitorConfig},
    error::{ConfigError, EngineError},
    monitor::{RecordOptions, VolumeMonitor, VolumeReading},
    sink::{ChannelSink, SpikeNotification},
    spike::{BatchResult, SpikeEvent, SpikeResult, summary::SpikeSummary},
};
use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet, FnvHasher};
use futures::future::{join_all, try_join_all};
use itertools::Itertools;
use smol_str::SmolStr;
use std::hash::{Hash, Hasher};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Capacity of each shard's command channel.
pub const DEFAULT_COMMAND_BUFFER: usize = 1_024;

#[derive(Debug)]
enum Command {
    Record {
        reading: VolumeReading,
        reply: oneshot::Sender<SpikeResult>,
    },
    BatchRecord {
        readings: Vec<VolumeReading>,
        reply: oneshot::Sender<BatchResult>,
    },
    Summary {
        frequency_reference: Option<DateTime<Utc>>,
        reply: oneshot::Sender<SpikeSummary>,
    },
    RecentSpikes {
        limit: usize,
        reply: oneshot::Sender<Vec<SpikeEvent>>,
    },
    IsInSpikeState {
        entity_id: SmolStr,
        reply: oneshot::Sender<bool>,
    },
    ClearEntity {
        entity_id: SmolStr,
        reply: oneshot::Sender<bool>,
    },
    UpdateDetectorConfig {
        config: DetectorConfig,
        reply: oneshot::Sender<Result<(), ConfigError>>,
    },
}

#[derive(Debug)]
pub struct ShardedMonitor {
    shards: Vec<mpsc::Sender<Command>>,
    handles: Vec<JoinHandle<()>>,
    detector_config: DetectorConfig,
}

impl ShardedMonitor {
    /// Spawn `shard_count` shard tasks on the current tokio runtime.
    ///
    /// Every shard delivers its [`SpikeNotification`]s into `notifications`, if provided.
    pub fn spawn(
        config: MonitorConfig,
        shard_count: usize,
        notifications: Option<mpsc::Sender<SpikeNotification>>,
    ) -> Result<Self, EngineError> {
        Self::spawn_with_buffer(config, shard_count, notifications, DEFAULT_COMMAND_BUFFER)
    }

    pub fn spawn_with_buffer(
        config: MonitorConfig,
        shard_count: usize,
        notifications: Option<mpsc::Sender<SpikeNotification>>,
        command_buffer: usize,
    ) -> Result<Self, EngineError> {
        if shard_count == 0 {
            return Err(EngineError::NoShards);
        }
        config.validate()?;

        let mut shards = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let mut monitor = VolumeMonitor::new(config.clone())?;
            if let Some(tx) = notifications.as_ref() {
                monitor = monitor.with_sink(ChannelSink::new(tx.clone()));
            }

            let (tx, rx) = mpsc::channel(command_buffer.max(1));
            shards.push(tx);
            handles.push(tokio::spawn(run_shard(shard, monitor, rx)));
        }

        info!(shards = shard_count, "volume surveillance engine started");

        Ok(Self {
            shards,
            handles,
            detector_config: config.detector,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard owning `entity_id`. Stable for the lifetime of the engine.
    pub fn shard_for(&self, entity_id: &str) -> usize {
        let mut hasher = FnvHasher::default();
        entity_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn record(
        &self,
        entity_id: &str,
        volume: f64,
        options: RecordOptions,
    ) -> Result<SpikeResult, EngineError> {
        let reading = VolumeReading::new(entity_id, volume, options);
        let shard = self.shard_for(entity_id);
        self.request(shard, |reply| Command::Record { reading, reply })
            .await
    }

    /// Record many readings. Each shard processes its share in input order; shards run
    /// concurrently. Results are keyed in order of first appearance.
    pub async fn batch_record<Iter>(&self, readings: Iter) -> Result<BatchResult, EngineError>
    where
        Iter: IntoIterator<Item = VolumeReading>,
    {
        let mut order = Vec::new();
        let mut per_shard: FnvHashMap<usize, Vec<VolumeReading>> = FnvHashMap::default();
        for reading in readings {
            order.push(reading.entity_id.clone());
            per_shard
                .entry(self.shard_for(&reading.entity_id))
                .or_default()
                .push(reading);
        }

        let batches = try_join_all(per_shard.into_iter().map(|(shard, readings)| {
            self.request(shard, |reply| Command::BatchRecord { readings, reply })
        }))
        .await?;

        let mut spiking = FnvHashSet::default();
        let mut results = FnvHashMap::default();
        for batch in batches {
            spiking.extend(batch.spiking);
            results.extend(batch.results);
        }

        let mut merged = BatchResult::default();
        for entity_id in order.into_iter().unique() {
            if let Some(result) = results.remove(&entity_id) {
                if spiking.contains(&entity_id) && !merged.spiking.contains(&entity_id) {
                    merged.spiking.push(entity_id.clone());
                }
                merged.results.insert(entity_id, result);
            }
        }
        Ok(merged)
    }

    /// Summary across all shards.
    ///
    /// Every shard counts `most_active` over the frequency window ending at the newest event of
    /// any shard, so the merged ranking compares like with like.
    pub async fn summary(&self) -> Result<SpikeSummary, EngineError> {
        let frequency_reference = self
            .recent_spikes(1)
            .await?
            .first()
            .map(|event| event.timestamp);

        let summaries = self
            .broadcast(|| {
                move |reply| Command::Summary {
                    frequency_reference,
                    reply,
                }
            })
            .await?;

        Ok(SpikeSummary::merge(
            summaries,
            self.detector_config.summary_recent_limit,
            self.detector_config.summary_top_entities,
        ))
    }

    /// Most recent events across all shards, newest first.
    pub async fn recent_spikes(&self, limit: usize) -> Result<Vec<SpikeEvent>, EngineError> {
        let recent = self
            .broadcast(|| move |reply| Command::RecentSpikes { limit, reply })
            .await?;

        Ok(recent
            .into_iter()
            .kmerge_by(|a, b| a.timestamp > b.timestamp)
            .take(limit)
            .collect())
    }

    pub async fn is_in_spike_state(&self, entity_id: &str) -> Result<bool, EngineError> {
        let entity_id = SmolStr::new(entity_id);
        let shard = self.shard_for(&entity_id);
        self.request(shard, |reply| Command::IsInSpikeState { entity_id, reply })
            .await
    }

    pub async fn clear_entity(&self, entity_id: &str) -> Result<bool, EngineError> {
        let entity_id = SmolStr::new(entity_id);
        let shard = self.shard_for(&entity_id);
        self.request(shard, |reply| Command::ClearEntity { entity_id, reply })
            .await
    }

    /// Validate once, then apply `config` on every shard.
    pub async fn update_detector_config(
        &mut self,
        config: DetectorConfig,
    ) -> Result<(), EngineError> {
        config.validate()?;

        let outcomes = self
            .broadcast(|| {
                let config = config.clone();
                move |reply| Command::UpdateDetectorConfig { config, reply }
            })
            .await?;
        outcomes.into_iter().collect::<Result<(), ConfigError>>()?;

        self.detector_config = config;
        Ok(())
    }

    /// Close every command channel and wait for the shard tasks to drain and exit.
    pub async fn shutdown(self) {
        let Self {
            shards, handles, ..
        } = self;
        drop(shards);

        for (shard, result) in join_all(handles).await.into_iter().enumerate() {
            if let Err(error) = result {
                error!(shard, %error, "volume surveillance shard task failed");
            }
        }
        info!("volume surveillance engine stopped");
    }

    async fn request<T, BuildCommand>(
        &self,
        shard: usize,
        command: BuildCommand,
    ) -> Result<T, EngineError>
    where
        BuildCommand: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shards[shard]
            .send(command(reply_tx))
            .await
            .map_err(|_| EngineError::ShardClosed(shard))?;
        reply_rx.await.map_err(|_| EngineError::ReplyDropped(shard))
    }

    async fn broadcast<T, MakeCommand, BuildCommand>(
        &self,
        make: MakeCommand,
    ) -> Result<Vec<T>, EngineError>
    where
        MakeCommand: Fn() -> BuildCommand,
        BuildCommand: FnOnce(oneshot::Sender<T>) -> Command,
    {
        try_join_all((0..self.shards.len()).map(|shard| self.request(shard, make()))).await
    }
}

async fn run_shard(shard: usize, mut monitor: VolumeMonitor, mut commands: mpsc::Receiver<Command>) {
    debug!(shard, "volume surveillance shard running");

    // A dropped reply receiver only means the caller stopped waiting
    while let Some(command) = commands.recv().await {
        match command {
            Command::Record { reading, reply } => {
                let _ = reply.send(monitor.record(
                    &reading.entity_id,
                    reading.volume,
                    reading.options,
                ));
            }
            Command::BatchRecord { readings, reply } => {
                let _ = reply.send(monitor.batch_record(readings));
            }
            Command::Summary {
                frequency_reference,
                reply,
            } => {
                let _ = reply.send(monitor.summary_at(frequency_reference));
            }
            Command::RecentSpikes { limit, reply } => {
                let _ = reply.send(monitor.recent_spikes(limit));
            }
            Command::IsInSpikeState { entity_id, reply } => {
                let _ = reply.send(monitor.is_in_spike_state(&entity_id));
            }
            Command::ClearEntity { entity_id, reply } => {
                let _ = reply.send(monitor.clear_entity(&entity_id));
            }
            Command::UpdateDetectorConfig { config, reply } => {
                let _ = reply.send(monitor.update_detector_config(config));
            }
        }
    }

    debug!(shard, "volume surveillance shard stopped");
}
