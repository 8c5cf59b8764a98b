use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};
use volume_surveillance::{
    EngineError, MonitorConfig, RecordOptions, ShardedMonitor, SpikeNotification, SpikeSummary,
};

/// One line of input.
#[derive(Debug, Clone, Deserialize)]
struct SampleLine {
    entity_id: String,
    volume: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    trade_count: Option<u32>,
}

/// One line of output.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutputLine<'a> {
    Notification(&'a SpikeNotification),
    Summary { kind: &'static str, data: &'a SpikeSummary },
}

#[derive(Debug, Error)]
enum ReplayError {
    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("reading stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "replay failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ReplayError> {
    let config = MonitorConfig::from_env().map_err(EngineError::from)?;

    // Configurable via SHARDS env var (default: available parallelism)
    let shards = std::env::var("SHARDS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1)
        });

    // Configurable via EVENT_BUFFER_SIZE env var (default: 10,000)
    let buffer_size = std::env::var("EVENT_BUFFER_SIZE")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(10_000);

    info!(shards, buffer_size, "starting volume surveillance replay");

    let (tx, mut rx) = mpsc::channel::<SpikeNotification>(buffer_size);
    let engine = ShardedMonitor::spawn(config, shards, Some(tx))?;

    let printer = tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            print_line(&OutputLine::Notification(&notification));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut accepted, mut skipped) = (0_u64, 0_u64);
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let sample = match serde_json::from_str::<SampleLine>(&line) {
            Ok(sample) => sample,
            Err(error) => {
                warn!(%error, line = %line, "skipping malformed input line");
                skipped += 1;
                continue;
            }
        };

        let options = RecordOptions {
            timestamp: sample.timestamp,
            trade_count: sample.trade_count,
            ..Default::default()
        };
        engine
            .record(&sample.entity_id, sample.volume, options)
            .await?;
        accepted += 1;
    }

    let summary = engine.summary().await?;
    engine.shutdown().await;

    // Shards dropped their senders, so the printer drains and exits
    if let Err(error) = printer.await {
        warn!(%error, "notification printer task failed");
    }

    print_line(&OutputLine::Summary {
        kind: "summary",
        data: &summary,
    });
    info!(
        accepted,
        skipped,
        total_events = summary.total_events,
        entities_in_spike = summary.entities_in_spike,
        "replay finished"
    );
    Ok(())
}

fn print_line(line: &OutputLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => println!("{json}"),
        Err(error) => warn!(%error, "failed to serialise output line"),
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
