use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Once;
use volume_surveillance::{
    DetectOptions, DetectorConfig, MonitorConfig, RecordOptions, RollingWindow, SpikeNotification,
    SpikeSeverity, SpikeType, SustainedConfig, TrackerConfig, VolumeMonitor,
};

static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

/// Readings after the warm up are scored at this offset.
const NOW: i64 = 40 * 60;

fn monitor(detector: DetectorConfig) -> VolumeMonitor {
    init_logging();
    VolumeMonitor::new(MonitorConfig {
        tracker: TrackerConfig::default(),
        detector,
    })
    .unwrap()
}

/// One sample per minute alternating 90 / 110: mean 100, population std 10.
fn warm_up(monitor: &mut VolumeMonitor, entity_id: &str) {
    for index in 0..40 {
        let volume = if index % 2 == 0 { 90.0 } else { 110.0 };
        assert!(monitor.add_sample(
            entity_id,
            volume,
            volume_surveillance::SampleOptions::at(t(index * 60)),
        ));
    }
}

#[test]
fn test_entity_without_samples_never_spikes() {
    let mut monitor = monitor(DetectorConfig::default());

    let baseline = monitor.baseline("unknown", RollingWindow::OneHour);
    assert!(!baseline.is_reliable);
    assert_eq!(baseline.sample_count, 0);

    let result = monitor.detect("unknown", 1_000_000.0, DetectOptions::at(t(0)));
    assert!(!result.is_spike);
    assert!(result.spike_event.is_none());
}

#[test]
fn test_baseline_statistics_and_idempotence() {
    let mut monitor = monitor(DetectorConfig::default());
    warm_up(&mut monitor, "market");

    let first = monitor.baseline("market", RollingWindow::OneHour);
    let second = monitor.baseline("market", RollingWindow::OneHour);

    assert!(first.is_reliable);
    assert_eq!(first.sample_count, 40);
    assert!((first.average_volume - 100.0).abs() < 1e-9);
    assert!((first.standard_deviation - 10.0).abs() < 1e-9);
    assert_eq!(
        first.average_volume.to_bits(),
        second.average_volume.to_bits()
    );
    assert_eq!(
        first.standard_deviation.to_bits(),
        second.standard_deviation.to_bits()
    );
    assert_eq!(first, second);
}

#[test]
fn test_reading_at_mean_is_not_a_spike() {
    let mut monitor = monitor(DetectorConfig::default());
    warm_up(&mut monitor, "market");

    let result = monitor.detect("market", 100.0, DetectOptions::at(t(NOW)));

    assert!(result.z_score.abs() < 1e-9);
    assert!(!result.is_spike);
}

#[test]
fn test_z_score_tiers() {
    let mut monitor = monitor(DetectorConfig::default());
    warm_up(&mut monitor, "market");

    let low = monitor.detect(
        "market",
        122.0,
        DetectOptions::at(t(NOW)).bypass_cooldown(),
    );
    assert!(low.severity >= Some(SpikeSeverity::Low));

    let critical = monitor.detect(
        "market",
        150.0,
        DetectOptions::at(t(NOW + 1)).bypass_cooldown(),
    );
    assert_eq!(critical.severity, Some(SpikeSeverity::Critical));
}

#[test]
fn test_five_times_baseline_is_critical_without_z_score() {
    let mut monitor = monitor(DetectorConfig {
        methods: volume_surveillance::DetectionMethods {
            z_score: false,
            percentage: true,
            absolute: false,
        },
        ..Default::default()
    });
    // Flat history: mean exactly 100, std 0
    for index in 0..40 {
        monitor.add_sample(
            "market",
            100.0,
            volume_surveillance::SampleOptions::at(t(index * 60)),
        );
    }

    let result = monitor.detect("market", 500.0, DetectOptions::at(t(NOW)));

    assert_eq!(result.percentage_of_baseline, 5.0);
    assert_eq!(result.severity, Some(SpikeSeverity::Critical));
}

#[test]
fn test_severity_is_monotonic() {
    let mut monitor = monitor(DetectorConfig::default());
    warm_up(&mut monitor, "market");

    let mut previous = None;
    for step in 0..400 {
        let volume = step as f64 * 2.5;
        let severity = monitor
            .detect(
                "market",
                volume,
                DetectOptions::at(t(NOW)).bypass_cooldown(),
            )
            .severity;
        assert!(severity >= previous, "severity dropped at volume {}", volume);
        previous = severity;
    }
}

#[test]
fn test_cooldown_emits_once_unless_bypassed() {
    let mut monitor = monitor(DetectorConfig::default());
    warm_up(&mut monitor, "a");
    warm_up(&mut monitor, "b");

    let first = monitor.detect("a", 500.0, DetectOptions::at(t(NOW)));
    let second = monitor.detect("a", 500.0, DetectOptions::at(t(NOW + 30)));
    assert!(first.spike_event.is_some());
    assert!(second.is_spike);
    assert!(second.spike_event.is_none());

    let first = monitor.detect("b", 500.0, DetectOptions::at(t(NOW)).bypass_cooldown());
    let second = monitor.detect(
        "b",
        500.0,
        DetectOptions::at(t(NOW + 30)).bypass_cooldown(),
    );
    assert!(first.spike_event.is_some());
    assert!(second.spike_event.is_some());

    assert_eq!(monitor.recent_spikes(10).len(), 3);
}

#[test]
fn test_sustained_on_third_reading() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let mut monitor = monitor(DetectorConfig {
        cooldown_ms: 0,
        sustained: SustainedConfig {
            min_consecutive_points: 3,
            min_duration_minutes: 0,
            ..Default::default()
        },
        ..Default::default()
    })
    .with_sink(volume_surveillance::ChannelSink::new(tx));
    warm_up(&mut monitor, "market");

    let types: Vec<Option<SpikeType>> = (0..3)
        .map(|offset| {
            monitor
                .detect("market", 500.0, DetectOptions::at(t(NOW + offset)))
                .spike_type
        })
        .collect();

    assert_eq!(types[2], Some(SpikeType::Sustained));
    assert_ne!(types[1], Some(SpikeType::Sustained));

    let mut sustained = 0;
    while let Ok(notification) = rx.try_recv() {
        if matches!(notification, SpikeNotification::Sustained(_)) {
            sustained += 1;
        }
    }
    assert_eq!(sustained, 1);
}

#[test]
fn test_gap_restarts_episode() {
    let mut monitor = monitor(DetectorConfig {
        cooldown_ms: 0,
        sustained: SustainedConfig {
            min_consecutive_points: 2,
            max_gap_minutes: 5,
            min_duration_minutes: 0,
            ..Default::default()
        },
        ..Default::default()
    });
    warm_up(&mut monitor, "market");

    monitor.detect("market", 500.0, DetectOptions::at(t(NOW)));
    let restarted = monitor.detect("market", 500.0, DetectOptions::at(t(NOW + 6 * 60)));

    assert_eq!(restarted.spike_type, Some(SpikeType::Momentary));
    assert_eq!(restarted.spike_event.unwrap().consecutive_points, 1);
}

#[test]
fn test_clear_entity_resets_state_and_counts() {
    let mut monitor = monitor(DetectorConfig::default());
    warm_up(&mut monitor, "market");
    let result = monitor.record(
        "market",
        1_000.0,
        RecordOptions::at(t(NOW)).with_trade_count(7),
    );
    assert!(result.is_spike);
    assert!(monitor.is_in_spike_state("market"));
    assert_eq!(monitor.activity("market").unwrap().trade_count, 7);

    monitor.clear_entity("market");

    assert!(!monitor.is_in_spike_state("market"));
    assert!(monitor.activity("market").is_none());
    assert_eq!(monitor.summary().tracked_entities, 0);
}
