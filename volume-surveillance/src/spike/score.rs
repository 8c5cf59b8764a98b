use super::{SpikeDirection, SpikeSeverity};
use crate::{baseline::BaselineStats, config::DetectorConfig};

/// Statistics of one reading relative to a baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub z_score: f64,
    pub percentage_of_baseline: f64,
    pub direction: SpikeDirection,
    /// Most severe tier reached by any enabled method.
    pub severity: Option<SpikeSeverity>,
}

/// Score `volume` against `baseline` with every method enabled in `config`.
///
/// Methods never downgrade each other: the result is the maximum of their tiers.
pub fn score(config: &DetectorConfig, baseline: &BaselineStats, volume: f64) -> Score {
    let mean = baseline.average_volume;
    let std_dev = baseline.standard_deviation;

    let z_score = if std_dev > 0.0 {
        (volume - mean) / std_dev
    } else {
        0.0
    };
    let percentage_of_baseline = if mean > 0.0 {
        volume / mean
    } else {
        f64::INFINITY
    };

    let by_z_score = config.methods.z_score.then(|| {
        if z_score > 0.0 {
            config.z_score_thresholds.classify(z_score)
        } else if config.detect_drops && z_score < 0.0 {
            config.z_score_thresholds.classify(-z_score)
        } else {
            None
        }
    });

    // Only readings above the mean can be a multiple of it
    let by_percentage = (config.methods.percentage && volume > mean)
        .then(|| config.percentage_thresholds.classify(percentage_of_baseline));

    let by_absolute = config
        .methods
        .absolute
        .then(|| config.absolute_thresholds.classify(volume));

    let severity = [by_z_score, by_percentage, by_absolute]
        .into_iter()
        .flatten()
        .flatten()
        .max();

    Score {
        z_score,
        percentage_of_baseline,
        direction: if volume >= mean {
            SpikeDirection::Up
        } else {
            SpikeDirection::Down
        },
        severity,
    }
}
