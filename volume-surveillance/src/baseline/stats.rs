/// Single-pass mean and population variance (Welford's algorithm).
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.mean }
    }

    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        // Rounding can leave m2 a hair below zero for constant series
        let std_dev = (self.m2 / self.count as f64).max(0.0).sqrt();
        debug_assert!(std_dev >= 0.0, "standard deviation must be non-negative");
        std_dev
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = Self::default();
        iter.into_iter().for_each(|value| stats.push(value));
        stats
    }
}
