use statrs::statistics::Statistics;
use std::collections::VecDeque;

pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;
pub const DEFAULT_SPIKE_THRESHOLD: f64 = 2.0;

/// Number of trailing values `detect_spike` treats as "recent".
pub const SPIKE_RECENT_LEN: usize = 5;

/// Fixed-capacity FIFO buffer of samples. Statistics are computed on demand
/// from the retained values.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.values.push_back(value);
        if self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().mean()
    }

    /// Sample standard deviation, 0 with fewer than two samples.
    pub fn stddev(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        self.values.iter().std_dev()
    }

    pub fn min(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Nearest-rank percentile, `p` in `0..=100`.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * n as f64).ceil() as usize;
        sorted[rank.clamp(1, n) - 1]
    }
}

/// Exponentially weighted moving average of a single series.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        let next = match self.value {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    /// `None` until the first update.
    pub fn get(&self) -> Option<f64> {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

pub fn z_score(value: f64, window: &RollingWindow) -> f64 {
    let std_dev = window.stddev();
    if std_dev == 0.0 {
        0.0
    } else {
        (value - window.mean()) / std_dev
    }
}

pub fn is_anomalous_z_score(z: f64, threshold: f64) -> bool {
    z.abs() >= threshold
}

/// Compares the last `SPIKE_RECENT_LEN` values against everything before them.
pub fn detect_spike(values: &[f64], threshold: f64) -> bool {
    if values.len() <= SPIKE_RECENT_LEN {
        return false;
    }

    let (baseline, recent) = values.split_at(values.len() - SPIKE_RECENT_LEN);
    if baseline.len() < 2 {
        return false;
    }

    let std_dev = baseline.iter().std_dev();
    if std_dev == 0.0 || std_dev.is_nan() {
        return false;
    }
    let mean = baseline.iter().mean();

    recent.iter().any(|v| ((v - mean) / std_dev).abs() > threshold)
}

pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return values.to_vec();
    }

    values
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect()
}

/// Pearson correlation; 0 when undefined.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}
