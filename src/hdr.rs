//! HDR histogram wrapper: streaming latency percentiles.
//!
//! Range 1 µs – 60 s, 3 significant digits. Latencies are recorded in
//! milliseconds (as `f64`, matching `RequestMetric::latency_ms`) and stored
//! internally in microseconds because `hdrhistogram::Histogram<u64>` needs
//! an integer domain.

use hdrhistogram::Histogram;

const MIN_VALUE_US: u64 = 1;
const MAX_VALUE_US: u64 = 60_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;

/// A single HDR histogram over request latency, in milliseconds.
pub struct LatencyHistogram {
    inner: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            inner: Histogram::new_with_bounds(MIN_VALUE_US, MAX_VALUE_US, SIGNIFICANT_DIGITS)
                .expect("valid HDR histogram bounds"),
        }
    }

    /// Record one latency sample, in milliseconds. Values are clamped to the
    /// histogram's supported range rather than rejected.
    pub fn record_value(&mut self, latency_ms: f64) {
        let us = (latency_ms * 1000.0).round() as i64;
        let clamped = us.clamp(MIN_VALUE_US as i64, MAX_VALUE_US as i64) as u64;
        // `record` only fails when the value is out of range, which clamping
        // above already prevents.
        let _ = self.inner.record(clamped);
    }

    /// Percentile `p` in `[0, 100]`, in milliseconds. `NaN` on an empty
    /// histogram (serialized as `null` by `metrics_model`).
    pub fn get_percentile(&self, p: f64) -> f64 {
        if self.inner.is_empty() {
            return f64::NAN;
        }
        self.inner.value_at_quantile(p / 100.0) as f64 / 1000.0
    }

    pub fn min(&self) -> f64 {
        if self.inner.is_empty() {
            f64::NAN
        } else {
            self.inner.min() as f64 / 1000.0
        }
    }

    pub fn max(&self) -> f64 {
        if self.inner.is_empty() {
            f64::NAN
        } else {
            self.inner.max() as f64 / 1000.0
        }
    }

    pub fn mean(&self) -> f64 {
        if self.inner.is_empty() {
            f64::NAN
        } else {
            self.inner.mean() / 1000.0
        }
    }

    pub fn count(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn reset(&mut self) {
        self.inner.clear();
    }

    /// Merge another histogram's samples into this one (used to fold
    /// tick-local histograms into the cumulative one).
    pub fn merge(&mut self, other: &LatencyHistogram) {
        self.inner.add(&other.inner).expect("compatible histogram bounds");
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
