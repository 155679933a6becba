//! Execution history and performance estimates.
//!
//! The executor records one [`ExecutionSample`] per call into a bounded
//! rolling window. [`PerformancePredictor::predict`] turns the window into a
//! recency-weighted estimate of the next call's duration, fee and memory.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Samples kept when no window is given.
pub const DEFAULT_SAMPLE_WINDOW: usize = 1000;

/// Samples needed before history counts fully towards confidence.
const CONFIDENT_SAMPLES: usize = 50;

/// Accuracy assumed until predictions can be checked against outcomes.
const BASE_ACCURACY: f64 = 0.5;

const MAX_RECOMMENDED_INSTANCES: usize = 20;

/// One finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSample {
    pub duration: Duration,
    pub resource_used: u64,
    pub memory_used: u64,
    pub success: bool,
}

/// Estimate for the next execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub expected_duration: Duration,
    pub expected_resource_used: u64,
    pub expected_memory_used: u64,
    /// Share of failed executions in the window.
    pub failure_rate: f64,
    /// Successful samples the estimate is based on.
    pub samples: usize,
    /// 0.0..=1.0; grows with the number of samples.
    pub confidence: f64,
}

/// Rolling-window performance predictor.
pub struct PerformancePredictor {
    window: usize,
    samples: Mutex<VecDeque<ExecutionSample>>,
}

impl PerformancePredictor {
    /// Create a predictor keeping the last `window` samples. A zero window
    /// falls back to [`DEFAULT_SAMPLE_WINDOW`].
    pub fn new(window: usize) -> Self {
        let window = if window == 0 {
            DEFAULT_SAMPLE_WINDOW
        } else {
            window
        };
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, sample: ExecutionSample) {
        let mut samples = self.samples.lock();
        while samples.len() >= self.window {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Recency-weighted averages over the successful samples in the window.
    ///
    /// With no successful sample yet the estimate is 100ms, a fee of 1000
    /// and 1 MiB of memory.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn predict(&self) -> Prediction {
        let samples = self.samples.lock();
        let failed = samples.iter().filter(|s| !s.success).count();
        let failure_rate = if samples.is_empty() {
            0.0
        } else {
            failed as f64 / samples.len() as f64
        };

        let succeeded: Vec<_> = samples.iter().filter(|s| s.success).collect();
        let count = succeeded.len();
        let confidence = confidence(count);

        if count == 0 {
            return Prediction {
                expected_duration: Duration::from_millis(100),
                expected_resource_used: 1000,
                expected_memory_used: 1024 * 1024,
                failure_rate,
                samples: 0,
                confidence,
            };
        }

        // Weight i+1 over n: the newest sample counts most
        let mut total_weight = 0.0;
        let mut duration = 0.0;
        let mut resource = 0.0;
        let mut memory = 0.0;
        for (index, sample) in succeeded.iter().enumerate() {
            let weight = (index + 1) as f64 / count as f64;
            total_weight += weight;
            duration += sample.duration.as_nanos() as f64 * weight;
            resource += sample.resource_used as f64 * weight;
            memory += sample.memory_used as f64 * weight;
        }

        Prediction {
            expected_duration: Duration::from_nanos((duration / total_weight).round() as u64),
            expected_resource_used: (resource / total_weight).round() as u64,
            expected_memory_used: (memory / total_weight).round() as u64,
            failure_rate,
            samples: count,
            confidence,
        }
    }

    /// Warm instances worth keeping per module for the predicted load.
    ///
    /// One instance, plus one per second of expected duration, plus one per
    /// 100 000 units of expected fee, plus one or two more when the pool hit
    /// rate is below 80% or 50%. Clamped to 1..=20.
    #[allow(clippy::cast_possible_truncation)]
    pub fn recommended_instances(&self, pool_hit_rate: f64) -> usize {
        let prediction = self.predict();
        let mut instances = 1usize;

        let millis = prediction.expected_duration.as_millis();
        if millis > 1000 {
            instances += (millis / 1000) as usize;
        }
        if prediction.expected_resource_used > 100_000 {
            instances += (prediction.expected_resource_used / 100_000) as usize;
        }
        if pool_hit_rate < 0.5 {
            instances += 2;
        } else if pool_hit_rate < 0.8 {
            instances += 1;
        }

        instances.clamp(1, MAX_RECOMMENDED_INSTANCES)
    }
}

impl Default for PerformancePredictor {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

impl std::fmt::Debug for PerformancePredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformancePredictor")
            .field("window", &self.window)
            .field("samples", &self.len())
            .finish()
    }
}

#[allow(clippy::cast_precision_loss)]
fn confidence(samples: usize) -> f64 {
    let data = samples.min(CONFIDENT_SAMPLES) as f64 / CONFIDENT_SAMPLES as f64 * 0.4;
    data + BASE_ACCURACY * 0.4 + 0.2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(millis: u64, resource_used: u64) -> ExecutionSample {
        ExecutionSample {
            duration: Duration::from_millis(millis),
            resource_used,
            memory_used: 65_536,
            success: true,
        }
    }

    #[test]
    fn test_empty_history_uses_defaults() {
        let predictor = PerformancePredictor::default();
        let prediction = predictor.predict();

        assert_eq!(prediction.expected_duration, Duration::from_millis(100));
        assert_eq!(prediction.expected_resource_used, 1000);
        assert_eq!(prediction.samples, 0);
        assert!((prediction.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_recent_samples_weigh_more() {
        let predictor = PerformancePredictor::new(10);
        predictor.record(sample(10, 100));
        predictor.record(sample(40, 400));

        // Weights 1/2 and 2/2: (100 * 0.5 + 400 * 1.0) / 1.5
        let prediction = predictor.predict();
        assert_eq!(prediction.expected_resource_used, 300);
        assert_eq!(prediction.expected_duration, Duration::from_millis(30));
        assert_eq!(prediction.expected_memory_used, 65_536);
        assert_eq!(prediction.samples, 2);
    }

    #[test]
    fn test_window_drops_oldest() {
        let predictor = PerformancePredictor::new(2);
        predictor.record(sample(1, 1_000_000));
        predictor.record(sample(1, 10));
        predictor.record(sample(1, 10));

        assert_eq!(predictor.len(), 2);
        assert_eq!(predictor.predict().expected_resource_used, 10);
    }

    #[test]
    fn test_failures_excluded_from_estimate() {
        let predictor = PerformancePredictor::new(10);
        predictor.record(sample(5, 50));
        predictor.record(ExecutionSample {
            success: false,
            ..sample(5_000, 0)
        });

        let prediction = predictor.predict();
        assert_eq!(prediction.expected_resource_used, 50);
        assert_eq!(prediction.samples, 1);
        assert!((prediction.failure_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recommended_instances() {
        let predictor = PerformancePredictor::new(10);
        assert_eq!(predictor.recommended_instances(0.9), 1);
        assert_eq!(predictor.recommended_instances(0.6), 2);
        assert_eq!(predictor.recommended_instances(0.1), 3);

        predictor.record(sample(2_500, 250_000));
        assert_eq!(predictor.recommended_instances(0.9), 5);

        predictor.record(sample(600_000, 0));
        assert_eq!(predictor.recommended_instances(0.0), 20);
    }
}
