use serde::{Deserialize, Serialize};

/// Latency percentiles in seconds, measured from creation to completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencySummary {
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub samples: usize,
}

impl LatencySummary {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.retain(|s| s.is_finite());
        samples.sort_by(|a, b| a.total_cmp(b));
        Self {
            p50: percentile(&samples, 50.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
            samples: samples.len(),
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

/// Point-in-time queue health. Derived from backend state, never authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueMetrics {
    pub backend: String,
    pub queue_size: u64,
    pub processing: u64,
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub success_rate: Option<f64>,
    pub latency: LatencySummary,
    pub oldest_pending_age_secs: Option<f64>,
    pub disk_usage_bytes: Option<u64>,
}

impl QueueMetrics {
    /// Completed over all terminal jobs; `None` before anything finished.
    pub fn compute_success_rate(&mut self) {
        let terminal = self.total_completed + self.total_failed + self.total_timed_out;
        self.success_rate = if terminal == 0 {
            None
        } else {
            Some(self.total_completed as f64 / terminal as f64)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_nearest_rank() {
        let samples: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&samples, 50.0), Some(50.0));
        assert_eq!(percentile(&samples, 95.0), Some(95.0));
        assert_eq!(percentile(&samples, 99.0), Some(99.0));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[3.0], 99.0), Some(3.0));
    }

    #[test]
    fn test_latency_summary_sorts_input() {
        let summary = LatencySummary::from_samples(vec![5.0, 1.0, 3.0]);
        assert_eq!(summary.p50, Some(3.0));
        assert_eq!(summary.p99, Some(5.0));
        assert_eq!(summary.samples, 3);
    }

    #[test]
    fn test_success_rate() {
        let mut metrics = QueueMetrics::default();
        metrics.compute_success_rate();
        assert_eq!(metrics.success_rate, None);

        metrics.total_completed = 3;
        metrics.total_failed = 1;
        metrics.compute_success_rate();
        assert_eq!(metrics.success_rate, Some(0.75));
    }
}
