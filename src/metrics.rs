//! Polling adapter health metrics
//!
//! Tracks cycle latency percentiles and success rates per adapter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Maximum number of samples to keep for metrics calculation
const MAX_SAMPLES: usize = 100;

/// Metrics for a single polling adapter
#[derive(Debug, Clone)]
pub struct AdapterMetrics {
    /// Source name and target, e.g. `coingecko:bitcoin`
    pub adapter: String,
    /// 50th percentile cycle latency in milliseconds
    pub latency_p50_ms: f64,
    /// 99th percentile cycle latency in milliseconds
    pub latency_p99_ms: f64,
    /// Success rate (0.0 to 1.0)
    pub success_rate: f64,
    pub total_cycles: u64,
    pub failed_cycles: u64,
}

impl AdapterMetrics {
    /// Creates metrics with no data
    pub fn empty(adapter: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
            latency_p50_ms: 0.0,
            latency_p99_ms: 0.0,
            success_rate: 1.0,
            total_cycles: 0,
            failed_cycles: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct CycleSample {
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    failed: u64,
}

/// Collects cycle samples for one adapter
pub struct MetricsCollector {
    adapter: String,
    /// Rolling window of cycle samples
    samples: Arc<RwLock<VecDeque<CycleSample>>>,
    /// Lifetime totals
    counters: Arc<RwLock<Counters>>,
}

impl MetricsCollector {
    pub fn new(adapter: &str) -> Self {
        Self {
            adapter: adapter.to_string(),
            samples: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_SAMPLES))),
            counters: Arc::new(RwLock::new(Counters::default())),
        }
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    /// Records one polling cycle
    ///
    /// `success` covers both "published" and "nothing new"; rate limits and
    /// errors count as failures.
    pub async fn record_cycle(&self, duration: Duration, success: bool) {
        {
            let mut counters = self.counters.write().await;
            counters.total += 1;
            if !success {
                counters.failed += 1;
            }
        }

        let mut samples = self.samples.write().await;
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(CycleSample {
            duration_ms: duration.as_secs_f64() * 1000.0,
            success,
        });
    }

    /// Computes current metrics from collected samples
    pub async fn snapshot(&self) -> AdapterMetrics {
        let samples = self.samples.read().await;
        if samples.is_empty() {
            return AdapterMetrics::empty(&self.adapter);
        }
        let (total, failed) = {
            let counters = self.counters.read().await;
            (counters.total, counters.failed)
        };

        let mut latencies: Vec<f64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration_ms)
            .collect();
        latencies.sort_by(|a, b| a.total_cmp(b));

        let success_rate = if total > 0 {
            (total - failed) as f64 / total as f64
        } else {
            1.0
        };

        AdapterMetrics {
            adapter: self.adapter.clone(),
            latency_p50_ms: percentile(&latencies, 50.0),
            latency_p99_ms: percentile(&latencies, 99.0),
            success_rate,
            total_cycles: total,
            failed_cycles: failed,
        }
    }
}

/// Calculate percentile from sorted values
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let idx = (p / 100.0 * (sorted_values.len() - 1) as f64).round() as usize;
    sorted_values[idx.min(sorted_values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cycle_metrics() {
        let collector = MetricsCollector::new("coingecko:bitcoin");

        collector.record_cycle(Duration::from_millis(100), true).await;
        collector.record_cycle(Duration::from_millis(200), true).await;
        collector.record_cycle(Duration::from_millis(150), false).await;

        let metrics = collector.snapshot().await;

        assert_eq!(metrics.adapter, "coingecko:bitcoin");
        assert_eq!(metrics.total_cycles, 3);
        assert_eq!(metrics.failed_cycles, 1);
        assert!(metrics.success_rate > 0.6 && metrics.success_rate < 0.7);
        // Failed cycles do not skew latency
        assert_eq!(metrics.latency_p99_ms, 200.0);
    }

    #[tokio::test]
    async fn test_empty_collector_reports_healthy() {
        let metrics = MetricsCollector::new("idle").snapshot().await;
        assert_eq!(metrics.total_cycles, 0);
        assert_eq!(metrics.success_rate, 1.0);
    }

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        assert_eq!(percentile(&values, 50.0), 5.0);
        assert_eq!(percentile(&values, 99.0), 9.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }
}
