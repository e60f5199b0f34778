//! Recompilation metrics

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Counters and latency percentiles for recompilation passes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompilerMetrics {
    /// Triggers received by the scheduler
    pub triggers: u64,

    /// Triggers folded into an already pending pass
    pub coalesced: u64,

    /// Passes that replaced assignments
    pub completed: u64,

    /// Passes that returned an error
    pub failed: u64,

    /// Passes cut off by the compile timeout
    pub timeouts: u64,

    /// Passes that panicked
    pub panics: u64,

    /// Assignments written across all completed passes
    pub assignments_written: u64,

    /// Resync requests issued and how many of them failed
    pub resync_requested: u64,
    pub resync_failed: u64,

    /// Pass latency
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub avg_latency_ms: f64,
}

impl CompilerMetrics {
    /// Share of finished passes that completed
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed + self.timeouts + self.panics;
        if total == 0 {
            0.0
        } else {
            self.completed as f64 / total as f64
        }
    }
}

/// Collects [`CompilerMetrics`] from concurrent workers
pub struct MetricsCollector {
    metrics: Arc<RwLock<CompilerMetrics>>,

    /// Recent pass latencies for percentile calculation
    latency_samples: Arc<RwLock<Vec<f64>>>,

    max_samples: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(CompilerMetrics::default())),
            latency_samples: Arc::new(RwLock::new(Vec::with_capacity(1_024))),
            max_samples: 1_024,
        }
    }

    /// Record the triggers folded into one pass
    pub async fn record_triggers(&self, received: u64) {
        let mut metrics = self.metrics.write().await;
        metrics.triggers += received;
        metrics.coalesced += received.saturating_sub(1);
    }

    /// Record a completed pass and its latency
    pub async fn record_completed(&self, assignments: usize, latency: Duration) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.completed += 1;
            metrics.assignments_written += assignments as u64;
        }
        self.record_latency(latency).await;
    }

    pub async fn record_failed(&self) {
        self.metrics.write().await.failed += 1;
    }

    pub async fn record_timeout(&self) {
        self.metrics.write().await.timeouts += 1;
    }

    pub async fn record_panic(&self) {
        self.metrics.write().await.panics += 1;
    }

    pub async fn record_resync(&self, requested: usize, failed: usize) {
        let mut metrics = self.metrics.write().await;
        metrics.resync_requested += requested as u64;
        metrics.resync_failed += failed as u64;
    }

    async fn record_latency(&self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;

        let mut samples = self.latency_samples.write().await;
        samples.push(latency_ms);
        if samples.len() > self.max_samples {
            samples.drain(0..self.max_samples / 8);
        }

        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let mut metrics = self.metrics.write().await;
        metrics.avg_latency_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
        metrics.latency_p50_ms = Self::percentile(&sorted, 0.50);
        metrics.latency_p99_ms = Self::percentile(&sorted, 0.99);
    }

    /// Current metrics snapshot
    pub async fn snapshot(&self) -> CompilerMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = CompilerMetrics::default();
        self.latency_samples.write().await.clear();
    }

    fn percentile(sorted: &[f64], p: f64) -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }

        let index = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[index.min(sorted.len() - 1)]
    }
}
