//! Adaptive performance control.
//!
//! [`PerformanceMonitor`] keeps rolling sync metrics; [`get_optimized_config`]
//! maps a network-quality tier to throttle and timeout knobs. Poorer tiers
//! trade freshness for fewer, larger updates.

use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Rolling metrics for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub sync_count: u64,
    /// Smoothed broadcast latency in milliseconds
    pub avg_latency_ms: f64,
    pub error_count: u64,
    /// Last sampled resident memory in bytes
    pub memory_usage: u64,
}

/// Limits past which [`PerformanceMonitor::should_optimize`] fires.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizeThresholds {
    pub max_avg_latency: Duration,
    pub max_errors: u64,
    pub max_memory_bytes: u64,
}

impl Default for OptimizeThresholds {
    fn default() -> Self {
        Self {
            max_avg_latency: Duration::from_millis(100),
            max_errors: 10,
            max_memory_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Shared metrics sink. Cheap to update from the hot path.
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    metrics: Mutex<PerformanceMetrics>,
    thresholds: OptimizeThresholds,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: OptimizeThresholds) -> Self {
        Self {
            metrics: Mutex::default(),
            thresholds,
        }
    }

    fn metrics(&self) -> std::sync::MutexGuard<'_, PerformanceMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one broadcast. Average is `(old + latest) / 2`; the first
    /// sample is taken as-is.
    pub fn record_sync(&self, latency: Duration) {
        let latest = latency.as_secs_f64() * 1000.0;
        let mut m = self.metrics();
        m.avg_latency_ms = if m.sync_count == 0 {
            latest
        } else {
            (m.avg_latency_ms + latest) / 2.0
        };
        m.sync_count += 1;
    }

    pub fn record_error(&self) {
        self.metrics().error_count += 1;
    }

    pub fn record_memory(&self, bytes: u64) {
        self.metrics().memory_usage = bytes;
    }

    /// Sample this process's resident memory. Returns the sampled value, or
    /// `None` when the platform does not expose it.
    pub fn sample_memory(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = System::new();
        system.refresh_process(pid);
        let bytes = system.process(pid)?.memory();
        self.record_memory(bytes);
        Some(bytes)
    }

    pub fn snapshot(&self) -> PerformanceMetrics {
        self.metrics().clone()
    }

    pub fn reset(&self) {
        *self.metrics() = PerformanceMetrics::default();
    }

    pub fn thresholds(&self) -> OptimizeThresholds {
        self.thresholds
    }

    /// Whether any metric crossed its threshold.
    pub fn should_optimize(&self) -> bool {
        let m = self.metrics();
        let t = &self.thresholds;
        m.avg_latency_ms > t.max_avg_latency.as_secs_f64() * 1000.0
            || m.error_count > t.max_errors
            || m.memory_usage > t.max_memory_bytes
    }
}

/// Network quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    /// Classify a measured round trip.
    pub fn from_rtt(rtt: Duration) -> Self {
        match rtt.as_millis() {
            0..=50 => NetworkQuality::Excellent,
            51..=150 => NetworkQuality::Good,
            151..=400 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }

    /// One tier worse (`Poor` stays `Poor`).
    pub fn degrade(self) -> Self {
        match self {
            NetworkQuality::Excellent => NetworkQuality::Good,
            NetworkQuality::Good => NetworkQuality::Fair,
            NetworkQuality::Fair | NetworkQuality::Poor => NetworkQuality::Poor,
        }
    }
}

/// Timing knobs for one quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceProfile {
    pub throttle_interval: Duration,
    pub session_throttle_interval: Duration,
    pub processing_delay: Duration,
    pub connect_timeout: Duration,
    pub max_updates_per_second: u32,
}

pub fn get_optimized_config(quality: NetworkQuality) -> PerformanceProfile {
    let (throttle, session, delay, timeout) = match quality {
        NetworkQuality::Excellent => (33, 100, 0, 3_000),
        NetworkQuality::Good => (50, 150, 10, 5_000),
        NetworkQuality::Fair => (100, 300, 25, 8_000),
        NetworkQuality::Poor => (250, 500, 50, 12_000),
    };
    PerformanceProfile {
        throttle_interval: Duration::from_millis(throttle),
        session_throttle_interval: Duration::from_millis(session),
        processing_delay: Duration::from_millis(delay),
        connect_timeout: Duration::from_millis(timeout),
        max_updates_per_second: (1000 / throttle) as u32,
    }
}
