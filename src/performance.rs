//! Performance monitoring: client web-vital ingestion, threshold alerts,
//! rolling averages, scoring, and server self-sampling.
//!
//! ## Design
//! - Samples land in a 1000-entry FIFO log; analysis never mutates them
//! - Threshold analysis emits ONE bundled warning alert per violating sample,
//!   not one alert per metric
//! - A repeating task samples this process every `sample_interval`, publishing
//!   memory/CPU/uptime as a sample tagged `url = "server"` with the five
//!   web-vital fields zeroed
//! - Thresholds are runtime-mutable behind a mutex

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;

use crate::hub::{PubSub, Scope};
use crate::store::BoundedLog;
use crate::task::RepeatingTask;
use crate::{emit_alert, now_ms, AlertLevel, EVENT_PERFORMANCE_UPDATE, METRICS_ROOM};

/// Maximum samples retained in memory.
const MAX_SAMPLES: usize = 1000;

/// Score deductions per violated threshold; independent, floored at 0.
const SCORE_WEIGHT_PAGE_LOAD: i32 = 20;
const SCORE_WEIGHT_FCP: i32 = 15;
const SCORE_WEIGHT_LCP: i32 = 20;
const SCORE_WEIGHT_CLS: i32 = 25;
const SCORE_WEIGHT_INP: i32 = 20;

// ---------------------------------------------------------------------------
// Sample model
// ---------------------------------------------------------------------------

/// One page-metrics report, client-submitted or server self-sampled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    #[serde(default)]
    pub page_load_time: f64,
    #[serde(default)]
    pub first_contentful_paint: f64,
    #[serde(default)]
    pub largest_contentful_paint: f64,
    #[serde(default)]
    pub cumulative_layout_shift: f64,
    #[serde(default)]
    pub interaction_to_next_paint: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_latency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    /// Unix millis; 0 means "stamp at ingestion".
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user_agent: String,
}

impl Default for PerformanceSample {
    fn default() -> Self {
        PerformanceSample {
            page_load_time: 0.0,
            first_contentful_paint: 0.0,
            largest_contentful_paint: 0.0,
            cumulative_layout_shift: 0.0,
            interaction_to_next_paint: 0.0,
            memory_usage: None,
            network_latency: None,
            render_time: None,
            bundle_size: None,
            cpu_usage: None,
            uptime_seconds: None,
            timestamp: 0,
            url: String::new(),
            user_agent: String::new(),
        }
    }
}

/// Web-vital ceilings a sample is evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceThresholds {
    pub page_load_time: f64,
    pub first_contentful_paint: f64,
    pub largest_contentful_paint: f64,
    pub cumulative_layout_shift: f64,
    pub interaction_to_next_paint: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        PerformanceThresholds {
            page_load_time: 3000.0,
            first_contentful_paint: 1800.0,
            largest_contentful_paint: 2500.0,
            cumulative_layout_shift: 0.1,
            interaction_to_next_paint: 200.0,
        }
    }
}

/// Partial threshold update; absent fields keep their current values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdUpdate {
    pub page_load_time: Option<f64>,
    pub first_contentful_paint: Option<f64>,
    pub largest_contentful_paint: Option<f64>,
    pub cumulative_layout_shift: Option<f64>,
    pub interaction_to_next_paint: Option<f64>,
}

/// Per-field arithmetic means over a time window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AverageMetrics {
    pub page_load_time: f64,
    pub first_contentful_paint: f64,
    pub largest_contentful_paint: f64,
    pub cumulative_layout_shift: f64,
    pub interaction_to_next_paint: f64,
    pub sample_count: usize,
    pub window: String,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct PerformanceMonitor {
    samples: Mutex<BoundedLog<PerformanceSample>>,
    thresholds: Mutex<PerformanceThresholds>,
    pubsub: Arc<dyn PubSub>,
    sampler: RepeatingTask,
    system: Mutex<System>,
    started: Instant,
}

impl PerformanceMonitor {
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        PerformanceMonitor {
            samples: Mutex::new(BoundedLog::new(MAX_SAMPLES)),
            thresholds: Mutex::new(PerformanceThresholds::default()),
            pubsub,
            sampler: RepeatingTask::new("performance-self-sampler"),
            system: Mutex::new(System::new()),
            started: Instant::now(),
        }
    }

    /// Ingest one sample: stamp, store, evaluate thresholds, fan out.
    pub fn record_metrics(&self, mut sample: PerformanceSample) {
        if sample.timestamp == 0 {
            sample.timestamp = now_ms();
        }
        {
            let mut samples = match self.samples.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            samples.push(sample.clone());
        }

        let issues = self.threshold_issues(&sample);
        if !issues.is_empty() {
            emit_alert(
                self.pubsub.as_ref(),
                AlertLevel::Warning,
                "performance-monitor",
                format!(
                    "Performance issues on {}: {}",
                    display_url(&sample.url),
                    issues.join("; ")
                ),
            );
        }

        match serde_json::to_value(&sample) {
            Ok(payload) => {
                self.pubsub
                    .publish(Scope::Room(METRICS_ROOM), EVENT_PERFORMANCE_UPDATE, payload);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize performance sample"),
        }
    }

    /// Human-readable threshold violations for one sample, in metric order.
    pub fn threshold_issues(&self, sample: &PerformanceSample) -> Vec<String> {
        let t = self.thresholds();
        let mut issues = Vec::new();
        if sample.page_load_time > t.page_load_time {
            issues.push(format!(
                "pageLoadTime {:.0}ms exceeds {:.0}ms",
                sample.page_load_time, t.page_load_time
            ));
        }
        if sample.first_contentful_paint > t.first_contentful_paint {
            issues.push(format!(
                "firstContentfulPaint {:.0}ms exceeds {:.0}ms",
                sample.first_contentful_paint, t.first_contentful_paint
            ));
        }
        if sample.largest_contentful_paint > t.largest_contentful_paint {
            issues.push(format!(
                "largestContentfulPaint {:.0}ms exceeds {:.0}ms",
                sample.largest_contentful_paint, t.largest_contentful_paint
            ));
        }
        if sample.cumulative_layout_shift > t.cumulative_layout_shift {
            issues.push(format!(
                "cumulativeLayoutShift {:.3} exceeds {:.3}",
                sample.cumulative_layout_shift, t.cumulative_layout_shift
            ));
        }
        if sample.interaction_to_next_paint > t.interaction_to_next_paint {
            issues.push(format!(
                "interactionToNextPaint {:.0}ms exceeds {:.0}ms",
                sample.interaction_to_next_paint, t.interaction_to_next_paint
            ));
        }
        issues
    }

    /// Start the periodic server self-sampling loop.
    pub fn start_sampling(self: &Arc<Self>, sample_interval: Duration) {
        let monitor = Arc::clone(self);
        self.sampler.start(sample_interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                let sample = monitor.collect_server_sample();
                monitor.record_metrics(sample);
            }
        });
    }

    /// Stop the self-sampling loop. Idempotent.
    pub fn stop(&self) {
        self.sampler.stop();
    }

    fn collect_server_sample(&self) -> PerformanceSample {
        let (memory_bytes, cpu_pct) = {
            let mut system = match self.system.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match sysinfo::get_current_pid() {
                Ok(pid) => {
                    system.refresh_process(pid);
                    match system.process(pid) {
                        Some(process) => {
                            (process.memory() as f64, f64::from(process.cpu_usage()))
                        }
                        None => (0.0, 0.0),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = e, "current pid unavailable for self-sampling");
                    (0.0, 0.0)
                }
            }
        };

        PerformanceSample {
            memory_usage: Some(memory_bytes),
            cpu_usage: Some(cpu_pct),
            uptime_seconds: Some(self.started.elapsed().as_secs()),
            timestamp: now_ms(),
            url: "server".to_string(),
            user_agent: "sitewatch/self-sampler".to_string(),
            ..PerformanceSample::default()
        }
    }

    /// Per-field means over samples newer than `window_minutes`.
    ///
    /// Returns `None` when the window holds no samples, never a zero-filled
    /// aggregate.
    pub fn average_metrics(&self, window_minutes: u64) -> Option<AverageMetrics> {
        let cutoff = now_ms().saturating_sub(window_minutes * 60 * 1000);
        let windowed: Vec<PerformanceSample> = {
            let samples = match self.samples.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            samples
                .iter()
                .filter(|s| s.timestamp >= cutoff)
                .cloned()
                .collect()
        };
        if windowed.is_empty() {
            return None;
        }

        let n = windowed.len() as f64;
        let mean = |f: fn(&PerformanceSample) -> f64| windowed.iter().map(f).sum::<f64>() / n;

        Some(AverageMetrics {
            page_load_time: mean(|s| s.page_load_time).round(),
            first_contentful_paint: mean(|s| s.first_contentful_paint).round(),
            largest_contentful_paint: mean(|s| s.largest_contentful_paint).round(),
            cumulative_layout_shift: (mean(|s| s.cumulative_layout_shift) * 1000.0).round()
                / 1000.0,
            interaction_to_next_paint: mean(|s| s.interaction_to_next_paint).round(),
            sample_count: windowed.len(),
            window: format!("last {window_minutes} minutes"),
        })
    }

    /// 0–100 score: independent fixed deductions per violated threshold.
    pub fn performance_score(&self, sample: &PerformanceSample) -> u32 {
        let t = self.thresholds();
        let mut score: i32 = 100;
        if sample.page_load_time > t.page_load_time {
            score -= SCORE_WEIGHT_PAGE_LOAD;
        }
        if sample.first_contentful_paint > t.first_contentful_paint {
            score -= SCORE_WEIGHT_FCP;
        }
        if sample.largest_contentful_paint > t.largest_contentful_paint {
            score -= SCORE_WEIGHT_LCP;
        }
        if sample.cumulative_layout_shift > t.cumulative_layout_shift {
            score -= SCORE_WEIGHT_CLS;
        }
        if sample.interaction_to_next_paint > t.interaction_to_next_paint {
            score -= SCORE_WEIGHT_INP;
        }
        score.max(0) as u32
    }

    /// Apply a partial threshold update at runtime.
    pub fn update_thresholds(&self, update: ThresholdUpdate) {
        let mut t = match self.thresholds.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(v) = update.page_load_time {
            t.page_load_time = v;
        }
        if let Some(v) = update.first_contentful_paint {
            t.first_contentful_paint = v;
        }
        if let Some(v) = update.largest_contentful_paint {
            t.largest_contentful_paint = v;
        }
        if let Some(v) = update.cumulative_layout_shift {
            t.cumulative_layout_shift = v;
        }
        if let Some(v) = update.interaction_to_next_paint {
            t.interaction_to_next_paint = v;
        }
    }

    pub fn thresholds(&self) -> PerformanceThresholds {
        match self.thresholds.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Most recent samples, newest first (API surface).
    pub fn recent_samples(&self, limit: usize) -> Vec<PerformanceSample> {
        match self.samples.lock() {
            Ok(g) => g.recent(limit),
            Err(_) => Vec::new(),
        }
    }

    /// Number of buffered samples (health reporting).
    pub fn sample_count(&self) -> usize {
        self.samples.lock().map(|g| g.len()).unwrap_or(0)
    }
}

fn display_url(url: &str) -> &str {
    if url.is_empty() {
        "unknown"
    } else {
        url
    }
}
