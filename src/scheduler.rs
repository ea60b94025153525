//! Test scheduler: periodic and on-demand suite cycles with a single-flight
//! guard, summary aggregation, and regression alerting.
//!
//! ## Design
//! - One cycle runs immediately at `start`, then every `auto_run_interval`
//! - The single-flight guard is an atomic compare-and-swap Idle→Running
//!   state machine; triggers colliding with a running cycle are logged and
//!   dropped, never queued
//! - Browsers run sequentially, files sequentially within a browser, so
//!   result ordering is deterministic for a given configuration
//! - `stop` only prevents future cycles; an in-flight cycle completes
//! - Only the most recent summary is retained

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::hub::PubSub;
use crate::runner::{SuiteConfig, SuiteRunner, TestResult, TestStatus};
use crate::task::RepeatingTask;
use crate::{emit_alert, now_ms, AlertLevel};

/// Pass rates under this percentage raise a warning alert.
const PASS_RATE_WARN_PCT: f64 = 80.0;

/// Failed tests whose name contains this substring raise a critical alert.
const CRITICAL_NAME_MARKER: &str = "critical";

// ---------------------------------------------------------------------------
// Summary model
// ---------------------------------------------------------------------------

/// Aggregated outcome of one scheduler cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSummary {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: u64,
    pub timestamp: u64,
    pub results: Vec<TestResult>,
}

impl TestRunSummary {
    /// Build a summary from raw results; the counters are derived from the
    /// results themselves so `passed + failed + skipped == total_tests` holds
    /// by construction. Timeouts count as failures.
    pub fn from_results(results: Vec<TestResult>, duration: Duration) -> Self {
        let passed = results
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count();
        let failed = results
            .iter()
            .filter(|r| matches!(r.status, TestStatus::Failed | TestStatus::Timeout))
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.status == TestStatus::Skipped)
            .count();
        TestRunSummary {
            total_tests: results.len(),
            passed,
            failed,
            skipped,
            duration: duration.as_millis() as u64,
            timestamp: now_ms(),
            results,
        }
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total_tests == 0 {
            100.0
        } else {
            (self.passed as f64 / self.total_tests as f64) * 100.0
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub auto_run_interval: Duration,
    pub browsers: Vec<String>,
    pub base_url: String,
    pub test_files: Vec<String>,
    /// Files re-run by `run_critical_path_tests`; configurable, not baked in.
    pub critical_path_tests: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            auto_run_interval: Duration::from_secs(30 * 60),
            browsers: vec!["chromium".to_string(), "firefox".to_string()],
            base_url: "http://localhost:3000".to_string(),
            test_files: vec![
                "home.spec".to_string(),
                "navigation.spec".to_string(),
                "game.spec".to_string(),
            ],
            critical_path_tests: vec![
                "critical-home.spec".to_string(),
                "critical-game.spec".to_string(),
            ],
        }
    }
}

/// Partial runtime reconfiguration; absent fields keep their values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigUpdate {
    pub auto_run_interval_ms: Option<u64>,
    pub browsers: Option<Vec<String>>,
    pub base_url: Option<String>,
    pub test_files: Option<Vec<String>>,
    pub critical_path_tests: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Releases the single-flight guard when the cycle scope ends, success or
/// failure.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TestScheduler {
    config: Mutex<SchedulerConfig>,
    runner: Arc<dyn SuiteRunner>,
    pubsub: Arc<dyn PubSub>,
    in_flight: AtomicBool,
    last_results: Mutex<Option<TestRunSummary>>,
    timer: RepeatingTask,
}

impl TestScheduler {
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn SuiteRunner>,
        pubsub: Arc<dyn PubSub>,
    ) -> Arc<Self> {
        Arc::new(TestScheduler {
            config: Mutex::new(config),
            runner,
            pubsub,
            in_flight: AtomicBool::new(false),
            last_results: Mutex::new(None),
            timer: RepeatingTask::new("test-scheduler"),
        })
    }

    /// Run one cycle immediately, then repeat at the configured interval.
    pub fn start(self: &Arc<Self>) {
        let interval = self.config_snapshot().auto_run_interval;
        self.arm_timer(interval);
    }

    /// Cancel future cycles. Idempotent; safe when never started.
    pub fn stop(&self) {
        self.timer.stop();
    }

    /// One scheduled cycle behind the single-flight guard.
    ///
    /// A trigger arriving while a cycle is running performs no test execution
    /// and leaves `last_results` untouched.
    pub async fn run_scheduled_tests(&self) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("test cycle already running; trigger dropped");
            return;
        }
        let _guard = FlightGuard(&self.in_flight);

        let summary = self.run_tests(None).await;
        self.store_results(summary.clone());
        self.analyze_results(&summary);
    }

    /// Run every configured browser over the configured (or one specific)
    /// suite and aggregate the outcome. Does not take the single-flight
    /// guard; a manual trigger racing the timer is an accepted hazard of the
    /// current design.
    pub async fn run_tests(&self, specific_suite: Option<&str>) -> TestRunSummary {
        let config = self.config_snapshot();
        let files = match specific_suite {
            Some(suite) => vec![suite.to_string()],
            None => config.test_files.clone(),
        };
        self.run_files(&config, files).await
    }

    /// Manual trigger from the API: run, retain, analyze.
    pub async fn run_manual(&self, specific_suite: Option<&str>) -> TestRunSummary {
        let summary = self.run_tests(specific_suite).await;
        self.store_results(summary.clone());
        self.analyze_results(&summary);
        summary
    }

    /// Run the configured critical-path files as a dedicated summary.
    pub async fn run_critical_path_tests(&self) -> TestRunSummary {
        let config = self.config_snapshot();
        let files = config.critical_path_tests.clone();
        let summary = self.run_files(&config, files).await;
        self.analyze_results(&summary);
        summary
    }

    async fn run_files(&self, config: &SchedulerConfig, files: Vec<String>) -> TestRunSummary {
        let started = Instant::now();
        let mut results: Vec<TestResult> = Vec::new();
        for browser in &config.browsers {
            let suite = SuiteConfig {
                browser: browser.clone(),
                test_files: files.clone(),
                base_url: config.base_url.clone(),
                parallel: false,
                timeout: None,
                retries: None,
            };
            results.extend(self.runner.run_suite(suite).await);
        }
        let summary = TestRunSummary::from_results(results, started.elapsed());
        tracing::info!(
            total = summary.total_tests,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration,
            "test cycle finished"
        );
        summary
    }

    /// Pass-rate and critical-name alerting over one summary.
    pub fn analyze_results(&self, summary: &TestRunSummary) {
        if summary.total_tests == 0 {
            return;
        }

        let rate = summary.pass_rate();
        if rate < PASS_RATE_WARN_PCT {
            emit_alert(
                self.pubsub.as_ref(),
                AlertLevel::Warning,
                "test-scheduler",
                format!(
                    "Test pass rate {rate:.1}% ({}/{}) below {PASS_RATE_WARN_PCT:.0}%",
                    summary.passed, summary.total_tests
                ),
            );
        }

        let critical_failures: Vec<&str> = summary
            .results
            .iter()
            .filter(|r| {
                matches!(r.status, TestStatus::Failed | TestStatus::Timeout)
                    && r.test_name.contains(CRITICAL_NAME_MARKER)
            })
            .map(|r| r.test_name.as_str())
            .collect();
        if !critical_failures.is_empty() {
            emit_alert(
                self.pubsub.as_ref(),
                AlertLevel::Critical,
                "test-scheduler",
                format!("Critical tests failing: {}", critical_failures.join(", ")),
            );
        }
    }

    /// The most recent summary, if any cycle has completed yet.
    pub fn latest_results(&self) -> Option<TestRunSummary> {
        match self.last_results.lock() {
            Ok(g) => g.clone(),
            Err(_) => None,
        }
    }

    /// Apply a partial reconfiguration; a changed interval re-arms a running
    /// timer.
    pub fn update_config(self: &Arc<Self>, update: SchedulerConfigUpdate) {
        let mut interval_changed = None;
        {
            let mut config = match self.config.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(ms) = update.auto_run_interval_ms {
                let interval = Duration::from_millis(ms);
                if interval != config.auto_run_interval {
                    config.auto_run_interval = interval;
                    interval_changed = Some(interval);
                }
            }
            if let Some(browsers) = update.browsers {
                config.browsers = browsers;
            }
            if let Some(base_url) = update.base_url {
                config.base_url = base_url;
            }
            if let Some(test_files) = update.test_files {
                config.test_files = test_files;
            }
            if let Some(critical) = update.critical_path_tests {
                config.critical_path_tests = critical;
            }
        }
        if let Some(interval) = interval_changed {
            if self.timer.is_running() {
                self.timer.stop();
                self.arm_timer(interval);
            }
        }
    }

    pub fn config_snapshot(&self) -> SchedulerConfig {
        match self.config.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether a cycle is executing right now.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether the periodic timer is armed.
    pub fn is_scheduled(&self) -> bool {
        self.timer.is_running()
    }

    fn arm_timer(self: &Arc<Self>, interval: Duration) {
        let scheduler = Arc::clone(self);
        // The repeating task's first tick fires immediately, giving the
        // run-now-then-repeat contract.
        self.timer.start(interval, move || {
            let scheduler = Arc::clone(&scheduler);
            async move {
                scheduler.run_scheduled_tests().await;
            }
        });
    }

    fn store_results(&self, summary: TestRunSummary) {
        let mut last = match self.last_results.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *last = Some(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ms;

    fn result(name: &str, status: TestStatus) -> TestResult {
        TestResult {
            test_name: name.to_string(),
            status,
            duration: 10,
            error: None,
            screenshot: None,
            timestamp: now_ms(),
            browser: "chromium".to_string(),
        }
    }

    #[test]
    fn test_summary_invariant() {
        let summary = TestRunSummary::from_results(
            vec![
                result("a", TestStatus::Passed),
                result("b", TestStatus::Failed),
                result("c", TestStatus::Skipped),
                result("d", TestStatus::Timeout),
            ],
            Duration::from_millis(500),
        );
        assert_eq!(summary.total_tests, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            summary.passed + summary.failed + summary.skipped,
            summary.total_tests
        );
    }

    #[test]
    fn test_pass_rate() {
        let summary = TestRunSummary::from_results(
            vec![
                result("a", TestStatus::Passed),
                result("b", TestStatus::Passed),
                result("c", TestStatus::Failed),
                result("d", TestStatus::Passed),
            ],
            Duration::from_millis(1),
        );
        assert_eq!(summary.pass_rate(), 75.0);
    }

    #[test]
    fn test_empty_summary_pass_rate_is_full() {
        let summary = TestRunSummary::from_results(Vec::new(), Duration::from_millis(1));
        assert_eq!(summary.pass_rate(), 100.0);
    }

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.auto_run_interval, Duration::from_secs(1800));
        assert!(!config.browsers.is_empty());
        assert_eq!(config.critical_path_tests.len(), 2);
    }
}
