//! Tests for the test scheduler — single-flight guard, summary invariant,
//! alert analysis, and runtime reconfiguration.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sitewatch::hub::Hub;
use sitewatch::now_ms;
use sitewatch::runner::{SuiteConfig, SuiteRunner, TestResult, TestStatus};
use sitewatch::scheduler::{SchedulerConfig, SchedulerConfigUpdate, TestRunSummary, TestScheduler};

// ---------------------------------------------------------------------------
// Stub runner
// ---------------------------------------------------------------------------

struct StubRunner {
    statuses: Vec<TestStatus>,
    delay: Duration,
    calls: AtomicU32,
    last_suite: Mutex<Option<SuiteConfig>>,
}

impl StubRunner {
    fn new(statuses: Vec<TestStatus>) -> Arc<Self> {
        Arc::new(StubRunner {
            statuses,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            last_suite: Mutex::new(None),
        })
    }

    fn slow(statuses: Vec<TestStatus>, delay: Duration) -> Arc<Self> {
        Arc::new(StubRunner {
            statuses,
            delay,
            calls: AtomicU32::new(0),
            last_suite: Mutex::new(None),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SuiteRunner for StubRunner {
    fn run_suite(&self, suite: SuiteConfig) -> BoxFuture<'_, Vec<TestResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_suite.lock().unwrap() = Some(suite.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.statuses
                .iter()
                .enumerate()
                .map(|(i, status)| TestResult {
                    test_name: format!("{}::check-{i}", suite.test_files.first().cloned().unwrap_or_default()),
                    status: *status,
                    duration: 5,
                    error: None,
                    screenshot: None,
                    timestamp: now_ms(),
                    browser: suite.browser.clone(),
                })
                .collect()
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

fn one_browser_config() -> SchedulerConfig {
    SchedulerConfig {
        browsers: vec!["chromium".to_string()],
        ..SchedulerConfig::default()
    }
}

fn summary_of(statuses: &[TestStatus], names: &[&str]) -> TestRunSummary {
    let results = statuses
        .iter()
        .zip(names)
        .map(|(status, name)| TestResult {
            test_name: name.to_string(),
            status: *status,
            duration: 5,
            error: None,
            screenshot: None,
            timestamp: now_ms(),
            browser: "chromium".to_string(),
        })
        .collect();
    TestRunSummary::from_results(results, Duration::from_millis(50))
}

// ---------------------------------------------------------------------------
// Single-flight guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_overlapping_cycles_are_dropped() {
    let runner = StubRunner::slow(vec![TestStatus::Passed], Duration::from_millis(100));
    let hub = Arc::new(Hub::new());
    let scheduler = TestScheduler::new(one_browser_config(), runner.clone(), hub);

    tokio::join!(
        scheduler.run_scheduled_tests(),
        scheduler.run_scheduled_tests()
    );

    // The second trigger performed no test execution.
    assert_eq!(runner.calls(), 1);
    assert!(scheduler.latest_results().is_some());
}

#[tokio::test]
async fn test_guard_released_after_cycle() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let hub = Arc::new(Hub::new());
    let scheduler = TestScheduler::new(one_browser_config(), runner.clone(), hub);

    scheduler.run_scheduled_tests().await;
    assert!(!scheduler.is_running());
    scheduler.run_scheduled_tests().await;
    assert_eq!(runner.calls(), 2, "sequential cycles both execute");
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_latest_results_none_before_any_cycle() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, Arc::new(Hub::new()));
    assert!(scheduler.latest_results().is_none());
}

#[tokio::test]
async fn test_summary_invariant_holds() {
    let runner = StubRunner::new(vec![
        TestStatus::Passed,
        TestStatus::Failed,
        TestStatus::Skipped,
        TestStatus::Timeout,
    ]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, Arc::new(Hub::new()));
    let summary = scheduler.run_manual(None).await;
    assert_eq!(
        summary.passed + summary.failed + summary.skipped,
        summary.total_tests
    );
    assert_eq!(summary.failed, 2, "timeout counts as a failure");
}

#[tokio::test]
async fn test_browsers_run_sequentially_and_concatenate() {
    let runner = StubRunner::new(vec![TestStatus::Passed, TestStatus::Passed]);
    let config = SchedulerConfig {
        browsers: vec!["chromium".to_string(), "firefox".to_string()],
        ..SchedulerConfig::default()
    };
    let scheduler = TestScheduler::new(config, runner.clone(), Arc::new(Hub::new()));
    let summary = scheduler.run_manual(None).await;
    assert_eq!(runner.calls(), 2, "one suite invocation per browser");
    assert_eq!(summary.total_tests, 4);
}

#[tokio::test]
async fn test_specific_suite_narrows_files() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let scheduler = TestScheduler::new(one_browser_config(), runner.clone(), Arc::new(Hub::new()));
    scheduler.run_manual(Some("smoke.spec")).await;
    let suite = runner.last_suite.lock().unwrap().clone().unwrap();
    assert_eq!(suite.test_files, vec!["smoke.spec".to_string()]);
}

#[tokio::test]
async fn test_critical_path_run_uses_configured_list() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let scheduler = TestScheduler::new(one_browser_config(), runner.clone(), Arc::new(Hub::new()));
    scheduler.run_critical_path_tests().await;
    let suite = runner.last_suite.lock().unwrap().clone().unwrap();
    assert_eq!(
        suite.test_files,
        one_browser_config().critical_path_tests
    );
}

// ---------------------------------------------------------------------------
// Result analysis
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_low_pass_rate_raises_warning() {
    let hub = Arc::new(Hub::new());
    let runner = StubRunner::new(vec![]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, hub.clone());
    let mut sub = hub.subscribe("metrics-room", "dash");

    let summary = summary_of(
        &[TestStatus::Passed, TestStatus::Failed, TestStatus::Failed],
        &["a", "b", "c"],
    );
    scheduler.analyze_results(&summary);

    let alert = sub.all_rx.try_recv().expect("warning for 33% pass rate");
    assert_eq!(alert["payload"]["type"], "warning");
    assert!(alert["payload"]["message"].as_str().unwrap().contains("33.3"));
}

#[tokio::test]
async fn test_healthy_run_raises_no_alert() {
    let hub = Arc::new(Hub::new());
    let runner = StubRunner::new(vec![]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, hub.clone());
    let mut sub = hub.subscribe("metrics-room", "dash");

    let summary = summary_of(
        &[TestStatus::Passed, TestStatus::Passed, TestStatus::Skipped],
        &["a", "b", "c"],
    );
    scheduler.analyze_results(&summary);
    // 2/3 passed is 66%, below 80, so a warning fires; re-check with all passing.
    let _ = sub.all_rx.try_recv();

    let summary = summary_of(
        &[TestStatus::Passed, TestStatus::Passed, TestStatus::Passed,
          TestStatus::Passed, TestStatus::Passed],
        &["a", "b", "c", "d", "e"],
    );
    scheduler.analyze_results(&summary);
    assert!(sub.all_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_failing_critical_test_raises_critical_alert() {
    let hub = Arc::new(Hub::new());
    let runner = StubRunner::new(vec![]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, hub.clone());
    let mut sub = hub.subscribe("metrics-room", "dash");

    let summary = summary_of(
        &[
            TestStatus::Passed,
            TestStatus::Passed,
            TestStatus::Passed,
            TestStatus::Passed,
            TestStatus::Failed,
        ],
        &["a", "b", "c", "d", "critical-checkout::page-load"],
    );
    scheduler.analyze_results(&summary);

    let alert = sub.all_rx.try_recv().expect("critical-name alert");
    assert_eq!(alert["payload"]["type"], "critical");
    assert!(alert["payload"]["message"]
        .as_str()
        .unwrap()
        .contains("critical-checkout::page-load"));
}

// ---------------------------------------------------------------------------
// Reconfiguration and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_update_config_applies_partial_changes() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, Arc::new(Hub::new()));
    scheduler.update_config(SchedulerConfigUpdate {
        auto_run_interval_ms: Some(60_000),
        browsers: Some(vec!["firefox".to_string()]),
        ..SchedulerConfigUpdate::default()
    });
    let config = scheduler.config_snapshot();
    assert_eq!(config.auto_run_interval, Duration::from_millis(60_000));
    assert_eq!(config.browsers, vec!["firefox".to_string()]);
    assert_eq!(config.base_url, SchedulerConfig::default().base_url);
}

#[tokio::test]
async fn test_stop_is_safe_without_start() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let scheduler = TestScheduler::new(one_browser_config(), runner, Arc::new(Hub::new()));
    scheduler.stop();
    scheduler.stop();
    assert!(!scheduler.is_scheduled());
}

#[tokio::test]
async fn test_start_arms_timer_and_runs_immediately() {
    let runner = StubRunner::new(vec![TestStatus::Passed]);
    let config = SchedulerConfig {
        auto_run_interval: Duration::from_secs(3600),
        browsers: vec!["chromium".to_string()],
        ..SchedulerConfig::default()
    };
    let scheduler = TestScheduler::new(config, runner.clone(), Arc::new(Hub::new()));
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.is_scheduled());
    assert_eq!(runner.calls(), 1, "one immediate cycle, none queued");
    assert!(scheduler.latest_results().is_some());
    scheduler.stop();
    assert!(!scheduler.is_scheduled());
}
