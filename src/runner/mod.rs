//! Browser test runner: drives real browser engines through a fixed battery
//! of synthetic checks against a target URL.
//!
//! ## Design
//! - The scheduler depends only on the [`SuiteRunner`] capability; the
//!   concrete engine transport (W3C WebDriver over HTTP, `client.rs`) is an
//!   external collaborator and swappable
//! - Sessions are launched lazily and cached per engine name; a launch
//!   failure produces ONE synthetic failed result and skips that engine's
//!   remaining files
//! - Each test file runs in its own top-level browsing context; each check is
//!   independently caught so an exception never aborts sibling checks
//! - Page errors observed in the browser are logged, not fatal

pub mod client;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::now_ms;
use client::{WebDriverClient, WebDriverError};

/// Poll interval for readiness and element waits.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Result model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Timeout,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
            TestStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one check in one browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_name: String,
    pub status: TestStatus,
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Base64 PNG captured on failure, when the driver could provide one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub timestamp: u64,
    pub browser: String,
}

/// One suite invocation: a browser, its files, and the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteConfig {
    pub browser: String,
    pub test_files: Vec<String>,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// Accepted for config parity; files always run sequentially so result
    /// ordering stays deterministic per run.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

/// Capability the scheduler drives; concrete runners are swappable.
pub trait SuiteRunner: Send + Sync {
    fn run_suite(&self, suite: SuiteConfig) -> BoxFuture<'_, Vec<TestResult>>;
    fn cleanup(&self) -> BoxFuture<'_, ()>;
}

// ---------------------------------------------------------------------------
// Browser runner
// ---------------------------------------------------------------------------

/// Selectors and budgets for the check battery.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Engine name → WebDriver endpoint.
    pub driver_endpoints: HashMap<String, String>,
    pub nav_selector: String,
    pub main_selector: String,
    /// The designated interactive element; absent → the check is skipped.
    pub feature_selector: String,
    pub page_load_timeout_ms: u64,
    pub element_wait_ms: u64,
    pub perf_budget_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut driver_endpoints = HashMap::new();
        driver_endpoints.insert("chromium".to_string(), "http://127.0.0.1:9515".to_string());
        driver_endpoints.insert("firefox".to_string(), "http://127.0.0.1:4444".to_string());
        RunnerConfig {
            driver_endpoints,
            nav_selector: "nav, [role='navigation']".to_string(),
            main_selector: "main, [role='main'], #main-content".to_string(),
            feature_selector: "canvas, #game-container".to_string(),
            page_load_timeout_ms: 30_000,
            element_wait_ms: 5_000,
            perf_budget_ms: 5_000,
        }
    }
}

struct CachedSession {
    client: WebDriverClient,
    session_id: String,
}

/// How one check concluded; converted into a [`TestResult`] with timing.
enum CheckOutcome {
    Passed,
    Failed(String),
    Skipped(String),
    TimedOut(String),
}

impl From<WebDriverError> for CheckOutcome {
    fn from(e: WebDriverError) -> Self {
        CheckOutcome::Failed(e.to_string())
    }
}

pub struct BrowserRunner {
    config: RunnerConfig,
    sessions: Mutex<HashMap<String, CachedSession>>,
}

impl BrowserRunner {
    pub fn new(config: RunnerConfig) -> Arc<Self> {
        Arc::new(BrowserRunner {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    async fn run_suite_inner(&self, suite: SuiteConfig) -> Vec<TestResult> {
        let started = Instant::now();
        let (client, session_id) = match self.session_for(&suite.browser).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(browser = %suite.browser, error = %e, "browser launch failed");
                return vec![TestResult {
                    test_name: format!("{}::initialization", suite.browser),
                    status: TestStatus::Failed,
                    duration: started.elapsed().as_millis() as u64,
                    error: Some(format!("browser initialization failed: {e}")),
                    screenshot: None,
                    timestamp: now_ms(),
                    browser: suite.browser.clone(),
                }];
            }
        };

        let mut results = Vec::new();
        for file in &suite.test_files {
            results.extend(self.run_file(&client, &session_id, &suite, file).await);
        }
        results
    }

    /// Run the full battery for one test file in a fresh window.
    async fn run_file(
        &self,
        client: &WebDriverClient,
        session_id: &str,
        suite: &SuiteConfig,
        file: &str,
    ) -> Vec<TestResult> {
        let window = match client.new_window(session_id).await {
            Ok(handle) => {
                if let Err(e) = client.switch_window(session_id, &handle).await {
                    tracing::warn!(file, error = %e, "window switch failed");
                }
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(file, error = %e, "isolated window unavailable, reusing current");
                None
            }
        };

        let mut results = Vec::new();

        let load = self.timed_check(client, session_id, suite, file, "page-load").await;
        // The page is navigated now; observe late errors for the rest of the
        // battery.
        self.install_error_observer(client, session_id).await;
        results.push(load);

        for check in ["basic-elements", "feature-presence", "performance"] {
            results.push(self.timed_check(client, session_id, suite, file, check).await);
        }

        self.drain_observed_errors(client, session_id, file).await;

        if window.is_some() {
            match client.close_window(session_id).await {
                Ok(remaining) => {
                    if let Some(handle) = remaining.first() {
                        if let Err(e) = client.switch_window(session_id, handle).await {
                            tracing::warn!(file, error = %e, "switch back failed");
                        }
                    }
                }
                Err(e) => tracing::warn!(file, error = %e, "window close failed"),
            }
        }

        results
    }

    async fn timed_check(
        &self,
        client: &WebDriverClient,
        session_id: &str,
        suite: &SuiteConfig,
        file: &str,
        check: &str,
    ) -> TestResult {
        let started = Instant::now();
        let outcome = match check {
            "page-load" => self
                .check_page_load(client, session_id, suite)
                .await
                .unwrap_or_else(CheckOutcome::from),
            "basic-elements" => self
                .check_basic_elements(client, session_id)
                .await
                .unwrap_or_else(CheckOutcome::from),
            "feature-presence" => self
                .check_feature_presence(client, session_id)
                .await
                .unwrap_or_else(CheckOutcome::from),
            _ => self
                .check_performance(client, session_id)
                .await
                .unwrap_or_else(CheckOutcome::from),
        };
        let duration = started.elapsed().as_millis() as u64;

        let (status, error) = match outcome {
            CheckOutcome::Passed => (TestStatus::Passed, None),
            CheckOutcome::Failed(msg) => (TestStatus::Failed, Some(msg)),
            CheckOutcome::Skipped(msg) => (TestStatus::Skipped, Some(msg)),
            CheckOutcome::TimedOut(msg) => (TestStatus::Timeout, Some(msg)),
        };

        let screenshot = if matches!(status, TestStatus::Failed | TestStatus::Timeout) {
            self.capture_screenshot(client, session_id).await
        } else {
            None
        };

        TestResult {
            test_name: format!("{file}::{check}"),
            status,
            duration,
            error,
            screenshot,
            timestamp: now_ms(),
            browser: suite.browser.clone(),
        }
    }

    /// Check 1: navigate, wait for readiness, inspect the title.
    async fn check_page_load(
        &self,
        client: &WebDriverClient,
        session_id: &str,
        suite: &SuiteConfig,
    ) -> Result<CheckOutcome, WebDriverError> {
        let timeout_ms = suite.timeout.unwrap_or(self.config.page_load_timeout_ms);
        client.set_page_load_timeout(session_id, timeout_ms).await?;
        client.navigate(session_id, &suite.base_url).await?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let state = client
                .execute(session_id, "return document.readyState;", json!([]))
                .await?;
            if state.as_str() == Some("complete") {
                break;
            }
            if Instant::now() >= deadline {
                return Ok(CheckOutcome::TimedOut(format!(
                    "page did not reach readyState=complete within {timeout_ms}ms"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let title = client.title(session_id).await?;
        if title.is_empty() {
            Ok(CheckOutcome::Failed("page title is empty".to_string()))
        } else if title.to_lowercase().contains("error") {
            Ok(CheckOutcome::Failed(format!(
                "page title indicates an error: '{title}'"
            )))
        } else {
            Ok(CheckOutcome::Passed)
        }
    }

    /// Check 2: navigation and main-content landmarks must appear.
    async fn check_basic_elements(
        &self,
        client: &WebDriverClient,
        session_id: &str,
    ) -> Result<CheckOutcome, WebDriverError> {
        let wait = self.config.element_wait_ms;
        if self
            .wait_for_element(client, session_id, &self.config.nav_selector, wait)
            .await?
            .is_none()
        {
            return Ok(CheckOutcome::Failed(format!(
                "navigation landmark '{}' not found within {wait}ms",
                self.config.nav_selector
            )));
        }
        if self
            .wait_for_element(client, session_id, &self.config.main_selector, wait)
            .await?
            .is_none()
        {
            return Ok(CheckOutcome::Failed(format!(
                "main content landmark '{}' not found within {wait}ms",
                self.config.main_selector
            )));
        }
        Ok(CheckOutcome::Passed)
    }

    /// Check 3: the designated interactive element. Absent → skipped.
    async fn check_feature_presence(
        &self,
        client: &WebDriverClient,
        session_id: &str,
    ) -> Result<CheckOutcome, WebDriverError> {
        let selector = &self.config.feature_selector;
        match client.find_element(session_id, selector).await? {
            None => Ok(CheckOutcome::Skipped(format!(
                "feature element '{selector}' not present on this page"
            ))),
            Some(element_id) => {
                if client.is_displayed(session_id, &element_id).await? {
                    Ok(CheckOutcome::Passed)
                } else {
                    Ok(CheckOutcome::Failed(format!(
                        "feature element '{selector}' is present but not visible"
                    )))
                }
            }
        }
    }

    /// Check 4: navigation timing and first-contentful-paint budget.
    async fn check_performance(
        &self,
        client: &WebDriverClient,
        session_id: &str,
    ) -> Result<CheckOutcome, WebDriverError> {
        let script = "const nav = performance.getEntriesByType('navigation')[0]; \
             const paint = performance.getEntriesByType('paint')\
                 .find(e => e.name === 'first-contentful-paint'); \
             return { loadTime: nav ? nav.loadEventEnd : 0, \
                      firstContentfulPaint: paint ? paint.startTime : 0 };";
        let timing = client.execute(session_id, script, json!([])).await?;
        let load_time = timing
            .get("loadTime")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let fcp = timing
            .get("firstContentfulPaint")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        let budget = self.config.perf_budget_ms as f64;
        if load_time > budget {
            Ok(CheckOutcome::Failed(format!(
                "page load {load_time:.0}ms exceeds {budget:.0}ms budget (FCP {fcp:.0}ms)"
            )))
        } else {
            Ok(CheckOutcome::Passed)
        }
    }

    async fn wait_for_element(
        &self,
        client: &WebDriverClient,
        session_id: &str,
        css: &str,
        wait_ms: u64,
    ) -> Result<Option<String>, WebDriverError> {
        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        loop {
            if let Some(id) = client.find_element(session_id, css).await? {
                return Ok(Some(id));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn install_error_observer(&self, client: &WebDriverClient, session_id: &str) {
        let script = "window.__swObservedErrors = []; \
             window.addEventListener('error', \
                 e => window.__swObservedErrors.push('page error: ' + e.message)); \
             window.addEventListener('unhandledrejection', \
                 e => window.__swObservedErrors.push('unhandled rejection: ' + String(e.reason))); \
             const orig = console.error; \
             console.error = function() { \
                 window.__swObservedErrors.push('console error: ' + \
                     Array.from(arguments).map(String).join(' ')); \
                 orig.apply(console, arguments); \
             };";
        if let Err(e) = client.execute(session_id, script, json!([])).await {
            tracing::debug!(error = %e, "error observer install failed");
        }
    }

    async fn drain_observed_errors(&self, client: &WebDriverClient, session_id: &str, file: &str) {
        let script = "return window.__swObservedErrors || [];";
        match client.execute(session_id, script, json!([])).await {
            Ok(observed) => {
                if let Some(messages) = observed.as_array() {
                    for message in messages.iter().filter_map(|m| m.as_str()) {
                        tracing::warn!(file, message, "browser-side error observed");
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "error observer drain failed"),
        }
    }

    async fn capture_screenshot(
        &self,
        client: &WebDriverClient,
        session_id: &str,
    ) -> Option<String> {
        match client.screenshot(session_id).await {
            Ok(png_base64) => Some(png_base64),
            Err(e) => {
                tracing::debug!(error = %e, "screenshot capture failed");
                None
            }
        }
    }

    async fn session_for(
        &self,
        browser: &str,
    ) -> Result<(WebDriverClient, String), WebDriverError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(cached) = sessions.get(browser) {
            return Ok((cached.client.clone(), cached.session_id.clone()));
        }

        let endpoint = self
            .config
            .driver_endpoints
            .get(browser)
            .cloned()
            .ok_or_else(|| WebDriverError::Protocol {
                code: "unknown browser".to_string(),
                detail: format!("no driver endpoint configured for '{browser}'"),
            })?;
        let client = WebDriverClient::new(endpoint)?;
        let session_id = client.new_session(capability_name(browser)).await?;
        tracing::info!(browser, session_id, "browser session launched");
        sessions.insert(
            browser.to_string(),
            CachedSession {
                client: client.clone(),
                session_id: session_id.clone(),
            },
        );
        Ok((client, session_id))
    }

    async fn cleanup_inner(&self) {
        let mut sessions = self.sessions.lock().await;
        for (browser, cached) in sessions.drain() {
            match cached.client.delete_session(&cached.session_id).await {
                Ok(()) => tracing::info!(browser, "browser session closed"),
                Err(e) => tracing::warn!(browser, error = %e, "browser session close failed"),
            }
        }
    }
}

impl SuiteRunner for BrowserRunner {
    fn run_suite(&self, suite: SuiteConfig) -> BoxFuture<'_, Vec<TestResult>> {
        Box::pin(self.run_suite_inner(suite))
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.cleanup_inner())
    }
}

/// WebDriver `browserName` capability for a configured engine name.
fn capability_name(browser: &str) -> &str {
    match browser {
        "chromium" | "chrome" => "chrome",
        other => other,
    }
}
