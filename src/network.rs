//! Network telemetry: per-request log, issue flagging, endpoint statistics.
//!
//! ## Design
//! - Requests land in a 1000-entry FIFO log (oldest evicted first); an
//!   explicit age sweep enforces the retention window on demand and from a
//!   low-frequency repeating task
//! - Issue analysis flags slow, erroring, and oversized responses and emits
//!   ONE system alert per flagged request, `critical` for 5xx statuses
//! - Statistics are computed over the last 60 minutes; the raw views
//!   (`failed_requests`, `slow_requests`) cover the whole buffer

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::hub::{PubSub, Scope};
use crate::store::BoundedLog;
use crate::task::RepeatingTask;
use crate::{emit_alert, now_ms, AlertLevel, EVENT_NETWORK_UPDATE, METRICS_ROOM};

/// Maximum requests retained in memory.
const MAX_REQUESTS: usize = 1000;

/// Responses larger than this are flagged as oversized.
const LARGE_RESPONSE_BYTES: u64 = 1024 * 1024;

/// Default ceiling before a request is considered slow.
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 2000;

/// Window for `statistics()`.
const STATS_WINDOW_MS: u64 = 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Request model
// ---------------------------------------------------------------------------

/// One observed request from the monitored application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestRecord {
    pub id: String,
    pub url: String,
    pub method: String,
    pub status: u16,
    pub duration: u64,
    pub timestamp: u64,
    pub request_size: u64,
    pub response_size: u64,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Raw client report; every field but the URL may be absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReport {
    #[serde(default)]
    pub url: String,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub duration: Option<u64>,
    pub timestamp: Option<u64>,
    pub request_size: Option<u64>,
    pub response_size: Option<u64>,
    pub user_agent: Option<String>,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Aggregate views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatistics {
    pub total_requests: usize,
    pub failed_requests: usize,
    pub average_response_time: f64,
    /// Top 10 by duration, descending.
    pub slowest_requests: Vec<NetworkRequestRecord>,
    pub errors_by_status: HashMap<u16, u64>,
    pub requests_by_endpoint: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointStats {
    pub endpoint: String,
    pub request_count: usize,
    pub average_duration: f64,
    /// Percentage of requests with status >= 400, two decimal places.
    pub error_rate: f64,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct NetworkMonitor {
    log: Mutex<BoundedLog<NetworkRequestRecord>>,
    slow_threshold_ms: AtomicU64,
    retention_ms: AtomicU64,
    seq: AtomicU64,
    pubsub: Arc<dyn PubSub>,
    sweeper: RepeatingTask,
}

impl NetworkMonitor {
    pub fn new(pubsub: Arc<dyn PubSub>, retention_days: u64) -> Self {
        NetworkMonitor {
            log: Mutex::new(BoundedLog::new(MAX_REQUESTS)),
            slow_threshold_ms: AtomicU64::new(DEFAULT_SLOW_THRESHOLD_MS),
            retention_ms: AtomicU64::new(retention_days * 24 * 60 * 60 * 1000),
            seq: AtomicU64::new(1),
            pubsub,
            sweeper: RepeatingTask::new("network-retention-sweep"),
        }
    }

    /// Ingest one request report: fill defaults, store, flag issues, fan out.
    pub fn record_request(&self, report: RequestReport) -> NetworkRequestRecord {
        let record = self.build_record(report);
        {
            let mut log = match self.log.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            log.push(record.clone());
        }

        let issues = self.request_issues(&record);
        if !issues.is_empty() {
            let level = if record.status >= 500 {
                AlertLevel::Critical
            } else {
                AlertLevel::Warning
            };
            emit_alert(
                self.pubsub.as_ref(),
                level,
                "network-monitor",
                format!("Network issue on {}: {}", record.url, issues.join(", ")),
            );
        }

        match serde_json::to_value(&record) {
            Ok(payload) => {
                self.pubsub
                    .publish(Scope::Room(METRICS_ROOM), EVENT_NETWORK_UPDATE, payload);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize request record"),
        }
        record
    }

    fn build_record(&self, report: RequestReport) -> NetworkRequestRecord {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        NetworkRequestRecord {
            id: format!("{seq:06}-{}", &suffix[..8]),
            url: report.url,
            method: report.method.unwrap_or_else(|| "GET".to_string()),
            status: report.status.unwrap_or(0),
            duration: report.duration.unwrap_or(0),
            timestamp: report.timestamp.unwrap_or_else(now_ms),
            request_size: report.request_size.unwrap_or(0),
            response_size: report.response_size.unwrap_or(0),
            user_agent: report.user_agent.unwrap_or_else(|| "unknown".to_string()),
            error: report.error,
        }
    }

    /// Flags for one request, in evaluation order.
    pub fn request_issues(&self, record: &NetworkRequestRecord) -> Vec<String> {
        let mut issues = Vec::new();
        let slow = self.slow_threshold_ms.load(Ordering::Relaxed);
        if record.duration > slow {
            issues.push(format!("slow response ({}ms > {}ms)", record.duration, slow));
        }
        if record.status >= 400 {
            issues.push(format!("HTTP {}", record.status));
        }
        if record.response_size > LARGE_RESPONSE_BYTES {
            issues.push(format!("large payload ({} bytes)", record.response_size));
        }
        issues
    }

    /// Statistics over the last 60 minutes of traffic.
    pub fn statistics(&self) -> NetworkStatistics {
        let cutoff = now_ms().saturating_sub(STATS_WINDOW_MS);
        let windowed: Vec<NetworkRequestRecord> = {
            let log = match self.log.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            log.iter().filter(|r| r.timestamp >= cutoff).cloned().collect()
        };

        let failed = windowed.iter().filter(|r| r.status >= 400).count();
        let average_response_time = if windowed.is_empty() {
            0.0
        } else {
            let total: u64 = windowed.iter().map(|r| r.duration).sum();
            (total as f64 / windowed.len() as f64).round()
        };

        let mut errors_by_status: HashMap<u16, u64> = HashMap::new();
        let mut requests_by_endpoint: HashMap<String, u64> = HashMap::new();
        for record in &windowed {
            if record.status >= 400 {
                *errors_by_status.entry(record.status).or_insert(0) += 1;
            }
            *requests_by_endpoint
                .entry(endpoint_path(&record.url))
                .or_insert(0) += 1;
        }

        let mut slowest = windowed.clone();
        slowest.sort_by(|a, b| b.duration.cmp(&a.duration));
        slowest.truncate(10);

        NetworkStatistics {
            total_requests: windowed.len(),
            failed_requests: failed,
            average_response_time,
            slowest_requests: slowest,
            errors_by_status,
            requests_by_endpoint,
        }
    }

    /// Requests with status >= 400 over the whole buffer, newest first.
    pub fn failed_requests(&self, limit: usize) -> Vec<NetworkRequestRecord> {
        let mut failed: Vec<NetworkRequestRecord> = match self.log.lock() {
            Ok(g) => g.iter().filter(|r| r.status >= 400).cloned().collect(),
            Err(_) => return Vec::new(),
        };
        failed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        failed.truncate(limit);
        failed
    }

    /// Requests over the slow threshold, whole buffer, slowest first.
    pub fn slow_requests(&self, limit: usize) -> Vec<NetworkRequestRecord> {
        let slow_ms = self.slow_threshold_ms.load(Ordering::Relaxed);
        let mut slow: Vec<NetworkRequestRecord> = match self.log.lock() {
            Ok(g) => g.iter().filter(|r| r.duration > slow_ms).cloned().collect(),
            Err(_) => return Vec::new(),
        };
        slow.sort_by(|a, b| b.duration.cmp(&a.duration));
        slow.truncate(limit);
        slow
    }

    /// Per-endpoint aggregates over the whole buffer, busiest first.
    pub fn analyze_endpoint_performance(&self) -> Vec<EndpointStats> {
        let grouped: HashMap<String, Vec<(u64, bool)>> = {
            let log = match self.log.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut grouped: HashMap<String, Vec<(u64, bool)>> = HashMap::new();
            for record in log.iter() {
                grouped
                    .entry(endpoint_path(&record.url))
                    .or_default()
                    .push((record.duration, record.status >= 400));
            }
            grouped
        };

        let mut stats: Vec<EndpointStats> = grouped
            .into_iter()
            .map(|(endpoint, hits)| {
                let count = hits.len();
                let total: u64 = hits.iter().map(|(d, _)| d).sum();
                let errors = hits.iter().filter(|(_, failed)| *failed).count();
                EndpointStats {
                    endpoint,
                    request_count: count,
                    average_duration: (total as f64 / count as f64).round(),
                    error_rate: ((errors as f64 / count as f64) * 10_000.0).round() / 100.0,
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            b.request_count
                .cmp(&a.request_count)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        stats
    }

    /// Runtime-adjust the slow-request ceiling.
    pub fn update_slow_request_threshold(&self, ms: u64) {
        self.slow_threshold_ms.store(ms, Ordering::Relaxed);
    }

    pub fn slow_request_threshold(&self) -> u64 {
        self.slow_threshold_ms.load(Ordering::Relaxed)
    }

    /// Drop records older than the retention window. Returns removed count.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = now_ms().saturating_sub(self.retention_ms.load(Ordering::Relaxed));
        let mut log = match self.log.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let removed = log.evict_older_than(cutoff, |r| r.timestamp);
        if removed > 0 {
            tracing::info!(removed, "swept expired request records");
        }
        removed
    }

    /// Run the retention sweep periodically until `stop`.
    pub fn start_sweeping(self: &Arc<Self>, period: Duration) {
        let monitor = Arc::clone(self);
        self.sweeper.start(period, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.sweep_expired();
            }
        });
    }

    /// Stop the periodic sweep. Idempotent.
    pub fn stop(&self) {
        self.sweeper.stop();
    }

    /// Most recent records, newest first (API surface).
    pub fn recent_requests(&self, limit: usize) -> Vec<NetworkRequestRecord> {
        match self.log.lock() {
            Ok(g) => g.recent(limit),
            Err(_) => Vec::new(),
        }
    }

    /// Number of buffered records (health reporting).
    pub fn request_count(&self) -> usize {
        self.log.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/// The URL's path component with host and query stripped.
pub fn endpoint_path(url: &str) -> String {
    let without_scheme = match url.find("://") {
        Some(idx) => {
            let rest = &url[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => url,
    };
    let end = without_scheme
        .find(['?', '#'])
        .unwrap_or(without_scheme.len());
    let path = &without_scheme[..end];
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use rstest::rstest;

    fn monitor() -> Arc<NetworkMonitor> {
        Arc::new(NetworkMonitor::new(Arc::new(Hub::new()), 7))
    }

    fn report(url: &str, status: u16, duration: u64) -> RequestReport {
        RequestReport {
            url: url.to_string(),
            status: Some(status),
            duration: Some(duration),
            ..RequestReport::default()
        }
    }

    // -- endpoint_path -------------------------------------------------------

    #[rstest]
    #[case("https://example.com/api/users?id=3", "/api/users")]
    #[case("http://example.com", "/")]
    #[case("/api/games/42", "/api/games/42")]
    #[case("/search?q=rust#results", "/search")]
    #[case("", "/")]
    fn test_endpoint_path(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(endpoint_path(url), expected);
    }

    // -- defaults ------------------------------------------------------------

    #[test]
    fn test_record_request_fills_defaults() {
        let m = monitor();
        let record = m.record_request(RequestReport {
            url: "/api/ping".into(),
            ..RequestReport::default()
        });
        assert_eq!(record.method, "GET");
        assert_eq!(record.status, 0);
        assert_eq!(record.request_size, 0);
        assert_eq!(record.user_agent, "unknown");
        assert!(record.timestamp > 0);
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_request_ids_are_monotonic_ish() {
        let m = monitor();
        let a = m.record_request(report("/a", 200, 10));
        let b = m.record_request(report("/b", 200, 10));
        assert!(a.id < b.id, "{} should sort before {}", a.id, b.id);
    }

    // -- issue analysis ------------------------------------------------------

    #[test]
    fn test_issue_flags() {
        let m = monitor();
        let record = m.record_request(RequestReport {
            url: "/big".into(),
            status: Some(503),
            duration: Some(4000),
            response_size: Some(2 * 1024 * 1024),
            ..RequestReport::default()
        });
        let issues = m.request_issues(&record);
        assert_eq!(issues.len(), 3);
        assert!(issues[0].contains("slow response"));
        assert!(issues[1].contains("HTTP 503"));
        assert!(issues[2].contains("large payload"));
    }

    #[test]
    fn test_clean_request_has_no_issues() {
        let m = monitor();
        let record = m.record_request(report("/ok", 200, 100));
        assert!(m.request_issues(&record).is_empty());
    }

    // -- statistics ----------------------------------------------------------

    #[test]
    fn test_statistics_window() {
        let m = monitor();
        m.record_request(report("/api/a", 200, 100));
        m.record_request(report("/api/a", 503, 300));
        m.record_request(report("/api/b", 404, 200));
        let stats = m.statistics();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.average_response_time, 200.0);
        assert_eq!(stats.errors_by_status.get(&503), Some(&1));
        assert_eq!(stats.errors_by_status.get(&404), Some(&1));
        assert_eq!(stats.requests_by_endpoint.get("/api/a"), Some(&2));
    }

    #[test]
    fn test_statistics_excludes_old_traffic() {
        let m = monitor();
        m.record_request(RequestReport {
            url: "/stale".into(),
            status: Some(200),
            timestamp: Some(now_ms() - 2 * STATS_WINDOW_MS),
            ..RequestReport::default()
        });
        m.record_request(report("/fresh", 200, 50));
        let stats = m.statistics();
        assert_eq!(stats.total_requests, 1);
        assert!(stats.requests_by_endpoint.contains_key("/fresh"));
    }

    #[test]
    fn test_slowest_requests_top_ten() {
        let m = monitor();
        for i in 0..15u64 {
            m.record_request(report("/x", 200, i * 100));
        }
        let stats = m.statistics();
        assert_eq!(stats.slowest_requests.len(), 10);
        assert_eq!(stats.slowest_requests[0].duration, 1400);
    }

    // -- views ---------------------------------------------------------------

    #[test]
    fn test_failed_and_slow_views() {
        let m = monitor();
        m.record_request(report("/ok", 200, 100));
        m.record_request(report("/err", 500, 100));
        m.record_request(report("/slow", 200, 5000));
        assert_eq!(m.failed_requests(10).len(), 1);
        assert_eq!(m.slow_requests(10).len(), 1);
        assert_eq!(m.slow_requests(10)[0].url, "/slow");
    }

    #[test]
    fn test_slow_threshold_runtime_mutable() {
        let m = monitor();
        m.record_request(report("/medium", 200, 1000));
        assert!(m.slow_requests(10).is_empty());
        m.update_slow_request_threshold(500);
        assert_eq!(m.slow_requests(10).len(), 1);
    }

    // -- endpoint analysis ---------------------------------------------------

    #[test]
    fn test_endpoint_performance() {
        let m = monitor();
        m.record_request(report("/api/a", 200, 100));
        m.record_request(report("/api/a", 500, 300));
        m.record_request(report("/api/b", 200, 50));
        let stats = m.analyze_endpoint_performance();
        assert_eq!(stats.len(), 2);
        let a = &stats[0];
        assert_eq!(a.endpoint, "/api/a");
        assert_eq!(a.request_count, 2);
        assert_eq!(a.average_duration, 200.0);
        assert_eq!(a.error_rate, 50.0);
    }

    #[test]
    fn test_error_rate_two_decimals() {
        let m = monitor();
        m.record_request(report("/api/c", 500, 10));
        m.record_request(report("/api/c", 200, 10));
        m.record_request(report("/api/c", 200, 10));
        let stats = m.analyze_endpoint_performance();
        assert_eq!(stats[0].error_rate, 33.33);
    }

    // -- buffer bounds -------------------------------------------------------

    #[test]
    fn test_buffer_fifo_cap() {
        let m = monitor();
        for i in 0..1001u64 {
            m.record_request(report(&format!("/req/{i}"), 200, 10));
        }
        assert_eq!(m.request_count(), 1000);
        let recent = m.recent_requests(1000);
        assert!(recent.iter().all(|r| r.url != "/req/0"));
        assert!(recent.iter().any(|r| r.url == "/req/1000"));
    }

    #[test]
    fn test_sweep_expired() {
        let m = monitor();
        m.record_request(RequestReport {
            url: "/ancient".into(),
            timestamp: Some(1),
            ..RequestReport::default()
        });
        m.record_request(report("/fresh", 200, 10));
        assert_eq!(m.sweep_expired(), 1);
        assert_eq!(m.request_count(), 1);
    }
}
