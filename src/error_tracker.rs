//! Error aggregation: dedup, classification, statistics, trends.
//!
//! ## Design
//! - One record per dedup key (content hash of message + origin URL); repeat
//!   reports bump `occurrences`, advance `lastSeen`, and grow `affectedUsers`
//! - Severity and kind classification are pure functions over ordered
//!   first-match-wins rule tables
//! - Records live in an in-process map owned exclusively by this tracker;
//!   a sweep removes resolved records idle for more than the retention window
//! - Every report fans the new-or-updated record out to `errors-room`;
//!   critical severities additionally raise a broadcast system alert

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::hub::{PubSub, Scope};
use crate::{emit_alert, now_ms, AlertLevel, ERRORS_ROOM, EVENT_ERROR_OCCURRED};

/// Hex length of the dedup key derived from the content hash.
const DEDUP_KEY_LEN: usize = 12;

/// Resolved records idle longer than this are eligible for the sweep.
const RESOLVED_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

// ---------------------------------------------------------------------------
// Record model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Javascript,
    Network,
    Render,
    Memory,
    Permission,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Javascript => "javascript",
            ErrorKind::Network => "network",
            ErrorKind::Render => "render",
            ErrorKind::Memory => "memory",
            ErrorKind::Permission => "permission",
        };
        write!(f, "{s}")
    }
}

/// One deduplicated error, merged across repeat reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    pub message: String,
    pub stack: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_stack: Option<String>,
    pub url: String,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub resolved: bool,
    pub occurrences: u64,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Client identifiers that reported this error; set semantics, insertion
    /// order kept.
    pub affected_users: Vec<String>,
}

/// A raw report normalized into the fields the tracker stores.
#[derive(Debug, Clone)]
struct NormalizedReport {
    message: String,
    stack: String,
    component_stack: Option<String>,
    url: String,
    timestamp: u64,
    user_agent: String,
}

// ---------------------------------------------------------------------------
// Classification tables (pure, ordered, first match wins)
// ---------------------------------------------------------------------------

const SEVERITY_RULES: &[(&[&str], Severity)] = &[
    (&["uncaught", "fatal", "security", "auth"], Severity::Critical),
    (&["network", "api", "database", "payment"], Severity::High),
    (&["component", "render", "state"], Severity::Medium),
];

static KIND_RULES: Lazy<Vec<(ErrorKind, Regex)>> = Lazy::new(|| {
    [
        (ErrorKind::Network, r"fetch|xmlhttprequest|network|cors|timeout"),
        (ErrorKind::Memory, r"out of memory|heap|memory|leak"),
        (ErrorKind::Permission, r"permission|denied|unauthorized|forbidden"),
        (ErrorKind::Render, r"render|component|mount|unmount|lifecycle"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("static kind pattern")))
    .collect()
});

/// Severity from keyword-substring rules over the lower-cased message.
pub fn classify_severity(message: &str) -> Severity {
    let msg = message.to_lowercase();
    for (needles, severity) in SEVERITY_RULES {
        if needles.iter().any(|needle| msg.contains(needle)) {
            return *severity;
        }
    }
    Severity::Low
}

/// Error kind from the first matching pattern over lower-cased message+stack.
pub fn classify_kind(message: &str, stack: &str) -> ErrorKind {
    let haystack = format!("{message} {stack}").to_lowercase();
    for (kind, pattern) in KIND_RULES.iter() {
        if pattern.is_match(&haystack) {
            return *kind;
        }
    }
    ErrorKind::Javascript
}

/// Deterministic short id for a `(message, url)` pair.
pub fn dedup_key(message: &str, url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{message}-{url}").as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(DEDUP_KEY_LEN);
    hex
}

// ---------------------------------------------------------------------------
// Aggregate views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    pub total_errors: usize,
    pub critical_errors: usize,
    pub resolved_errors: usize,
    /// Top 10 records by occurrence count, descending.
    pub top_errors: Vec<ErrorRecord>,
    pub errors_by_type: HashMap<String, u64>,
    pub errors_by_page: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTrends {
    pub errors_last_24h: usize,
    pub errors_last_7d: usize,
    /// message → records last seen inside the 24 h window.
    pub messages_24h: HashMap<String, u64>,
    /// epoch day → records last seen on that day, over the 7 d window.
    pub daily_7d: BTreeMap<u64, u64>,
    /// Top 10 pages by error-record count over the 7 d window.
    pub top_pages_7d: Vec<(String, u64)>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct ErrorTracker {
    records: Mutex<HashMap<String, ErrorRecord>>,
    pubsub: Arc<dyn PubSub>,
}

impl ErrorTracker {
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        ErrorTracker {
            records: Mutex::new(HashMap::new()),
            pubsub,
        }
    }

    /// Ingest one raw error report and return the stored record.
    ///
    /// The report may be arbitrarily shaped JSON; missing fields fall back to
    /// neutral defaults rather than rejecting the report.
    pub fn report_error(&self, raw: &serde_json::Value) -> ErrorRecord {
        let report = normalize(raw);
        let id = dedup_key(&report.message, &report.url);
        let now = now_ms();

        let record = {
            let mut records = match self.records.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match records.get_mut(&id) {
                Some(existing) => {
                    existing.occurrences += 1;
                    // Keep firstSeen <= lastSeen even for skewed client clocks.
                    existing.last_seen = now.max(existing.first_seen);
                    if !existing.affected_users.contains(&report.user_agent) {
                        existing.affected_users.push(report.user_agent.clone());
                    }
                    existing.clone()
                }
                None => {
                    let record = ErrorRecord {
                        id: id.clone(),
                        severity: classify_severity(&report.message),
                        kind: classify_kind(&report.message, &report.stack),
                        message: report.message,
                        stack: report.stack,
                        component_stack: report.component_stack,
                        url: report.url,
                        resolved: false,
                        occurrences: 1,
                        first_seen: report.timestamp,
                        last_seen: report.timestamp,
                        affected_users: vec![report.user_agent],
                    };
                    records.insert(id, record.clone());
                    record
                }
            }
        };

        self.publish_record(&record);
        if record.severity == Severity::Critical {
            emit_alert(
                self.pubsub.as_ref(),
                AlertLevel::Critical,
                "error-tracker",
                format!("Critical error on {}: {}", record.url, record.message),
            );
        }
        record
    }

    /// Mark a record resolved. Returns whether the id existed; idempotent.
    pub fn resolve_error(&self, id: &str) -> bool {
        let record = {
            let mut records = match self.records.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match records.get_mut(id) {
                Some(record) => {
                    record.resolved = true;
                    Some(record.clone())
                }
                None => None,
            }
        };
        match record {
            Some(record) => {
                self.publish_record(&record);
                true
            }
            None => false,
        }
    }

    /// Records sorted by `lastSeen` descending, truncated to `limit`.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let mut records: Vec<ErrorRecord> = match self.records.lock() {
            Ok(g) => g.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        records.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        records.truncate(limit);
        records
    }

    /// Aggregate statistics over the full current record set.
    pub fn statistics(&self) -> ErrorStatistics {
        let records: Vec<ErrorRecord> = match self.records.lock() {
            Ok(g) => g.values().cloned().collect(),
            Err(_) => Vec::new(),
        };

        let mut errors_by_type: HashMap<String, u64> = HashMap::new();
        let mut errors_by_page: HashMap<String, u64> = HashMap::new();
        for record in &records {
            *errors_by_type.entry(record.kind.to_string()).or_insert(0) += record.occurrences;
            *errors_by_page.entry(record.url.clone()).or_insert(0) += record.occurrences;
        }

        let mut top_errors = records.clone();
        top_errors.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        top_errors.truncate(10);

        ErrorStatistics {
            total_errors: records.len(),
            critical_errors: records
                .iter()
                .filter(|r| r.severity == Severity::Critical)
                .count(),
            resolved_errors: records.iter().filter(|r| r.resolved).count(),
            top_errors,
            errors_by_type,
            errors_by_page,
        }
    }

    /// Delete resolved records idle longer than the retention window.
    /// Returns how many were removed.
    pub fn clear_resolved(&self) -> usize {
        let cutoff = now_ms().saturating_sub(RESOLVED_RETENTION_MS);
        let mut records = match self.records.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = records.len();
        records.retain(|_, r| !(r.resolved && r.last_seen < cutoff));
        let removed = before - records.len();
        if removed > 0 {
            tracing::info!(removed, "swept resolved error records");
        }
        removed
    }

    /// Partition records into 24 h / 7 d windows by `lastSeen` and summarize.
    pub fn analyze_trends(&self) -> ErrorTrends {
        let now = now_ms();
        let day_ago = now.saturating_sub(DAY_MS);
        let week_ago = now.saturating_sub(7 * DAY_MS);

        let records: Vec<ErrorRecord> = match self.records.lock() {
            Ok(g) => g.values().cloned().collect(),
            Err(_) => Vec::new(),
        };

        let last_24h: Vec<&ErrorRecord> =
            records.iter().filter(|r| r.last_seen >= day_ago).collect();
        let last_7d: Vec<&ErrorRecord> =
            records.iter().filter(|r| r.last_seen >= week_ago).collect();

        let mut messages_24h: HashMap<String, u64> = HashMap::new();
        for record in &last_24h {
            *messages_24h.entry(record.message.clone()).or_insert(0) += 1;
        }

        let mut daily_7d: BTreeMap<u64, u64> = BTreeMap::new();
        let mut pages: HashMap<String, u64> = HashMap::new();
        for record in &last_7d {
            *daily_7d.entry(record.last_seen / DAY_MS).or_insert(0) += 1;
            *pages.entry(record.url.clone()).or_insert(0) += 1;
        }

        let mut top_pages_7d: Vec<(String, u64)> = pages.into_iter().collect();
        top_pages_7d.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_pages_7d.truncate(10);

        ErrorTrends {
            errors_last_24h: last_24h.len(),
            errors_last_7d: last_7d.len(),
            messages_24h,
            daily_7d,
            top_pages_7d,
        }
    }

    /// Number of records currently held (health reporting).
    pub fn record_count(&self) -> usize {
        self.records.lock().map(|g| g.len()).unwrap_or(0)
    }

    fn publish_record(&self, record: &ErrorRecord) {
        match serde_json::to_value(record) {
            Ok(payload) => {
                self.pubsub
                    .publish(Scope::Room(ERRORS_ROOM), EVENT_ERROR_OCCURRED, payload);
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize error record"),
        }
    }
}

fn normalize(raw: &serde_json::Value) -> NormalizedReport {
    let message = raw
        .get("message")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown error")
        .to_string();
    let url = raw
        .get("url")
        .or_else(|| raw.get("filename"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    NormalizedReport {
        message,
        stack: raw
            .get("stack")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        component_stack: raw
            .get("componentStack")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        url,
        timestamp: raw
            .get("timestamp")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(now_ms),
        user_agent: raw
            .get("userAgent")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string(),
    }
}
