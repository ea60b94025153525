//! Tests for the performance monitor — ingestion, threshold alerting,
//! windowed averages, and scoring.

use serde_json::json;
use std::sync::Arc;

use sitewatch::hub::Hub;
use sitewatch::performance::{PerformanceMonitor, PerformanceSample, ThresholdUpdate};

fn monitor_with_hub() -> (Arc<Hub>, Arc<PerformanceMonitor>) {
    let hub = Arc::new(Hub::new());
    let monitor = Arc::new(PerformanceMonitor::new(hub.clone()));
    (hub, monitor)
}

fn sample(load_ms: f64) -> PerformanceSample {
    PerformanceSample {
        page_load_time: load_ms,
        url: "/home".to_string(),
        ..PerformanceSample::default()
    }
}

// ---------------------------------------------------------------------------
// Scenario B: 1000/4000/2000 averages to 2333, one warning alert
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scenario_three_samples_average_and_single_alert() {
    let (hub, monitor) = monitor_with_hub();
    let mut sub = hub.subscribe("metrics-room", "dash");

    for ms in [1000.0, 4000.0, 2000.0] {
        monitor.record_metrics(sample(ms));
    }

    let avg = monitor.average_metrics(30).expect("samples in window");
    assert_eq!(avg.page_load_time, 2333.0);

    // Exactly one warning, for the 4000ms sample.
    let alert = sub.all_rx.try_recv().expect("one system alert");
    assert_eq!(alert["event"], "system-alert");
    assert_eq!(alert["payload"]["type"], "warning");
    assert!(alert["payload"]["message"]
        .as_str()
        .unwrap()
        .contains("pageLoadTime"));
    assert!(sub.all_rx.try_recv().is_err(), "no further alerts");
}

#[tokio::test]
async fn test_every_sample_publishes_performance_update() {
    let (hub, monitor) = monitor_with_hub();
    let mut sub = hub.subscribe("metrics-room", "dash");
    monitor.record_metrics(sample(100.0));
    monitor.record_metrics(sample(200.0));
    assert_eq!(sub.room_rx.try_recv().unwrap()["event"], "performance-update");
    assert_eq!(sub.room_rx.try_recv().unwrap()["event"], "performance-update");
}

#[tokio::test]
async fn test_multi_violation_sample_emits_one_bundled_alert() {
    let (hub, monitor) = monitor_with_hub();
    let mut sub = hub.subscribe("metrics-room", "dash");
    monitor.record_metrics(PerformanceSample {
        page_load_time: 9000.0,
        first_contentful_paint: 4000.0,
        largest_contentful_paint: 6000.0,
        ..PerformanceSample::default()
    });
    let alert = sub.all_rx.try_recv().expect("one bundled alert");
    let message = alert["payload"]["message"].as_str().unwrap();
    assert!(message.contains("pageLoadTime"));
    assert!(message.contains("firstContentfulPaint"));
    assert!(message.contains("largestContentfulPaint"));
    assert!(sub.all_rx.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Averages
// ---------------------------------------------------------------------------

#[test]
fn test_empty_window_returns_none() {
    let (_hub, monitor) = monitor_with_hub();
    assert!(monitor.average_metrics(60).is_none());
}

#[test]
fn test_window_excludes_stale_samples() {
    let (_hub, monitor) = monitor_with_hub();
    monitor.record_metrics(PerformanceSample {
        page_load_time: 8000.0,
        timestamp: 1, // far in the past
        ..PerformanceSample::default()
    });
    assert!(monitor.average_metrics(30).is_none());
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[test]
fn test_score_starts_at_hundred() {
    let (_hub, monitor) = monitor_with_hub();
    assert_eq!(monitor.performance_score(&sample(500.0)), 100);
}

#[test]
fn test_score_deducts_per_metric_and_floors_at_zero() {
    let (_hub, monitor) = monitor_with_hub();
    assert_eq!(monitor.performance_score(&sample(4000.0)), 80);

    let worst = PerformanceSample {
        page_load_time: 10_000.0,
        first_contentful_paint: 10_000.0,
        largest_contentful_paint: 10_000.0,
        cumulative_layout_shift: 2.0,
        interaction_to_next_paint: 2000.0,
        ..PerformanceSample::default()
    };
    assert_eq!(monitor.performance_score(&worst), 0);
}

// ---------------------------------------------------------------------------
// Runtime threshold updates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_updated_threshold_changes_alerting() {
    let (hub, monitor) = monitor_with_hub();
    let mut sub = hub.subscribe("metrics-room", "dash");

    monitor.record_metrics(sample(2500.0));
    assert!(sub.all_rx.try_recv().is_err(), "2500ms is under the default");

    monitor.update_thresholds(ThresholdUpdate {
        page_load_time: Some(2000.0),
        ..ThresholdUpdate::default()
    });
    monitor.record_metrics(sample(2500.0));
    assert!(sub.all_rx.try_recv().is_ok(), "2500ms exceeds the new ceiling");
}

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

#[test]
fn test_sample_wire_field_names() {
    let parsed: PerformanceSample = serde_json::from_value(json!({
        "pageLoadTime": 1200.0,
        "firstContentfulPaint": 600.0,
        "largestContentfulPaint": 900.0,
        "cumulativeLayoutShift": 0.05,
        "interactionToNextPaint": 80.0,
        "url": "/shop",
        "userAgent": "test-agent",
    }))
    .expect("camelCase wire names parse");
    assert_eq!(parsed.page_load_time, 1200.0);
    assert_eq!(parsed.url, "/shop");
    assert_eq!(parsed.timestamp, 0, "absent timestamp defaults to stamp-at-ingest");
}
