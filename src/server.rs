//! HTTP/WebSocket ingress and process lifecycle.
//!
//! ## Design
//! - Hand-rolled HTTP over `TcpListener`: one task per connection, request
//!   head parsed with `httparse`, bodies honored via Content-Length
//! - WebSocket upgrades are detected by peeking the request head; `/ws/{room}`
//!   joins the hub room and fans out room + broadcast events
//! - Any handler failure answers 500 `{"error": ...}`; ingestion failures are
//!   logged and dropped, never crash the process
//! - Shutdown stops accepting, then the caller runs the ordered component
//!   shutdown (scheduler → monitors → browsers → database)

use colored::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::config::ServerConfig;
use crate::db::Database;
use crate::error::{Result, SitewatchError};
use crate::error_tracker::ErrorTracker;
use crate::hub::Hub;
use crate::network::{NetworkMonitor, RequestReport};
use crate::performance::{PerformanceMonitor, PerformanceSample, ThresholdUpdate};
use crate::runner::SuiteRunner;
use crate::scheduler::{SchedulerConfigUpdate, TestScheduler};
use crate::{now_ms, EVENT_AUTONOMOUS_ERROR, EVENT_AUTO_FIX_ATTEMPT};

/// Upper bound on accepted request bodies.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Everything the handlers touch, shared across connections.
pub struct AppState {
    pub hub: Arc<Hub>,
    pub errors: Arc<ErrorTracker>,
    pub performance: Arc<PerformanceMonitor>,
    pub network: Arc<NetworkMonitor>,
    pub scheduler: Arc<TestScheduler>,
    pub runner: Arc<dyn SuiteRunner>,
    pub db: Arc<Database>,
    pub config: ServerConfig,
    pub started: Instant,
}

/// Accept connections until the shutdown signal flips.
pub async fn serve(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| SitewatchError::Bind {
            port: state.config.port,
            detail: e.to_string(),
        })?;

    eprintln!(
        "{}",
        format!("  sitewatch listening on http://localhost:{}", state.config.port).bright_green()
    );
    eprintln!(
        "{}",
        format!("  monitoring target: {}", state.config.target_base_url).bright_blue()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        tracing::debug!(error = %e, "connection error");
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("shutdown signal received, no longer accepting");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<AppState>,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the first bytes to detect WebSocket upgrade requests.
    let mut peek_buf = [0u8; 1024];
    let peek_n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    let peek_str = String::from_utf8_lossy(&peek_buf[..peek_n]);

    if peek_str.contains("Upgrade: websocket") || peek_str.contains("upgrade: websocket") {
        let first_line = peek_str.lines().next().unwrap_or("").to_string();
        let ws_path = first_line.split_whitespace().nth(1).unwrap_or("/").to_string();
        if let Some(room) = ws_path.strip_prefix("/ws/") {
            let room = room.to_string();
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws_stream) => handle_ws(ws_stream, Arc::clone(&state.hub), room).await,
                Err(e) => tracing::warn!(error = %e, "websocket handshake failed"),
            }
        }
        return Ok(());
    }

    let Some(request) = read_request(&mut stream).await? else {
        return Ok(());
    };

    if request.method == "OPTIONS" {
        let cors = cors_value(&state.config, request.origin.as_deref());
        let response = preflight_response(cors.as_deref());
        stream.write_all(response.as_bytes()).await?;
        return Ok(());
    }

    let (status, body) = dispatch(&state, &request).await;
    let cors = cors_value(&state.config, request.origin.as_deref());
    let response = json_response(status, &body, cors.as_deref());
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Request parsing
// ---------------------------------------------------------------------------

struct Request {
    method: String,
    path: String,
    query: HashMap<String, String>,
    origin: Option<String>,
    body: Vec<u8>,
}

async fn read_request(
    stream: &mut TcpStream,
) -> std::result::Result<Option<Request>, Box<dyn std::error::Error + Send + Sync>> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Ok(None);
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Request::new(&mut headers);
    if parsed.parse(&buf[..header_end])?.is_partial() {
        return Ok(None);
    }

    let method = parsed.method.unwrap_or("GET").to_string();
    let path_and_query = parsed.path.unwrap_or("/").to_string();

    let mut content_length = 0usize;
    let mut origin = None;
    for header in parsed.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            content_length = String::from_utf8_lossy(header.value)
                .trim()
                .parse()
                .unwrap_or(0);
        } else if header.name.eq_ignore_ascii_case("origin") {
            origin = Some(String::from_utf8_lossy(header.value).to_string());
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Ok(None);
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);

    let (path, query_str) = match path_and_query.find('?') {
        Some(idx) => (
            path_and_query[..idx].to_string(),
            path_and_query[idx + 1..].to_string(),
        ),
        None => (path_and_query, String::new()),
    };

    Ok(Some(Request {
        method,
        path,
        query: parse_query(&query_str),
        origin,
        body,
    }))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Decode a query string into a key → value map.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.find('=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, ""),
        };
        params.insert(url_decode(key), url_decode(value));
    }
    params
}

/// Percent/plus decoding for query components.
pub fn url_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        out.push(byte as char);
                        i += 3;
                    }
                    Err(_) => {
                        out.push('%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other as char);
                i += 1;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch(state: &AppState, request: &Request) -> (u16, Value) {
    let method = request.method.as_str();
    let path = request.path.as_str();

    let result = match (method, path) {
        ("GET", "/api/metrics/performance") => {
            let limit = query_limit(&request.query, 100);
            Ok(json!(state.performance.recent_samples(limit)))
        }
        ("POST", "/api/metrics/performance") => parse_body::<PerformanceSample>(&request.body)
            .map(|sample| {
                state.performance.record_metrics(sample);
                json!({ "success": true })
            }),
        ("GET", "/api/metrics/performance/average") => {
            let window = request
                .query
                .get("window")
                .and_then(|w| w.parse().ok())
                .unwrap_or(30);
            Ok(json!(state.performance.average_metrics(window)))
        }
        ("POST", "/api/metrics/performance/thresholds") => {
            parse_body::<ThresholdUpdate>(&request.body).map(|update| {
                state.performance.update_thresholds(update);
                json!({ "success": true, "thresholds": state.performance.thresholds() })
            })
        }
        ("GET", "/api/metrics/errors") => {
            let limit = query_limit(&request.query, 50);
            Ok(json!(state.errors.recent_errors(limit)))
        }
        ("POST", "/api/errors/report") => parse_body::<Value>(&request.body).map(|raw| {
            let record = state.errors.report_error(&raw);
            json!({ "success": true, "id": record.id })
        }),
        ("GET", "/api/errors/statistics") => {
            Ok(serde_json::to_value(state.errors.statistics()).unwrap_or(Value::Null))
        }
        ("GET", "/api/errors/trends") => {
            Ok(serde_json::to_value(state.errors.analyze_trends()).unwrap_or(Value::Null))
        }
        ("POST", "/api/errors/clear-resolved") => {
            Ok(json!({ "success": true, "removed": state.errors.clear_resolved() }))
        }
        ("POST", path) if path.starts_with("/api/errors/") && path.ends_with("/resolve") => {
            let id = &path["/api/errors/".len()..path.len() - "/resolve".len()];
            Ok(json!({ "success": true, "found": state.errors.resolve_error(id) }))
        }
        ("GET", "/api/metrics/network") => {
            let limit = query_limit(&request.query, 100);
            Ok(json!(state.network.recent_requests(limit)))
        }
        ("POST", "/api/metrics/network") => {
            parse_body::<RequestReport>(&request.body).map(|report| {
                let record = state.network.record_request(report);
                json!({ "success": true, "id": record.id })
            })
        }
        ("GET", "/api/metrics/network/statistics") => {
            Ok(serde_json::to_value(state.network.statistics()).unwrap_or(Value::Null))
        }
        ("GET", "/api/metrics/network/endpoints") => Ok(serde_json::to_value(
            state.network.analyze_endpoint_performance(),
        )
        .unwrap_or(Value::Null)),
        ("POST", "/api/metrics/network/threshold") => {
            parse_body::<Value>(&request.body).and_then(|body| {
                let ms = body
                    .get("slowRequestThreshold")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| "missing slowRequestThreshold".to_string())?;
                state.network.update_slow_request_threshold(ms);
                Ok(json!({ "success": true, "slowRequestThreshold": ms }))
            })
        }
        ("GET", "/api/tests/results") => Ok(state
            .scheduler
            .latest_results()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or(Value::Null)),
        ("POST", "/api/tests/run") => {
            let suite = if request.body.is_empty() {
                None
            } else {
                match parse_body::<Value>(&request.body) {
                    Ok(body) => body
                        .get("testSuite")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    Err(e) => return failure(&e),
                }
            };
            let summary = state.scheduler.run_manual(suite.as_deref()).await;
            Ok(serde_json::to_value(summary).unwrap_or(Value::Null))
        }
        ("POST", "/api/tests/run-critical") => {
            let summary = state.scheduler.run_critical_path_tests().await;
            Ok(serde_json::to_value(summary).unwrap_or(Value::Null))
        }
        ("GET", "/api/tests/config") => {
            let config = state.scheduler.config_snapshot();
            Ok(json!({
                "autoRunIntervalMs": config.auto_run_interval.as_millis() as u64,
                "browsers": config.browsers,
                "baseURL": config.base_url,
                "testFiles": config.test_files,
                "criticalPathTests": config.critical_path_tests,
            }))
        }
        ("POST", "/api/tests/config") => {
            parse_body::<SchedulerConfigUpdate>(&request.body).map(|update| {
                state.scheduler.update_config(update);
                json!({ "success": true })
            })
        }
        ("GET", "/api/system/health") => Ok(health_snapshot(state)),
        ("POST", "/api/anomaly/event") => parse_body::<Value>(&request.body).and_then(|body| {
            let event = body
                .get("event")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if event != EVENT_AUTONOMOUS_ERROR && event != EVENT_AUTO_FIX_ATTEMPT {
                return Err(format!("unknown anomaly event '{event}'"));
            }
            let payload = body.get("payload").cloned().unwrap_or(Value::Null);
            state.hub.publish_to_all(&event, payload);
            Ok(json!({ "success": true }))
        }),
        _ => return (404, json!({ "error": "not found" })),
    };

    match result {
        Ok(body) => (200, body),
        Err(detail) => failure(&detail),
    }
}

fn failure(detail: &str) -> (u16, Value) {
    tracing::warn!(detail, "handler failure");
    (500, json!({ "error": detail }))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> std::result::Result<T, String> {
    serde_json::from_slice(body).map_err(|e| format!("malformed request body: {e}"))
}

fn query_limit(query: &HashMap<String, String>, default: usize) -> usize {
    query
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(default)
}

fn health_snapshot(state: &AppState) -> Value {
    json!({
        "status": "ok",
        "uptimeSeconds": state.started.elapsed().as_secs(),
        "timestamp": now_ms(),
        "components": {
            "scheduler": {
                "scheduled": state.scheduler.is_scheduled(),
                "cycleRunning": state.scheduler.is_running(),
                "hasResults": state.scheduler.latest_results().is_some(),
            },
            "errorTracker": { "records": state.errors.record_count() },
            "performance": { "bufferedSamples": state.performance.sample_count() },
            "network": { "bufferedRequests": state.network.request_count() },
            "database": { "open": state.db.is_open() },
        },
    })
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn json_response(status: u16, body: &Value, cors: Option<&str>) -> String {
    let body = body.to_string();
    let cors_header = match cors {
        Some(origin) => format!("Access-Control-Allow-Origin: {origin}\r\n"),
        None => String::new(),
    };
    format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{cors_header}Connection: close\r\n\r\n{body}",
        status_reason(status),
        body.len(),
    )
}

fn preflight_response(cors: Option<&str>) -> String {
    let cors_header = match cors {
        Some(origin) => format!(
            "Access-Control-Allow-Origin: {origin}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\n"
        ),
        None => String::new(),
    };
    format!("HTTP/1.1 204 No Content\r\n{cors_header}Connection: close\r\n\r\n")
}

fn cors_value(config: &ServerConfig, origin: Option<&str>) -> Option<String> {
    if config.allowed_origins.iter().any(|o| o == "*") {
        return Some("*".to_string());
    }
    origin
        .filter(|o| config.allowed_origins.iter().any(|allowed| allowed == o))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// WebSocket subscribers
// ---------------------------------------------------------------------------

/// Fan hub events out to one dashboard subscriber joined to `room`.
async fn handle_ws(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    hub: Arc<Hub>,
    room: String,
) {
    let subscriber_id = uuid::Uuid::new_v4().to_string();
    let mut sub = hub.subscribe(&room, &subscriber_id);
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let welcome = json!({
        "event": "connected",
        "room": room.as_str(),
        "subscriberId": subscriber_id.as_str(),
        "timestamp": now_ms(),
    });
    if let Ok(text) = serde_json::to_string(&welcome) {
        let _ = ws_sink.send(WsMessage::Text(text)).await;
    }
    tracing::debug!(room, subscriber_id, "dashboard subscriber joined");

    loop {
        tokio::select! {
            // Frames from the client: only liveness; content is ignored.
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            room_msg = sub.room_rx.recv() => {
                if !forward(&mut ws_sink, room_msg).await {
                    break;
                }
            }
            all_msg = sub.all_rx.recv() => {
                if !forward(&mut ws_sink, all_msg).await {
                    break;
                }
            }
        }
    }

    hub.unsubscribe(&subscriber_id);
    tracing::debug!(room, subscriber_id, "dashboard subscriber left");
}

/// Forward one hub message; returns false when the socket is done.
async fn forward<S>(
    sink: &mut S,
    msg: std::result::Result<Value, tokio::sync::broadcast::error::RecvError>,
) -> bool
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    match msg {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(text) => sink.send(WsMessage::Text(text)).await.is_ok(),
            Err(_) => true,
        },
        // Receiver fell behind; continue without the missed messages.
        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => true,
        Err(tokio::sync::broadcast::error::RecvError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- url_decode ----------------------------------------------------------

    #[test]
    fn test_url_decode_basic() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("hello%20world"), "hello world");
        assert_eq!(url_decode("a%26b"), "a&b");
        assert_eq!(url_decode("plain"), "plain");
    }

    #[test]
    fn test_url_decode_trailing_percent() {
        assert_eq!(url_decode("abc%"), "abc%");
        assert_eq!(url_decode("abc%2"), "abc%2");
    }

    // -- parse_query ---------------------------------------------------------

    #[test]
    fn test_parse_query_basic() {
        let params = parse_query("limit=25&window=60");
        assert_eq!(params.get("limit").map(String::as_str), Some("25"));
        assert_eq!(params.get("window").map(String::as_str), Some("60"));
    }

    #[test]
    fn test_parse_query_empty() {
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_parse_query_no_value() {
        let params = parse_query("flag");
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
    }

    // -- helpers -------------------------------------------------------------

    #[test]
    fn test_query_limit_default_and_parse() {
        let mut query = HashMap::new();
        assert_eq!(query_limit(&query, 50), 50);
        query.insert("limit".to_string(), "10".to_string());
        assert_eq!(query_limit(&query, 50), 10);
        query.insert("limit".to_string(), "bogus".to_string());
        assert_eq!(query_limit(&query, 50), 50);
    }

    #[test]
    fn test_json_response_shape() {
        let response = json_response(200, &json!({"success": true}), Some("*"));
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Access-Control-Allow-Origin: *"));
        assert!(response.ends_with("{\"success\":true}"));
    }

    #[test]
    fn test_cors_wildcard_and_allowlist() {
        let mut config = ServerConfig::default();
        assert_eq!(cors_value(&config, None).as_deref(), Some("*"));

        config.allowed_origins = vec!["http://dash.local".to_string()];
        assert_eq!(cors_value(&config, None), None);
        assert_eq!(
            cors_value(&config, Some("http://dash.local")).as_deref(),
            Some("http://dash.local")
        );
        assert_eq!(cors_value(&config, Some("http://evil.local")), None);
    }

    #[test]
    fn test_find_subslice() {
        assert_eq!(find_subslice(b"abc\r\n\r\ndef", b"\r\n\r\n"), Some(3));
        assert_eq!(find_subslice(b"abcdef", b"\r\n\r\n"), None);
    }
}
