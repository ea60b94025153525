//! Minimal W3C WebDriver HTTP client.
//!
//! Speaks the protocol subset the check battery needs: session lifecycle,
//! navigation, title, element lookup, script execution, and window
//! management. The driver process (chromedriver, geckodriver, ...) is an
//! external collaborator reached over plain HTTP.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Key under which the W3C protocol nests element references.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Errors from driver communication.
///
/// Each variant carries enough context to diagnose the failure without
/// needing the originating error.
#[derive(Debug)]
pub enum WebDriverError {
    /// A TCP-level connection to the driver could not be established.
    Connect { url: String, detail: String },
    /// The driver replied with a non-2xx status outside protocol semantics.
    Http { status: u16, url: String },
    /// The driver reported a protocol-level error (e.g. session not created).
    Protocol { code: String, detail: String },
    /// Response body could not be parsed as the expected JSON structure.
    Json { detail: String },
}

impl std::fmt::Display for WebDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebDriverError::Connect { url, detail } => {
                write!(f, "connection failed to {url}: {detail}")
            }
            WebDriverError::Http { status, url } => write!(f, "HTTP {status} from {url}"),
            WebDriverError::Protocol { code, detail } => {
                write!(f, "webdriver error '{code}': {detail}")
            }
            WebDriverError::Json { detail } => write!(f, "malformed driver response: {detail}"),
        }
    }
}

impl std::error::Error for WebDriverError {}

/// Error envelope the protocol nests under `value` on failures.
#[derive(Debug, Deserialize)]
struct ProtocolError {
    error: String,
    #[serde(default)]
    message: String,
}

/// One driver endpoint (e.g. `http://127.0.0.1:9515`).
#[derive(Debug, Clone)]
pub struct WebDriverClient {
    http: reqwest::Client,
    base_url: String,
}

impl WebDriverClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, WebDriverError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(45))
            .build()
            .map_err(|e| WebDriverError::Json {
                detail: format!("client build failed: {e}"),
            })?;
        Ok(WebDriverClient {
            http,
            base_url: base_url.into(),
        })
    }

    /// Create a session for the named browser, returning its session id.
    pub async fn new_session(&self, browser: &str) -> Result<String, WebDriverError> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": { "browserName": browser }
            }
        });
        let value = self.post("/session", &body).await?;
        value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| WebDriverError::Json {
                detail: "missing sessionId in new-session response".to_string(),
            })
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), WebDriverError> {
        self.delete(&format!("/session/{session_id}")).await?;
        Ok(())
    }

    /// Configure the page-load timeout for the session.
    pub async fn set_page_load_timeout(
        &self,
        session_id: &str,
        timeout_ms: u64,
    ) -> Result<(), WebDriverError> {
        self.post(
            &format!("/session/{session_id}/timeouts"),
            &json!({ "pageLoad": timeout_ms }),
        )
        .await?;
        Ok(())
    }

    pub async fn navigate(&self, session_id: &str, url: &str) -> Result<(), WebDriverError> {
        self.post(&format!("/session/{session_id}/url"), &json!({ "url": url }))
            .await?;
        Ok(())
    }

    pub async fn title(&self, session_id: &str) -> Result<String, WebDriverError> {
        let value = self.get(&format!("/session/{session_id}/title")).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Execute a synchronous script; `args` must be a JSON array.
    pub async fn execute(
        &self,
        session_id: &str,
        script: &str,
        args: Value,
    ) -> Result<Value, WebDriverError> {
        self.post(
            &format!("/session/{session_id}/execute/sync"),
            &json!({ "script": script, "args": args }),
        )
        .await
    }

    /// Look up one element by CSS selector.
    ///
    /// Returns `Ok(None)` for "no such element" so callers can distinguish an
    /// absent element from a driver failure.
    pub async fn find_element(
        &self,
        session_id: &str,
        css: &str,
    ) -> Result<Option<String>, WebDriverError> {
        let result = self
            .post(
                &format!("/session/{session_id}/element"),
                &json!({ "using": "css selector", "value": css }),
            )
            .await;
        match result {
            Ok(value) => Ok(value
                .get(ELEMENT_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string)),
            Err(WebDriverError::Protocol { code, .. }) if code == "no such element" => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether the referenced element is rendered and visible.
    ///
    /// Evaluated via script with the W3C element reference, which both
    /// chromedriver and geckodriver accept.
    pub async fn is_displayed(
        &self,
        session_id: &str,
        element_id: &str,
    ) -> Result<bool, WebDriverError> {
        let element_ref = json!({ ELEMENT_KEY: element_id });
        let script = "const el = arguments[0]; \
             const style = window.getComputedStyle(el); \
             const rect = el.getBoundingClientRect(); \
             return style.display !== 'none' && style.visibility !== 'hidden' \
                 && rect.width > 0 && rect.height > 0;";
        let value = self
            .execute(session_id, script, json!([element_ref]))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Capture the viewport as a base64-encoded PNG.
    pub async fn screenshot(&self, session_id: &str) -> Result<String, WebDriverError> {
        let value = self
            .get(&format!("/session/{session_id}/screenshot"))
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WebDriverError::Json {
                detail: "screenshot response was not a string".to_string(),
            })
    }

    /// Open a new top-level browsing context, returning its window handle.
    pub async fn new_window(&self, session_id: &str) -> Result<String, WebDriverError> {
        let value = self
            .post(
                &format!("/session/{session_id}/window/new"),
                &json!({ "type": "tab" }),
            )
            .await?;
        value
            .get("handle")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| WebDriverError::Json {
                detail: "missing handle in new-window response".to_string(),
            })
    }

    pub async fn switch_window(
        &self,
        session_id: &str,
        handle: &str,
    ) -> Result<(), WebDriverError> {
        self.post(
            &format!("/session/{session_id}/window"),
            &json!({ "handle": handle }),
        )
        .await?;
        Ok(())
    }

    /// Close the current window, returning the remaining handles.
    pub async fn close_window(&self, session_id: &str) -> Result<Vec<String>, WebDriverError> {
        let value = self.delete(&format!("/session/{session_id}/window")).await?;
        Ok(value
            .as_array()
            .map(|handles| {
                handles
                    .iter()
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    // -- transport -----------------------------------------------------------

    async fn post(&self, path: &str, body: &Value) -> Result<Value, WebDriverError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| WebDriverError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        Self::unwrap_value(resp, &url).await
    }

    async fn get(&self, path: &str) -> Result<Value, WebDriverError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| WebDriverError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        Self::unwrap_value(resp, &url).await
    }

    async fn delete(&self, path: &str) -> Result<Value, WebDriverError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| WebDriverError::Connect {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        Self::unwrap_value(resp, &url).await
    }

    /// Unwrap `{ "value": ... }`, mapping protocol error envelopes.
    async fn unwrap_value(resp: reqwest::Response, url: &str) -> Result<Value, WebDriverError> {
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.map_err(|e| WebDriverError::Json {
            detail: e.to_string(),
        })?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);

        if status >= 400 {
            if let Ok(err) = serde_json::from_value::<ProtocolError>(value.clone()) {
                return Err(WebDriverError::Protocol {
                    code: err.error,
                    detail: err.message,
                });
            }
            return Err(WebDriverError::Http {
                status,
                url: url.to_string(),
            });
        }
        Ok(value)
    }
}
