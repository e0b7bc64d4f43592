//! Backend callable client.
//!
//! The engine talks to the Brightcart backend through named callables
//! (`commitSale`, `receiveStock`) plus a lightweight health probe. The
//! `CallableBackend` trait is the seam: production uses `HttpBackend`,
//! tests script their own fakes.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::session::{EngineConfig, Pairing};

/// Remote-callable surface of the backend.
#[async_trait]
pub trait CallableBackend: Send + Sync {
    /// Invoke a named callable with a JSON payload.
    async fn invoke(&self, name: &str, payload: &Value) -> CoreResult<Value>;

    /// Cheap heartbeat. True when the backend answered the health probe.
    async fn is_reachable(&self) -> bool;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest-backed `CallableBackend` speaking to the admin backend over
/// HTTPS. Two clients: the regular one with the full request timeout and
/// a short-timeout probe client for heartbeats.
pub struct HttpBackend {
    base: String,
    api_key: String,
    workspace_id: String,
    client: Client,
    probe: Client,
}

impl HttpBackend {
    pub fn new(pairing: &Pairing, config: &EngineConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("http client: {e}")))?;
        let probe = Client::builder()
            .timeout(config.heartbeat_timeout)
            .build()
            .map_err(|e| CoreError::Internal(format!("probe client: {e}")))?;

        Ok(Self {
            base: pairing.backend_url.clone(),
            api_key: pairing.api_key.clone(),
            workspace_id: pairing.workspace_id.clone(),
            client,
            probe,
        })
    }

    fn callable_url(&self, name: &str) -> String {
        format!("{}/api/callables/{}", self.base, name)
    }

    fn health_url(&self) -> String {
        format!("{}/api/health", self.base)
    }
}

/// Pull the most useful message out of an error response body. The
/// backend sends `{error|message, details|errors}` on failures; keep
/// the status code visible either way.
fn status_detail(status: StatusCode, body_text: &str) -> String {
    let code = status.as_u16();
    if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let details = json.get("details").or_else(|| json.get("errors")).cloned();
        match (message, details) {
            (Some(m), Some(d)) => return format!("{m} (HTTP {code}): {d}"),
            (Some(m), None) => return format!("{m} (HTTP {code})"),
            _ => {}
        }
    }
    let trimmed = body_text.trim();
    if trimmed.is_empty() {
        format!("HTTP {code}")
    } else {
        format!("HTTP {code}: {trimmed}")
    }
}

#[async_trait]
impl CallableBackend for HttpBackend {
    async fn invoke(&self, name: &str, payload: &Value) -> CoreResult<Value> {
        let url = self.callable_url(name);
        debug!(callable = name, "Invoking backend callable");

        let resp = self
            .client
            .post(&url)
            .header("X-Brightcart-Key", &self.api_key)
            .header("x-workspace-id", &self.workspace_id)
            .json(payload)
            .send()
            .await
            .map_err(|e| CoreError::from_reqwest(&self.base, &e))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(CoreError::from_status(
                status.as_u16(),
                &status_detail(status, &body_text),
            ));
        }

        // Empty 204-style responses come back as null.
        let body_text = resp
            .text()
            .await
            .map_err(|e| CoreError::from_reqwest(&self.base, &e))?;
        if body_text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| CoreError::Internal(format!("invalid JSON from backend: {e}")))
    }

    async fn is_reachable(&self) -> bool {
        match self
            .probe
            .head(self.health_url())
            .header("X-Brightcart-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Heartbeat probe failed");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
