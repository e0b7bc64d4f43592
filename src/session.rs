//! Store pairing and engine configuration.
//!
//! A register is paired to its backend with a connection string: a
//! base64url blob of `{url, key, wid}` produced by the admin dashboard,
//! with plain JSON accepted too for manual setups. The decoded pairing
//! plus an `EngineConfig` is everything the engine needs to start.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Pairing
// ---------------------------------------------------------------------------

/// Decoded pairing between this register and its backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pairing {
    pub backend_url: String,
    pub api_key: String,
    pub workspace_id: String,
}

fn decode_pairing_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    // Tolerate base64url and missing padding.
    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn field(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Pairing {
    /// Decode a connection string into a pairing.
    pub fn from_connection_string(raw: &str) -> CoreResult<Self> {
        let payload = decode_pairing_payload(raw).ok_or_else(|| {
            CoreError::Validation("Connection string is not valid base64 or JSON".into())
        })?;

        let url = field(&payload, &["url"])
            .ok_or_else(|| CoreError::Validation("Connection string is missing `url`".into()))?;
        let api_key = field(&payload, &["key"])
            .ok_or_else(|| CoreError::Validation("Connection string is missing `key`".into()))?;
        let workspace_id = field(&payload, &["wid", "workspaceId"])
            .ok_or_else(|| CoreError::Validation("Connection string is missing `wid`".into()))?;

        Ok(Pairing {
            backend_url: normalize_backend_url(&url),
            api_key,
            workspace_id,
        })
    }

    /// Per-workspace data directory under the engine's data root. The
    /// workspace id is sanitised so a hostile id cannot escape the root.
    pub fn workspace_dir(&self, data_dir: &Path) -> PathBuf {
        let safe: String = self
            .workspace_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        data_dir.join(safe)
    }
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// Tunables for the engine's background work.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for per-workspace databases.
    pub data_dir: PathBuf,
    /// How often the dispatcher wakes to flush the queue.
    pub flush_interval: Duration,
    /// How often the connectivity monitor re-evaluates online state.
    pub heartbeat_interval: Duration,
    /// Heartbeat probe timeout. Kept short so a dead link is noticed
    /// within one monitor cycle.
    pub heartbeat_timeout: Duration,
    /// Timeout for regular backend calls.
    pub request_timeout: Duration,
    /// Max queue rows claimed per flush.
    pub claim_batch: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            flush_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            claim_batch: 10,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(
            normalize_backend_url("shop.example.com"),
            "https://shop.example.com"
        );
        assert_eq!(
            normalize_backend_url("localhost:3000"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_backend_url("https://shop.example.com/api/"),
            "https://shop.example.com"
        );
        assert_eq!(
            normalize_backend_url("  https://shop.example.com///  "),
            "https://shop.example.com"
        );
    }

    #[test]
    fn test_pairing_from_base64url_connection_string() {
        let raw = URL_SAFE_NO_PAD.encode(
            r#"{"url":"shop.example.com/api","key":"bk_live_123","wid":"store-7"}"#,
        );
        let pairing = Pairing::from_connection_string(&raw).unwrap();
        assert_eq!(pairing.backend_url, "https://shop.example.com");
        assert_eq!(pairing.api_key, "bk_live_123");
        assert_eq!(pairing.workspace_id, "store-7");
    }

    #[test]
    fn test_pairing_from_inline_json() {
        let raw = r#" { "url": "localhost:3000", "key": "k", "workspaceId": "w1" } "#;
        let pairing = Pairing::from_connection_string(raw).unwrap();
        assert_eq!(pairing.backend_url, "http://localhost:3000");
        assert_eq!(pairing.workspace_id, "w1");
    }

    #[test]
    fn test_pairing_rejects_garbage_and_missing_fields() {
        assert!(matches!(
            Pairing::from_connection_string("not-a-pairing"),
            Err(CoreError::Validation(_))
        ));

        let missing_key = URL_SAFE_NO_PAD.encode(r#"{"url":"shop.example.com","wid":"w1"}"#);
        let err = Pairing::from_connection_string(&missing_key).unwrap_err();
        assert!(err.to_string().contains("key"));
    }

    #[test]
    fn test_workspace_dir_is_sanitised() {
        let pairing = Pairing {
            backend_url: "https://shop.example.com".into(),
            api_key: "k".into(),
            workspace_id: "../../etc/passwd".into(),
        };
        let dir = pairing.workspace_dir(Path::new("/data"));
        assert_eq!(dir, PathBuf::from("/data/______etc_passwd"));
    }

    #[test]
    fn test_default_config_cadence() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.flush_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(5));
    }
}
