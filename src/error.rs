//! Error taxonomy for the Brightcart engine.
//!
//! Every failure is sorted into a class the rest of the engine keys off:
//! validation problems stay inline and are never retried, offline failures
//! are queued for replay, rejections are surfaced once and dropped, and
//! anything unexpected gets a generic notice plus a log line.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input, caught before any storage or network work happens.
    #[error("{0}")]
    Validation(String),

    /// Backend unreachable or transiently unavailable. Safe to retry.
    #[error("backend unreachable: {0}")]
    Offline(String),

    /// A sale with this id already exists (double submit or replay).
    #[error("duplicate sale {0}")]
    DuplicateSale(String),

    /// The backend or document store rejected the operation outright.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Local durable storage failure.
    #[error("local storage: {0}")]
    Storage(String),

    /// Anything we did not anticipate.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse class used at operation boundaries: does this error get queued,
/// shown inline, or surfaced as a one-off rejection?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    Offline,
    Rejected,
    Unexpected,
}

impl CoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::Validation(_) => ErrorClass::Validation,
            CoreError::Offline(_) => ErrorClass::Offline,
            CoreError::DuplicateSale(_) | CoreError::Rejected(_) => ErrorClass::Rejected,
            CoreError::Storage(_) | CoreError::Internal(_) => ErrorClass::Unexpected,
        }
    }

    /// True when a retry through the offline queue can succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Offline(_))
    }

    /// Map a transport-level failure onto the taxonomy. Connection and
    /// timeout failures are retryable; a malformed response body is not.
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_connect() {
            return CoreError::Offline(format!("cannot reach backend at {url}"));
        }
        if err.is_timeout() {
            return CoreError::Offline(format!("connection to {url} timed out"));
        }
        if err.is_builder() {
            return CoreError::Rejected(format!("invalid backend URL: {url}"));
        }
        if err.is_decode() {
            return CoreError::Internal(format!("invalid response from {url}: {err}"));
        }
        CoreError::Offline(format!("network error communicating with {url}: {err}"))
    }

    /// Map an HTTP status (plus whatever detail the body carried) onto the
    /// taxonomy. 5xx and 429 are the backend saying "not now" — retryable.
    /// The 4xx family is the backend saying "never" — not retryable.
    pub fn from_status(status: u16, detail: &str) -> Self {
        let detail = if detail.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("{} (HTTP {status})", detail.trim())
        };
        match status {
            401 => CoreError::Rejected(format!("API key is invalid or expired: {detail}")),
            403 => CoreError::Rejected(format!("workspace not authorized: {detail}")),
            404 => CoreError::Rejected(format!("backend endpoint not found: {detail}")),
            429 => CoreError::Offline(format!("backend is backed up: {detail}")),
            s if s >= 500 => CoreError::Offline(format!("backend server error: {detail}")),
            s if s >= 400 => CoreError::Rejected(detail),
            _ => CoreError::Internal(format!("unexpected response: {detail}")),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_mapping() {
        assert_eq!(
            CoreError::Validation("qty".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(CoreError::Offline("net".into()).class(), ErrorClass::Offline);
        assert_eq!(
            CoreError::DuplicateSale("s-1".into()).class(),
            ErrorClass::Rejected
        );
        assert_eq!(
            CoreError::Rejected("denied".into()).class(),
            ErrorClass::Rejected
        );
        assert_eq!(
            CoreError::Storage("disk".into()).class(),
            ErrorClass::Unexpected
        );
        assert_eq!(
            CoreError::Internal("bug".into()).class(),
            ErrorClass::Unexpected
        );
    }

    #[test]
    fn test_only_offline_is_retryable() {
        assert!(CoreError::Offline("x".into()).is_retryable());
        assert!(!CoreError::Rejected("x".into()).is_retryable());
        assert!(!CoreError::Validation("x".into()).is_retryable());
        assert!(!CoreError::DuplicateSale("x".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            CoreError::from_status(503, "maintenance"),
            CoreError::Offline(_)
        ));
        assert!(matches!(
            CoreError::from_status(429, ""),
            CoreError::Offline(_)
        ));
        assert!(matches!(
            CoreError::from_status(401, ""),
            CoreError::Rejected(_)
        ));
        assert!(matches!(
            CoreError::from_status(422, "bad supplier"),
            CoreError::Rejected(_)
        ));
        assert!(matches!(
            CoreError::from_status(302, ""),
            CoreError::Internal(_)
        ));
    }

    #[test]
    fn test_status_detail_is_preserved() {
        let err = CoreError::from_status(422, "qty must be positive");
        assert!(err.to_string().contains("qty must be positive"));
        assert!(err.to_string().contains("422"));
    }

    #[test]
    fn test_sqlite_errors_map_to_storage() {
        let err: CoreError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(err.class(), ErrorClass::Unexpected);
    }
}
