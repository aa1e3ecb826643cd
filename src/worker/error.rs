//! Crate-level error types for the session worker.
//!
//! Every upstream failure (edge HTTP errors, socket errors, signal-layer
//! decrypt failures) is folded into a single [`WorkerError`] with a
//! classified [`WorkerErrorKind`], so callers branch on kinds instead of
//! re-matching message strings at every call site.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Alias for `Result<T, WorkerError>`.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Uniform error type used across the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
    /// HTTP status code if the error originated from an edge call.
    pub http_status: Option<u16>,
    /// Raw response body (truncated) for edge errors.
    pub body: Option<String>,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " (http {})", status)?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkerError {}

/// Categorised error kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerErrorKind {
    // ── Session lifecycle ────────────────────────────────
    LoggedOut,
    BadSession,
    Restart515,
    // ── Signal layer ─────────────────────────────────────
    BadMac,
    SignalDecrypt,
    SignalNoSession,
    // ── Edge / HTTP ──────────────────────────────────────
    Timeout,
    HttpStatus,
    DuplicateContact,
    NotFound,
    NetworkError,
    // ── Internal ─────────────────────────────────────────
    MalformedMessage,
    SerializationError,
    Io,
    Internal,
    Other,
}

/// Disconnect status code the stream reports when a restart is required.
pub const STREAM_RESTART_CODE: u16 = 515;

/// Disconnect status code the stream reports when the session is logged out.
pub const LOGGED_OUT_CODE: u16 = 401;

const BODY_CAP: usize = 500;

impl WorkerError {
    pub fn new(kind: WorkerErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            http_status: None,
            body: None,
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::NetworkError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Timeout, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Internal, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::Io, msg)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(WorkerErrorKind::MalformedMessage, msg)
    }

    /// Build from an edge HTTP response that did not return 2xx.
    ///
    /// 409s and the known unique-constraint bodies are classified as
    /// duplicate conflicts; callers treat those as benign.
    pub fn from_response(status: u16, body: &str) -> Self {
        let kind = if Self::body_is_duplicate(status, body) {
            WorkerErrorKind::DuplicateContact
        } else if status == 404 {
            WorkerErrorKind::NotFound
        } else {
            WorkerErrorKind::HttpStatus
        };
        Self {
            kind,
            message: format!("edge returned {}", status),
            http_status: Some(status),
            body: Some(body.chars().take(BODY_CAP).collect()),
        }
    }

    fn body_is_duplicate(status: u16, body: &str) -> bool {
        if status == 409 {
            return true;
        }
        status == 500
            && (body.contains("duplicate key value")
                || body.contains("contacts_instance_id_jid_key")
                || body.contains("23505"))
    }

    /// Classify a signal/stream error message into a tagged kind.
    pub fn classify_signal(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let lower = message.to_lowercase();
        let kind = if lower.contains("no matching sessions found") {
            WorkerErrorKind::SignalNoSession
        } else if lower.contains("bad mac") {
            WorkerErrorKind::BadMac
        } else if lower.contains("failed to decrypt message") {
            WorkerErrorKind::SignalDecrypt
        } else if lower.contains("bad session") {
            WorkerErrorKind::BadSession
        } else if lower.contains("logged out") {
            WorkerErrorKind::LoggedOut
        } else {
            WorkerErrorKind::Other
        };
        Self::new(kind, message)
    }

    /// True when the error is the benign duplicate-contact conflict.
    pub fn is_duplicate_conflict(&self) -> bool {
        self.kind == WorkerErrorKind::DuplicateContact
    }

    /// True when the error counts toward the Bad-MAC circuit breaker.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self.kind,
            WorkerErrorKind::BadMac
                | WorkerErrorKind::SignalDecrypt
                | WorkerErrorKind::SignalNoSession
        )
    }

    /// True when the error invalidates the stored auth material.
    pub fn triggers_auth_wipe(&self) -> bool {
        matches!(
            self.kind,
            WorkerErrorKind::LoggedOut | WorkerErrorKind::BadSession
        )
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(WorkerErrorKind::SerializationError, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_status() {
        let err = WorkerError::from_response(503, "unavailable");
        let s = err.to_string();
        assert!(s.contains("HttpStatus"));
        assert!(s.contains("http 503"));
    }

    #[test]
    fn test_duplicate_classification_409() {
        let err = WorkerError::from_response(409, "conflict");
        assert!(err.is_duplicate_conflict());
    }

    #[test]
    fn test_duplicate_classification_500_bodies() {
        for body in [
            "ERROR: duplicate key value violates unique constraint",
            "constraint contacts_instance_id_jid_key violated",
            "SQLSTATE 23505",
        ] {
            let err = WorkerError::from_response(500, body);
            assert!(err.is_duplicate_conflict(), "body: {}", body);
        }
        let err = WorkerError::from_response(500, "plain failure");
        assert!(!err.is_duplicate_conflict());
        assert_eq!(err.kind, WorkerErrorKind::HttpStatus);
    }

    #[test]
    fn test_not_found_classification() {
        let err = WorkerError::from_response(404, "");
        assert_eq!(err.kind, WorkerErrorKind::NotFound);
    }

    #[test]
    fn test_signal_classification() {
        let cases = [
            ("Bad MAC error", WorkerErrorKind::BadMac),
            ("Failed to decrypt message", WorkerErrorKind::SignalDecrypt),
            (
                "No matching sessions found for message",
                WorkerErrorKind::SignalNoSession,
            ),
            ("Bad session detected", WorkerErrorKind::BadSession),
            ("Connection logged out", WorkerErrorKind::LoggedOut),
            ("something else entirely", WorkerErrorKind::Other),
        ];
        for (msg, kind) in cases {
            assert_eq!(WorkerError::classify_signal(msg).kind, kind, "{}", msg);
        }
    }

    #[test]
    fn test_breaker_and_wipe_predicates() {
        assert!(WorkerError::classify_signal("bad mac").counts_toward_breaker());
        assert!(WorkerError::classify_signal("failed to decrypt message").counts_toward_breaker());
        assert!(
            WorkerError::classify_signal("no matching sessions found").counts_toward_breaker()
        );
        assert!(!WorkerError::classify_signal("logged out").counts_toward_breaker());

        assert!(WorkerError::classify_signal("logged out").triggers_auth_wipe());
        assert!(WorkerError::classify_signal("bad session").triggers_auth_wipe());
        assert!(!WorkerError::classify_signal("bad mac").triggers_auth_wipe());
    }

    #[test]
    fn test_body_is_capped() {
        let body = "x".repeat(2000);
        let err = WorkerError::from_response(500, &body);
        assert_eq!(err.body.unwrap().len(), 500);
    }
}
