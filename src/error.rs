//! Hub error types.
//!
//! Defines error variants for settings mutation, upstream operations,
//! downstream routing, and teardown.

use std::time::Duration;

use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Failed to persist settings: {0}")]
    PersistenceFailed(String),

    #[error("Connection to '{server}' failed: {message}")]
    ConnectFailed { server: String, message: String },

    #[error("Failed to list tools on '{server}': {message}")]
    ListToolsFailed { server: String, message: String },

    #[error("Tool call on '{server}' failed: {message}")]
    CallFailed {
        server: String,
        message: String,
        /// HTTP status carried by transport-level failures, when one exists.
        http_status: Option<u16>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Server removed: {0}")]
    ServerRemoved(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl HubError {
    pub fn call_failed(server: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let http_status = extract_http_status(&message);
        HubError::CallFailed {
            server: server.into(),
            message,
            http_status,
        }
    }

    /// HTTP status attached to this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            HubError::CallFailed { http_status, .. } => *http_status,
            HubError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this error is the kind a streamable-HTTP reconnect may fix:
    /// a transport-level 4xx from the upstream.
    pub fn is_reconnect_candidate(&self) -> bool {
        matches!(self.http_status(), Some(status) if (400..500).contains(&status))
    }
}

/// Best-effort extraction of an HTTP status code from an upstream error
/// message. Transport errors from the SDK stringify as e.g.
/// "Transport error: HTTP status client error (401 Unauthorized) ...".
fn extract_http_status(message: &str) -> Option<u16> {
    let bytes = message.as_bytes();
    for (i, window) in bytes.windows(3).enumerate() {
        if !window.iter().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Reject digits embedded in longer numbers.
        let before = i.checked_sub(1).map(|j| bytes[j]);
        let after = bytes.get(i + 3);
        if before.is_some_and(|b| b.is_ascii_digit()) || after.is_some_and(|b| b.is_ascii_digit()) {
            continue;
        }
        let code: u16 = message[i..i + 3].parse().ok()?;
        if (100..600).contains(&code) {
            return Some(code);
        }
    }
    None
}
