//! Crate-wide error taxonomy.
//!
//! Modeled on `SemOsError`: one enum, one `http_status()` method, and an
//! `IntoResponse` impl at the dispatcher boundary so callers elsewhere in
//! the crate never need to know about HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Truncate a response body to at most 1 KiB of context, used by every
/// bootstrap/config/fetch/shipment error path.
pub fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 1024;
    if body.len() <= LIMIT {
        body.to_string()
    } else {
        let mut end = LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[derive(Debug, Error)]
pub enum EdlError {
    #[error("invalid bootstrap token: {0}")]
    InvalidBootstrapToken(String),

    #[error("bootstrap failed: HTTP {status}: {body}")]
    Bootstrap { status: u16, body: String },

    #[error("deployment permanently deleted")]
    PermanentlyDeleted,

    #[error("deployment temporarily disabled: {body}")]
    TemporarilyDisabled { body: String },

    #[error("EDL fetch failed: HTTP {status}: {body}")]
    EdlFetch { status: u16, body: String },

    #[error("invalid trie magic")]
    InvalidMagic,

    #[error("unsupported trie format version: {got}")]
    UnsupportedVersion { got: u16 },

    #[error("truncated trie stream")]
    Truncated,

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("log shipment failed: HTTP {status}: {body}")]
    Shipment { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EdlError {
    /// HTTP status a dispatcher should map this error to, where applicable.
    /// Background-loop errors (fetch/shipment/bootstrap failures) are never
    /// surfaced to a request; only the per-request path (`InvalidIp`) is
    /// actually converted via [`IntoResponse`].
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidIp(_) => StatusCode::BAD_REQUEST,
            Self::InvalidBootstrapToken(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PermanentlyDeleted | Self::TemporarilyDisabled { .. } => StatusCode::OK,
            Self::Bootstrap { .. }
            | Self::EdlFetch { .. }
            | Self::Shipment { .. }
            | Self::InvalidMagic
            | Self::UnsupportedVersion { .. }
            | Self::Truncated
            | Self::Transport(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EdlError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
