use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One `{code, message}` entry from a structured remote error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorDetail {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl fmt::Display for RemoteErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "[{code}] {message}"),
            (Some(code), None) => write!(f, "[{code}]"),
            (None, Some(message)) => write!(f, "{message}"),
            (None, None) => write!(f, "unknown error"),
        }
    }
}

fn join_details(errors: &[RemoteErrorDetail]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("catalog request failed: {0}")]
    Http(String),

    #[error("catalog returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("catalog API error (status {status}): {}", join_details(.errors))]
    RemoteApi {
        status: u16,
        errors: Vec<RemoteErrorDetail>,
    },

    #[error("response of {bytes} bytes exceeds the in-memory budget of {limit} bytes")]
    MemoryPressure { bytes: u64, limit: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("inconsistent catalog index for {key}: cached {cached}, offered {offered}")]
    IndexConflict {
        key: String,
        cached: String,
        offered: String,
    },

    #[error("corrupt geometry: {0}")]
    CorruptGeometry(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("unexpected catalog response: {0}")]
    UnexpectedResponse(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("sink rejected operation: {0}")]
    Sink(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SyncError {
    /// Errors that abort the current object type but not a batch run.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SyncError::Http(_) | SyncError::Status { .. } | SyncError::RemoteApi { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_api_message_lists_every_detail() {
        let err = SyncError::RemoteApi {
            status: 400,
            errors: vec![
                RemoteErrorDetail {
                    code: Some(4005),
                    message: Some("Ugyldig objekttype".to_string()),
                },
                RemoteErrorDetail {
                    code: None,
                    message: Some("second".to_string()),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "catalog API error (status 400): [4005] Ugyldig objekttype; second"
        );
        assert!(err.is_remote());
    }
}
