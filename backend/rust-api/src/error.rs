//! Error types for the proctoring core

use thiserror::Error;

use crate::models::SessionState;

/// Failure of a browser capability (device, permission or relay).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Malformed sample: {0}")]
    Malformed(String),
}

/// Failure of one submission gateway call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Transient gateway failure: {0}")]
    Transient(String),

    #[error("Gateway call timed out after {0} ms")]
    Timeout(u64),

    #[error("Submission rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }
}

#[derive(Debug, Error)]
pub enum ProctorError {
    #[error("Cannot start exam, {capability} permission failed: {source}")]
    PermissionDenied {
        capability: &'static str,
        #[source]
        source: CapabilityError,
    },

    #[error("Operation not allowed while session is {actual}")]
    InvalidState { actual: SessionState },

    #[error("Submission failed after {attempts} attempt(s): {source}")]
    SubmissionFailed {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("Invalid answer for question {question}")]
    InvalidAnswer { question: usize },

    #[error("Session controller is no longer running")]
    SessionGone,
}
