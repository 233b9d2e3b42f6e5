//! Error types for polyeval.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures scoped to one task (bad verdict, timeout)
//! - I^B materialized: Backend or infrastructure failures (launch, network, capacity)
//! - K_i violated: Internal invariant violations (bugs)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Longest slice of raw model output kept inside an error message.
const RAW_EXCERPT_CHARS: usize = 240;

/// Top-level error type for polyeval.
#[derive(Debug, Error)]
pub enum EvalError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Could not parse a verdict from model output: {raw:?}")]
    UnparseableVerdict { raw: String },

    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Input mismatch: {0}")]
    InputMismatch(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Backend '{backend}' does not support {operation}")]
    Unsupported {
        backend: String,
        operation: &'static str,
    },

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Backend unavailable ({backend}): {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Backend capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("HTTP API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors returned by HTTP inference endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl EvalError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Build an unparseable-verdict error, keeping only a bounded excerpt of the output.
    pub fn unparseable(raw: &str) -> Self {
        Self::UnparseableVerdict {
            raw: raw.chars().take(RAW_EXCERPT_CHARS).collect(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable at the HTTP layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Api(ApiError::Status { status, .. }) => *status == 408 || *status >= 500,
            _ => false,
        }
    }

    /// Whether this error is scoped to a single task.
    ///
    /// Task-level errors are recorded against the task and the run carries on;
    /// everything else aborts the run.
    pub fn is_task_level(&self) -> bool {
        if let Self::Api(ApiError::AuthenticationFailed | ApiError::ModelNotFound(_)) = self {
            return false;
        }
        matches!(
            self,
            Self::UnparseableVerdict { .. }
                | Self::GenerationFailure(_)
                | Self::InputMismatch(_)
                | Self::InvalidInput(_)
                | Self::ParseError(_)
                | Self::CapacityExceeded(_)
                | Self::Api(_)
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::RateLimited { .. }
        )
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Classify this error for a task failure record.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::Timeout(_) => FailureReason::Timeout,
            Self::UnparseableVerdict { .. } => FailureReason::UnparseableVerdict,
            Self::CapacityExceeded(_) => FailureReason::CapacityExceeded,
            Self::InputMismatch(_) | Self::InvalidInput(_) => FailureReason::InputMismatch,
            Self::GenerationFailure(_) | Self::ParseError(_) => FailureReason::GenerationFailure,
            _ => FailureReason::Backend,
        }
    }
}

/// Why a task ended in the Failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    UnparseableVerdict,
    GenerationFailure,
    CapacityExceeded,
    InputMismatch,
    Backend,
    Panicked,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::UnparseableVerdict => "unparseable_verdict",
            Self::GenerationFailure => "generation_failure",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::InputMismatch => "input_mismatch",
            Self::Backend => "backend",
            Self::Panicked => "panicked",
        };
        f.write_str(s)
    }
}

/// Result type alias for polyeval.
pub type Result<T> = std::result::Result<T, EvalError>;
