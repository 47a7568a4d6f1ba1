//! Classified engine error.
//!
//! Every failure carries an explicit [`ErrorClass`] assigned at the point of
//! creation. The resilience layer selects retry behavior from the class
//! alone; nothing downstream inspects message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure taxonomy driving retry policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed or incomplete payload. Never retried; routed to manual
    /// review because re-running a structurally invalid payload cannot
    /// succeed.
    Validation,
    /// Transient internal failure (e.g. a lost race, a busy resource).
    Processing,
    /// A downstream dependency is unavailable or slow.
    Integration,
    /// Outage or resource exhaustion; gets the most patient retry policy.
    Infrastructure,
    /// Could not be classified; fallback policy with moderate retries.
    Unknown,
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Processing => "processing",
            ErrorClass::Integration => "integration",
            ErrorClass::Infrastructure => "infrastructure",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Engine-level error: a class plus a human-readable message.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{class}] {message}")]
pub struct EngineError {
    pub class: ErrorClass,
    pub message: String,
}

impl EngineError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Processing, message)
    }

    pub fn integration(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Integration, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Infrastructure, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unknown, message)
    }

    /// Validation failures are terminal; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        self.class != ErrorClass::Validation
    }
}
