//! Retry policies selected by error class.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_core::ErrorClass;

/// Exponential-backoff retry policy.
///
/// Delay for attempt `n` (1-indexed) is
/// `min(initial_delay * multiplier^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts before dead-lettering (0 = never retry).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// No retries: the first failure is terminal.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn exponential(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Backoff delay before releasing attempt `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (initial_ms * self.multiplier.powi((attempt - 1) as i32)).min(max_ms);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// The error-class → retry-policy table.
///
/// Validation never retries. Processing, integration and infrastructure get
/// increasingly patient schedules: the further the failure is from our own
/// code, the likelier it is transient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicies {
    pub validation: RetryPolicy,
    pub processing: RetryPolicy,
    pub integration: RetryPolicy,
    pub infrastructure: RetryPolicy,
    pub unknown: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            validation: RetryPolicy::none(),
            processing: RetryPolicy::exponential(
                3,
                Duration::from_secs(1),
                Duration::from_secs(30),
                2.0,
            ),
            integration: RetryPolicy::exponential(
                5,
                Duration::from_secs(2),
                Duration::from_secs(120),
                2.0,
            ),
            infrastructure: RetryPolicy::exponential(
                8,
                Duration::from_secs(5),
                Duration::from_secs(600),
                2.0,
            ),
            unknown: RetryPolicy::exponential(
                3,
                Duration::from_secs(2),
                Duration::from_secs(60),
                2.0,
            ),
        }
    }
}

impl RetryPolicies {
    pub fn for_class(&self, class: ErrorClass) -> &RetryPolicy {
        match class {
            ErrorClass::Validation => &self.validation,
            ErrorClass::Processing => &self.processing,
            ErrorClass::Integration => &self.integration,
            ErrorClass::Infrastructure => &self.infrastructure,
            ErrorClass::Unknown => &self.unknown,
        }
    }
}
