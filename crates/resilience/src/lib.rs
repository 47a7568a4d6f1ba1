//! `keel-resilience` — shared failure-handling layer.
//!
//! Classified retry policies, a durable versioned circuit breaker, and
//! dead-letter routing. Every external or transient call in the posting
//! pipeline goes through this crate.

pub mod breaker;
pub mod dead_letter;
pub mod retry;

pub use breaker::{
    CircuitBreaker, CircuitKey, CircuitRecord, CircuitState, CircuitStateStore, CircuitStoreError,
    CircuitThresholds, InMemoryCircuitStore,
};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterQueue, InMemoryDeadLetterQueue};
pub use retry::{RetryPolicies, RetryPolicy};
