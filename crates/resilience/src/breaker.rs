//! Durable three-state circuit breaker.
//!
//! State is shared by all workers through a [`CircuitStateStore`] rather
//! than process memory, so one process never believes a dependency is
//! healthy while another has it open. Updates are read-modify-write with an
//! optimistic version check and a bounded conflict-retry loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use keel_core::{EngineError, EngineResult, ErrorClass};

/// Identifies the guarded dependency: one breaker per (service, endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CircuitKey {
    pub service: String,
    pub endpoint: String,
}

impl CircuitKey {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl core::fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.service, self.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitThresholds {
    /// Consecutive failures that trip `closed → open`.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that restore `closed`.
    pub success_threshold: u32,
    /// Time the circuit stays open before probing (`open → half_open`).
    pub reset_timeout: Duration,
}

impl Default for CircuitThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Durable breaker state for one dependency.
///
/// `version` is the optimistic-concurrency column: [`CircuitStateStore::save`]
/// rejects a write whose version does not match the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub key: CircuitKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub thresholds: CircuitThresholds,
    pub version: u64,
}

impl CircuitRecord {
    pub fn new(key: CircuitKey, thresholds: CircuitThresholds) -> Self {
        Self {
            key,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            thresholds,
            version: 0,
        }
    }

    /// Move `open → half_open` once the reset timeout has elapsed.
    fn refresh(&mut self, now: DateTime<Utc>) {
        if self.state != CircuitState::Open {
            return;
        }
        let elapsed = match self.opened_at {
            Some(opened) => now.signed_duration_since(opened),
            None => chrono::Duration::zero(),
        };
        let reset =
            chrono::Duration::from_std(self.thresholds.reset_timeout).unwrap_or_default();
        if elapsed >= reset {
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
        }
    }

    fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.thresholds.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, now: DateTime<Utc>) {
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.thresholds.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                // One failed probe sends the circuit straight back open.
                self.state = CircuitState::Open;
                self.success_count = 0;
                self.opened_at = Some(now);
            }
            CircuitState::Open => {}
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitStoreError {
    #[error("stale circuit record for {key} (expected version {expected}, found {found})")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("circuit store failure: {0}")]
    Storage(String),
}

/// Durable, tenant-agnostic storage for breaker state.
///
/// `save` must compare `record.version` against the stored version and fail
/// with [`CircuitStoreError::VersionConflict`] on mismatch; on success it
/// persists with the version incremented.
pub trait CircuitStateStore: Send + Sync {
    fn load(&self, key: &CircuitKey) -> Result<Option<CircuitRecord>, CircuitStoreError>;
    fn save(&self, record: &CircuitRecord) -> Result<CircuitRecord, CircuitStoreError>;
}

impl<S> CircuitStateStore for Arc<S>
where
    S: CircuitStateStore + ?Sized,
{
    fn load(&self, key: &CircuitKey) -> Result<Option<CircuitRecord>, CircuitStoreError> {
        (**self).load(key)
    }

    fn save(&self, record: &CircuitRecord) -> Result<CircuitRecord, CircuitStoreError> {
        (**self).save(record)
    }
}

/// In-memory circuit store for tests/dev; enforces the same version check a
/// database-backed implementation would.
#[derive(Debug, Default)]
pub struct InMemoryCircuitStore {
    records: RwLock<HashMap<CircuitKey, CircuitRecord>>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CircuitStateStore for InMemoryCircuitStore {
    fn load(&self, key: &CircuitKey) -> Result<Option<CircuitRecord>, CircuitStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| CircuitStoreError::Storage("lock poisoned".to_string()))?;
        Ok(records.get(key).cloned())
    }

    fn save(&self, record: &CircuitRecord) -> Result<CircuitRecord, CircuitStoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| CircuitStoreError::Storage("lock poisoned".to_string()))?;

        let current = records.get(&record.key).map(|r| r.version).unwrap_or(0);
        if current != record.version {
            return Err(CircuitStoreError::VersionConflict {
                key: record.key.to_string(),
                expected: record.version,
                found: current,
            });
        }

        let mut stored = record.clone();
        stored.version += 1;
        records.insert(stored.key.clone(), stored.clone());
        Ok(stored)
    }
}

/// Number of optimistic-concurrency retries before giving up on a state
/// update.
const CAS_ATTEMPTS: u32 = 3;

/// Three-state guard over a failing dependency.
pub struct CircuitBreaker {
    store: Arc<dyn CircuitStateStore>,
    thresholds: CircuitThresholds,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CircuitStateStore>, thresholds: CircuitThresholds) -> Self {
        Self { store, thresholds }
    }

    /// Run `op` under the breaker identified by `key`.
    ///
    /// While the circuit is open and the reset timeout has not elapsed, the
    /// call fails immediately with an integration-class error without
    /// invoking `op`. Validation failures returned by `op` pass through
    /// without counting against the dependency.
    pub fn call<T, F>(&self, key: &CircuitKey, op: F) -> EngineResult<T>
    where
        F: FnOnce() -> EngineResult<T>,
    {
        let now = Utc::now();
        let record = self
            .modify(key, |r| r.refresh(now))
            .map_err(|e| EngineError::infrastructure(e.to_string()))?;

        if record.state == CircuitState::Open {
            debug!(circuit = %key, "circuit open, failing fast");
            return Err(EngineError::integration(format!(
                "circuit open for {key}"
            )));
        }

        let result = op();

        let bookkeeping = match &result {
            Ok(_) => self.modify(key, |r| r.record_success()),
            Err(e) if e.class != ErrorClass::Validation => {
                self.modify(key, |r| r.record_failure(now))
            }
            Err(_) => Ok(record),
        };

        // A lost bookkeeping race must not override the operation's outcome.
        if let Err(e) = bookkeeping {
            warn!(circuit = %key, error = %e, "failed to persist circuit state");
        }

        result
    }

    /// Current state of the circuit (closed for unknown keys).
    pub fn state(&self, key: &CircuitKey) -> EngineResult<CircuitState> {
        let record = self
            .store
            .load(key)
            .map_err(|e| EngineError::infrastructure(e.to_string()))?;
        Ok(record.map(|r| r.state).unwrap_or(CircuitState::Closed))
    }

    fn modify<F>(&self, key: &CircuitKey, apply: F) -> Result<CircuitRecord, CircuitStoreError>
    where
        F: Fn(&mut CircuitRecord),
    {
        let mut last_conflict = None;
        for _ in 0..CAS_ATTEMPTS {
            let mut record = match self.store.load(key)? {
                Some(r) => r,
                None => CircuitRecord::new(key.clone(), self.thresholds.clone()),
            };
            apply(&mut record);
            match self.store.save(&record) {
                Ok(saved) => return Ok(saved),
                Err(e @ CircuitStoreError::VersionConflict { .. }) => {
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| CircuitStoreError::Storage("no attempts made".to_string())))
    }
}
