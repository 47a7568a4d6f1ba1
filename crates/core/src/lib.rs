//! `keel-core` — domain foundation for the posting & reconciliation engine.
//!
//! Pure domain primitives only: strongly-typed identifiers, the classified
//! engine error, and fixed-point money. No infrastructure concerns.

pub mod error;
pub mod id;
pub mod money;

pub use error::{EngineError, EngineResult, ErrorClass};
pub use id::{BankAccountId, BankTransactionId, DocumentId, EntryId, JobId, TenantId, UserId};
pub use money::{CurrencyCode, Money};
