//! `keel-ledger` — the immutable double-entry ledger.
//!
//! Balanced transaction groups, the append-only ledger store, source
//! documents with typed extracted fields, and the FX resolver.

pub mod document;
pub mod entry;
pub mod fx;
pub mod store;
pub mod tenant;

pub use document::{
    Document, DocumentLockGuard, DocumentLocks, DocumentStore, DocumentStoreError,
    DocumentStatus, ExtractedFields, InMemoryDocumentStore,
};
pub use entry::{EntrySide, LedgerEntry, TransactionGroup, TransactionGroupBuilder};
pub use fx::{FixedRateSource, FxResolver, RateSource};
pub use store::{AccountBalance, InMemoryLedgerStore, LedgerStore, LedgerStoreError};
pub use tenant::{InMemoryTenantDirectory, TenantDirectory};
