//! `keel-recon` — bank reconciliation.
//!
//! Matches bank-feed transactions against ledger entries with graded
//! confidence and produces a per-period reconciliation report. Reads the
//! posting pipeline's output; never writes to the ledger.

pub mod bank;
pub mod matcher;
pub mod report;

pub use bank::{BankStore, BankStoreError, BankTransaction, InMemoryBankStore};
pub use matcher::{
    InMemoryMatchStore, MatchStatus, MatchStore, MatchStoreError, MatchType, MatcherConfig,
    ReconciliationMatch, Reconciler, RunKey,
};
pub use report::{ReconciliationReport, ReconciliationStatus};
