//! Append-only ledger storage.
//!
//! Entries are never updated or deleted. `append_transaction` is the only
//! write, and it lands all legs of a group in one atomic section.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use keel_core::{DocumentId, TenantId};

use crate::entry::{EntrySide, LedgerEntry, TransactionGroup};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerStoreError {
    /// A group for this document was already appended. Posting the same
    /// document twice must not produce a second entry set.
    #[error("ledger entries already exist for document {0}")]
    DocumentAlreadyPosted(DocumentId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("ledger storage failure: {0}")]
    Storage(String),
}

impl From<LedgerStoreError> for keel_core::EngineError {
    fn from(err: LedgerStoreError) -> Self {
        match err {
            // Callers that care distinguish this variant before converting.
            LedgerStoreError::DocumentAlreadyPosted(_) => {
                keel_core::EngineError::processing(err.to_string())
            }
            LedgerStoreError::TenantIsolation => keel_core::EngineError::validation(err.to_string()),
            LedgerStoreError::Storage(_) => keel_core::EngineError::infrastructure(err.to_string()),
        }
    }
}

/// Per-account debit-positive net balance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalance {
    pub account_code: String,
    pub account_name: String,
    pub balance: Decimal,
}

pub trait LedgerStore: Send + Sync {
    /// Append all legs of a balanced group atomically.
    ///
    /// Fails without writing anything if entries already exist for the
    /// group's source document.
    fn append_transaction(&self, group: &TransactionGroup) -> Result<(), LedgerStoreError>;

    /// All of a tenant's entries, oldest first.
    fn entries_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<LedgerEntry>, LedgerStoreError>;

    fn entries_for_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError>;

    fn entries_in_period(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError>;

    /// Debit-positive net balance per account code.
    fn trial_balance(&self, tenant_id: TenantId) -> Result<Vec<AccountBalance>, LedgerStoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn append_transaction(&self, group: &TransactionGroup) -> Result<(), LedgerStoreError> {
        (**self).append_transaction(group)
    }

    fn entries_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        (**self).entries_for_tenant(tenant_id)
    }

    fn entries_for_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        (**self).entries_for_document(tenant_id, document_id)
    }

    fn entries_in_period(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        (**self).entries_in_period(tenant_id, start, end)
    }

    fn trial_balance(&self, tenant_id: TenantId) -> Result<Vec<AccountBalance>, LedgerStoreError> {
        (**self).trial_balance(tenant_id)
    }
}

/// In-memory append-only store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append_transaction(&self, group: &TransactionGroup) -> Result<(), LedgerStoreError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;

        // Checked under the write lock: the append is all-or-nothing and a
        // concurrent duplicate cannot slip between check and insert.
        let document_id = group.source_document_id();
        if entries.iter().any(|e| {
            e.tenant_id == group.tenant_id() && e.source_document_id == document_id
        }) {
            return Err(LedgerStoreError::DocumentAlreadyPosted(document_id));
        }

        entries.extend(group.entries().iter().cloned());
        Ok(())
    }

    fn entries_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        result.sort_by_key(|e| e.created_at);
        Ok(result)
    }

    fn entries_for_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.source_document_id == document_id)
            .cloned()
            .collect())
    }

    fn entries_in_period(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(entries
            .iter()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.transaction_date >= start
                    && e.transaction_date <= end
            })
            .cloned()
            .collect())
    }

    fn trial_balance(&self, tenant_id: TenantId) -> Result<Vec<AccountBalance>, LedgerStoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;

        let mut accounts: BTreeMap<String, AccountBalance> = BTreeMap::new();
        for e in entries.iter().filter(|e| e.tenant_id == tenant_id) {
            let balance = accounts
                .entry(e.account_code.clone())
                .or_insert_with(|| AccountBalance {
                    account_code: e.account_code.clone(),
                    account_name: e.account_name.clone(),
                    balance: Decimal::ZERO,
                });
            match e.side {
                EntrySide::Debit => balance.balance += e.amount,
                EntrySide::Credit => balance.balance -= e.amount,
            }
        }
        Ok(accounts.into_values().collect())
    }
}
