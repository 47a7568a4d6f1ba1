//! Bank-feed transactions.
//!
//! Rows are created by bank-feed ingestion; the matcher only ever flips the
//! `reconciled` flag on transactions it claims. `external_transaction_id`
//! is the feed's own identifier and is unique per account, so re-ingesting
//! a statement cannot create duplicate rows.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use keel_core::{BankAccountId, BankTransactionId, CurrencyCode, EngineError, TenantId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: BankTransactionId,
    pub tenant_id: TenantId,
    pub account_id: BankAccountId,
    /// Feed-assigned identifier, unique within the account.
    pub external_transaction_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub description: String,
    /// Explicit cross-reference (invoice number) when the feed supplies
    /// one; most feeds only carry it inside the description.
    pub reference: Option<String>,
    pub reconciled: bool,
}

impl BankTransaction {
    pub fn new(
        tenant_id: TenantId,
        account_id: BankAccountId,
        external_transaction_id: impl Into<String>,
        date: NaiveDate,
        amount: Decimal,
        currency: CurrencyCode,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: BankTransactionId::new(),
            tenant_id,
            account_id,
            external_transaction_id: external_transaction_id.into(),
            date,
            amount,
            currency,
            description: description.into(),
            reference: None,
            reconciled: false,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BankStoreError {
    #[error("bank transaction not found: {0}")]
    NotFound(BankTransactionId),
    #[error("external transaction id {external_id} already ingested for account {account_id}")]
    DuplicateExternalId {
        account_id: BankAccountId,
        external_id: String,
    },
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("bank storage failure: {0}")]
    Storage(String),
}

impl From<BankStoreError> for EngineError {
    fn from(err: BankStoreError) -> Self {
        match err {
            BankStoreError::NotFound(_) | BankStoreError::TenantIsolation => {
                EngineError::validation(err.to_string())
            }
            BankStoreError::DuplicateExternalId { .. } => EngineError::processing(err.to_string()),
            BankStoreError::Storage(_) => EngineError::infrastructure(err.to_string()),
        }
    }
}

pub trait BankStore: Send + Sync {
    fn insert(&self, transaction: BankTransaction) -> Result<(), BankStoreError>;

    /// Transactions dated within `[start, end]`, optionally restricted to
    /// one account, ordered by date then external id.
    fn transactions_in_period(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
        account_id: Option<BankAccountId>,
    ) -> Result<Vec<BankTransaction>, BankStoreError>;

    fn set_reconciled(
        &self,
        tenant_id: TenantId,
        transaction_id: BankTransactionId,
        reconciled: bool,
    ) -> Result<(), BankStoreError>;
}

impl<S> BankStore for Arc<S>
where
    S: BankStore + ?Sized,
{
    fn insert(&self, transaction: BankTransaction) -> Result<(), BankStoreError> {
        (**self).insert(transaction)
    }

    fn transactions_in_period(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
        account_id: Option<BankAccountId>,
    ) -> Result<Vec<BankTransaction>, BankStoreError> {
        (**self).transactions_in_period(tenant_id, start, end, account_id)
    }

    fn set_reconciled(
        &self,
        tenant_id: TenantId,
        transaction_id: BankTransactionId,
        reconciled: bool,
    ) -> Result<(), BankStoreError> {
        (**self).set_reconciled(tenant_id, transaction_id, reconciled)
    }
}

/// In-memory bank store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBankStore {
    transactions: RwLock<HashMap<BankTransactionId, BankTransaction>>,
}

impl InMemoryBankStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BankStore for InMemoryBankStore {
    fn insert(&self, transaction: BankTransaction) -> Result<(), BankStoreError> {
        let mut transactions = self
            .transactions
            .write()
            .map_err(|_| BankStoreError::Storage("lock poisoned".to_string()))?;
        let duplicate = transactions.values().any(|t| {
            t.account_id == transaction.account_id
                && t.external_transaction_id == transaction.external_transaction_id
        });
        if duplicate {
            return Err(BankStoreError::DuplicateExternalId {
                account_id: transaction.account_id,
                external_id: transaction.external_transaction_id,
            });
        }
        transactions.insert(transaction.id, transaction);
        Ok(())
    }

    fn transactions_in_period(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
        account_id: Option<BankAccountId>,
    ) -> Result<Vec<BankTransaction>, BankStoreError> {
        let transactions = self
            .transactions
            .read()
            .map_err(|_| BankStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = transactions
            .values()
            .filter(|t| {
                t.tenant_id == tenant_id
                    && t.date >= start
                    && t.date <= end
                    && account_id.is_none_or(|a| t.account_id == a)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.external_transaction_id.cmp(&b.external_transaction_id))
        });
        Ok(result)
    }

    fn set_reconciled(
        &self,
        tenant_id: TenantId,
        transaction_id: BankTransactionId,
        reconciled: bool,
    ) -> Result<(), BankStoreError> {
        let mut transactions = self
            .transactions
            .write()
            .map_err(|_| BankStoreError::Storage("lock poisoned".to_string()))?;
        let transaction = transactions
            .get_mut(&transaction_id)
            .ok_or(BankStoreError::NotFound(transaction_id))?;
        if transaction.tenant_id != tenant_id {
            return Err(BankStoreError::TenantIsolation);
        }
        transaction.reconciled = reconciled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn gbp() -> CurrencyCode {
        CurrencyCode::new("GBP").unwrap()
    }

    fn txn(tenant: TenantId, account: BankAccountId, external: &str, day: u32) -> BankTransaction {
        BankTransaction::new(
            tenant,
            account,
            external,
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            dec!(100.00),
            gbp(),
            "Payment",
        )
    }

    #[test]
    fn re_ingesting_the_same_external_id_is_rejected() {
        let store = InMemoryBankStore::new();
        let tenant = TenantId::new();
        let account = BankAccountId::new();

        store.insert(txn(tenant, account, "stmt-1", 5)).unwrap();
        let err = store.insert(txn(tenant, account, "stmt-1", 5)).unwrap_err();
        assert!(matches!(err, BankStoreError::DuplicateExternalId { .. }));

        // Same external id on a different account is a different feed.
        store
            .insert(txn(tenant, BankAccountId::new(), "stmt-1", 5))
            .unwrap();
    }

    #[test]
    fn period_queries_filter_by_date_account_and_tenant() {
        let store = InMemoryBankStore::new();
        let tenant = TenantId::new();
        let account = BankAccountId::new();
        store.insert(txn(tenant, account, "stmt-1", 5)).unwrap();
        store.insert(txn(tenant, account, "stmt-2", 20)).unwrap();
        store
            .insert(txn(tenant, BankAccountId::new(), "stmt-3", 5))
            .unwrap();
        store
            .insert(txn(TenantId::new(), account, "stmt-4", 5))
            .unwrap();

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mid = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();

        assert_eq!(
            store
                .transactions_in_period(tenant, start, end, None)
                .unwrap()
                .len(),
            3
        );
        assert_eq!(
            store
                .transactions_in_period(tenant, start, mid, Some(account))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn reconciled_flag_updates_respect_tenant_isolation() {
        let store = InMemoryBankStore::new();
        let tenant = TenantId::new();
        let account = BankAccountId::new();
        let t = txn(tenant, account, "stmt-1", 5);
        let id = t.id;
        store.insert(t).unwrap();

        assert!(matches!(
            store.set_reconciled(TenantId::new(), id, true),
            Err(BankStoreError::TenantIsolation)
        ));

        store.set_reconciled(tenant, id, true).unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let stored = store
            .transactions_in_period(tenant, start, end, None)
            .unwrap();
        assert!(stored[0].reconciled);
    }
}
