//! Ledger entries and balanced transaction groups.
//!
//! Entries are immutable once written; corrections are new offsetting
//! entries. A [`TransactionGroup`] is the unit of atomic posting: all legs
//! for one source document, with debit and credit totals equal in base
//! currency at the currency's precision.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use keel_core::{
    CurrencyCode, DocumentId, EngineError, EngineResult, EntryId, Money, TenantId, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySide {
    Debit,
    Credit,
}

/// One immutable leg of a posted transaction group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub tenant_id: TenantId,
    pub side: EntrySide,
    pub account_code: String,
    pub account_name: String,
    /// Positive amount in the tenant's base currency.
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub tax_amount: Option<Decimal>,
    pub description: String,
    pub transaction_date: NaiveDate,
    pub source_document_id: DocumentId,
    /// Cross-reference key (invoice number) used by reconciliation.
    pub reference: Option<String>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn money(&self) -> Money {
        Money::new(self.amount, self.currency.clone())
    }
}

/// A balanced, tenant-consistent set of entries for one source document.
///
/// Only constructible through [`TransactionGroupBuilder`], which enforces
/// the double-entry invariant before the group can reach a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionGroup {
    tenant_id: TenantId,
    source_document_id: DocumentId,
    entries: Vec<LedgerEntry>,
}

impl TransactionGroup {
    pub fn builder(
        tenant_id: TenantId,
        source_document_id: DocumentId,
        created_by: UserId,
        currency: CurrencyCode,
        transaction_date: NaiveDate,
    ) -> TransactionGroupBuilder {
        TransactionGroupBuilder {
            tenant_id,
            source_document_id,
            created_by,
            currency,
            transaction_date,
            reference: None,
            legs: Vec::new(),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn source_document_id(&self) -> DocumentId {
        self.source_document_id
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LedgerEntry> {
        self.entries
    }

    pub fn debit_total(&self) -> Decimal {
        self.side_total(EntrySide::Debit)
    }

    pub fn credit_total(&self) -> Decimal {
        self.side_total(EntrySide::Credit)
    }

    fn side_total(&self, side: EntrySide) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.side == side)
            .map(|e| e.amount)
            .sum()
    }
}

struct LegDraft {
    side: EntrySide,
    account_code: String,
    account_name: String,
    amount: Decimal,
    tax_amount: Option<Decimal>,
    description: String,
}

pub struct TransactionGroupBuilder {
    tenant_id: TenantId,
    source_document_id: DocumentId,
    created_by: UserId,
    currency: CurrencyCode,
    transaction_date: NaiveDate,
    reference: Option<String>,
    legs: Vec<LegDraft>,
}

impl TransactionGroupBuilder {
    pub fn reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn debit(
        self,
        account_code: impl Into<String>,
        account_name: impl Into<String>,
        amount: Decimal,
        tax_amount: Option<Decimal>,
        description: impl Into<String>,
    ) -> Self {
        self.leg(EntrySide::Debit, account_code, account_name, amount, tax_amount, description)
    }

    pub fn credit(
        self,
        account_code: impl Into<String>,
        account_name: impl Into<String>,
        amount: Decimal,
        tax_amount: Option<Decimal>,
        description: impl Into<String>,
    ) -> Self {
        self.leg(EntrySide::Credit, account_code, account_name, amount, tax_amount, description)
    }

    fn leg(
        mut self,
        side: EntrySide,
        account_code: impl Into<String>,
        account_name: impl Into<String>,
        amount: Decimal,
        tax_amount: Option<Decimal>,
        description: impl Into<String>,
    ) -> Self {
        self.legs.push(LegDraft {
            side,
            account_code: account_code.into(),
            account_name: account_name.into(),
            amount,
            tax_amount,
            description: description.into(),
        });
        self
    }

    /// Validate and seal the group.
    ///
    /// Amounts are rounded to the currency's precision before the balance
    /// check so the invariant holds exactly at that precision.
    pub fn build(self) -> EngineResult<TransactionGroup> {
        if self.legs.is_empty() {
            return Err(EngineError::validation("transaction group has no legs"));
        }

        let precision = self.currency.precision();
        let mut debit_total = Decimal::ZERO;
        let mut credit_total = Decimal::ZERO;
        let now = Utc::now();
        let mut entries = Vec::with_capacity(self.legs.len());

        for leg in &self.legs {
            let amount = Money::new(leg.amount, self.currency.clone()).rounded().amount;
            if amount <= Decimal::ZERO {
                return Err(EngineError::validation(format!(
                    "leg amount must be positive (account {}, amount {})",
                    leg.account_code, leg.amount
                )));
            }
            match leg.side {
                EntrySide::Debit => debit_total += amount,
                EntrySide::Credit => credit_total += amount,
            }
            entries.push(LedgerEntry {
                id: EntryId::new(),
                tenant_id: self.tenant_id,
                side: leg.side,
                account_code: leg.account_code.clone(),
                account_name: leg.account_name.clone(),
                amount,
                currency: self.currency.clone(),
                tax_amount: leg.tax_amount,
                description: leg.description.clone(),
                transaction_date: self.transaction_date,
                source_document_id: self.source_document_id,
                reference: self.reference.clone(),
                created_by: self.created_by,
                created_at: now,
            });
        }

        if !entries.iter().any(|e| e.side == EntrySide::Debit)
            || !entries.iter().any(|e| e.side == EntrySide::Credit)
        {
            return Err(EngineError::validation(
                "transaction group needs at least one debit and one credit leg",
            ));
        }

        if debit_total != credit_total {
            return Err(EngineError::validation(format!(
                "unbalanced transaction group: debits {debit_total} != credits {credit_total} \
                 (precision {precision})"
            )));
        }

        Ok(TransactionGroup {
            tenant_id: self.tenant_id,
            source_document_id: self.source_document_id,
            entries,
        })
    }
}
