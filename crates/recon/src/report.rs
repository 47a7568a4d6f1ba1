//! Reconciliation run output.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use keel_core::{BankAccountId, TenantId};

use crate::matcher::ReconciliationMatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// Every record found a partner and the balances agree.
    Reconciled,
    Unreconciled,
}

/// Aggregated result of one reconciliation run, plus its line items.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub tenant_id: TenantId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub account_id: Option<BankAccountId>,
    /// Sum of bank transaction amounts in the period.
    pub bank_balance: Decimal,
    /// Sum of the candidate ledger entry amounts in the period.
    pub ledger_balance: Decimal,
    pub difference: Decimal,
    /// Records that found a partner, counted on both sides: one matched
    /// pair contributes 2.
    pub matched: usize,
    /// Unmatched bank transactions plus unmatched ledger entries.
    pub unmatched: usize,
    pub status: ReconciliationStatus,
    pub matches: Vec<ReconciliationMatch>,
}

impl ReconciliationReport {
    pub(crate) fn status_for(unmatched: usize, difference: Decimal) -> ReconciliationStatus {
        if unmatched == 0 && difference == Decimal::ZERO {
            ReconciliationStatus::Reconciled
        } else {
            ReconciliationStatus::Unreconciled
        }
    }
}
