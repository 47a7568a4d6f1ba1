//! Bank-to-ledger matching.
//!
//! Three rules in strict precedence: a shared reference key, the
//! deterministic (amount, date, description-token) triple, then graded
//! fuzzy matching inside configurable tolerances. Assignment is greedy by
//! descending confidence and one-to-one: no bank transaction or ledger
//! entry participates in more than one match per run. A run replaces any
//! prior run for the same period, so reconciliation is reproducible from
//! its inputs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tracing::info;

use keel_core::{
    BankAccountId, BankTransactionId, EngineError, EngineResult, EntryId, Money, TenantId,
};
use keel_ledger::{EntrySide, LedgerEntry, LedgerStore};

use crate::bank::{BankStore, BankTransaction};
use crate::report::ReconciliationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Near,
    Fuzzy,
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Unmatched,
}

/// One line item of a reconciliation run, keyed by bank transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationMatch {
    pub bank_transaction_id: BankTransactionId,
    pub ledger_entry_id: Option<EntryId>,
    pub match_type: MatchType,
    pub confidence: f64,
    pub status: MatchStatus,
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Fuzzy amount tolerance as a fraction of the larger amount.
    pub amount_tolerance_ratio: Decimal,
    /// Fuzzy date window in days on either side.
    pub date_window_days: i64,
    /// Minimum normalized description similarity for a fuzzy match.
    pub description_similarity_threshold: f64,
    /// Which ledger side represents the bank account movement.
    pub ledger_side: EntrySide,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_ratio: Decimal::new(5, 3), // 0.5%
            date_window_days: 3,
            description_similarity_threshold: 0.6,
            ledger_side: EntrySide::Credit,
        }
    }
}

/// Identifies one reconciliation run's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub tenant_id: TenantId,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub account_id: Option<BankAccountId>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MatchStoreError {
    #[error("match storage failure: {0}")]
    Storage(String),
}

impl From<MatchStoreError> for EngineError {
    fn from(err: MatchStoreError) -> Self {
        EngineError::infrastructure(err.to_string())
    }
}

/// Storage for run results. `replace_run` overwrites any prior run for the
/// same key; runs never accumulate.
pub trait MatchStore: Send + Sync {
    fn replace_run(
        &self,
        key: RunKey,
        matches: Vec<ReconciliationMatch>,
    ) -> Result<(), MatchStoreError>;

    fn get_run(&self, key: &RunKey) -> Result<Option<Vec<ReconciliationMatch>>, MatchStoreError>;
}

impl<S> MatchStore for Arc<S>
where
    S: MatchStore + ?Sized,
{
    fn replace_run(
        &self,
        key: RunKey,
        matches: Vec<ReconciliationMatch>,
    ) -> Result<(), MatchStoreError> {
        (**self).replace_run(key, matches)
    }

    fn get_run(&self, key: &RunKey) -> Result<Option<Vec<ReconciliationMatch>>, MatchStoreError> {
        (**self).get_run(key)
    }
}

/// In-memory match store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryMatchStore {
    runs: RwLock<HashMap<RunKey, Vec<ReconciliationMatch>>>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchStore for InMemoryMatchStore {
    fn replace_run(
        &self,
        key: RunKey,
        matches: Vec<ReconciliationMatch>,
    ) -> Result<(), MatchStoreError> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| MatchStoreError::Storage("lock poisoned".to_string()))?;
        runs.insert(key, matches);
        Ok(())
    }

    fn get_run(&self, key: &RunKey) -> Result<Option<Vec<ReconciliationMatch>>, MatchStoreError> {
        let runs = self
            .runs
            .read()
            .map_err(|_| MatchStoreError::Storage("lock poisoned".to_string()))?;
        Ok(runs.get(key).cloned())
    }
}

struct Candidate {
    bank_idx: usize,
    entry_idx: usize,
    match_type: MatchType,
    confidence: f64,
}

/// Matches bank transactions against ledger entries for a period.
///
/// Concurrent runs for the same tenant and period are not supported; the
/// caller serializes them.
pub struct Reconciler {
    bank: Arc<dyn BankStore>,
    ledger: Arc<dyn LedgerStore>,
    matches: Arc<dyn MatchStore>,
    config: MatcherConfig,
}

impl Reconciler {
    pub fn new(
        bank: Arc<dyn BankStore>,
        ledger: Arc<dyn LedgerStore>,
        matches: Arc<dyn MatchStore>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            bank,
            ledger,
            matches,
            config,
        }
    }

    pub fn reconcile(
        &self,
        tenant_id: TenantId,
        period_start: NaiveDate,
        period_end: NaiveDate,
        account_id: Option<BankAccountId>,
    ) -> EngineResult<ReconciliationReport> {
        if period_start > period_end {
            return Err(EngineError::validation(format!(
                "period start {period_start} is after period end {period_end}"
            )));
        }

        let transactions =
            self.bank
                .transactions_in_period(tenant_id, period_start, period_end, account_id)?;
        let entries: Vec<LedgerEntry> = self
            .ledger
            .entries_in_period(tenant_id, period_start, period_end)?
            .into_iter()
            .filter(|e| e.side == self.config.ledger_side)
            .collect();

        let mut candidates = Vec::new();
        for (bank_idx, txn) in transactions.iter().enumerate() {
            for (entry_idx, entry) in entries.iter().enumerate() {
                if let Some((match_type, confidence)) = self.score_pair(txn, entry) {
                    candidates.push(Candidate {
                        bank_idx,
                        entry_idx,
                        match_type,
                        confidence,
                    });
                }
            }
        }
        // Highest confidence claims first; id tiebreaks keep reruns
        // deterministic.
        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| {
                    transactions[a.bank_idx]
                        .id
                        .as_uuid()
                        .cmp(transactions[b.bank_idx].id.as_uuid())
                })
                .then_with(|| {
                    entries[a.entry_idx]
                        .id
                        .as_uuid()
                        .cmp(entries[b.entry_idx].id.as_uuid())
                })
        });

        let mut assigned: HashMap<usize, (usize, MatchType, f64)> = HashMap::new();
        let mut claimed_entries: HashSet<usize> = HashSet::new();
        for c in candidates {
            if assigned.contains_key(&c.bank_idx) || claimed_entries.contains(&c.entry_idx) {
                continue;
            }
            claimed_entries.insert(c.entry_idx);
            assigned.insert(c.bank_idx, (c.entry_idx, c.match_type, c.confidence));
        }

        let matches: Vec<ReconciliationMatch> = transactions
            .iter()
            .enumerate()
            .map(|(bank_idx, txn)| match assigned.get(&bank_idx) {
                Some((entry_idx, match_type, confidence)) => ReconciliationMatch {
                    bank_transaction_id: txn.id,
                    ledger_entry_id: Some(entries[*entry_idx].id),
                    match_type: *match_type,
                    confidence: *confidence,
                    status: MatchStatus::Matched,
                },
                None => ReconciliationMatch {
                    bank_transaction_id: txn.id,
                    ledger_entry_id: None,
                    match_type: MatchType::Unmatched,
                    confidence: 0.0,
                    status: MatchStatus::Unmatched,
                },
            })
            .collect();

        for m in &matches {
            self.bank
                .set_reconciled(tenant_id, m.bank_transaction_id, m.ledger_entry_id.is_some())?;
        }

        let key = RunKey {
            tenant_id,
            period_start,
            period_end,
            account_id,
        };
        self.matches.replace_run(key, matches.clone())?;

        let pairs = assigned.len();
        let unmatched_bank = transactions.len() - pairs;
        let unmatched_ledger = entries.len() - pairs;
        let unmatched = unmatched_bank + unmatched_ledger;
        let bank_balance: Decimal = transactions.iter().map(|t| t.amount).sum();
        let ledger_balance: Decimal = entries.iter().map(|e| e.amount).sum();
        let difference = bank_balance - ledger_balance;

        info!(
            %tenant_id,
            %period_start,
            %period_end,
            pairs,
            unmatched_bank,
            unmatched_ledger,
            %difference,
            "reconciliation run complete"
        );

        Ok(ReconciliationReport {
            tenant_id,
            period_start,
            period_end,
            account_id,
            bank_balance,
            ledger_balance,
            difference,
            matched: pairs * 2,
            unmatched,
            status: ReconciliationReport::status_for(unmatched, difference),
            matches,
        })
    }

    /// Best rule the pair satisfies, or `None` when nothing applies.
    fn score_pair(&self, txn: &BankTransaction, entry: &LedgerEntry) -> Option<(MatchType, f64)> {
        let amounts_equal = amounts_equal_at_precision(txn, entry);
        let dates_equal = txn.date == entry.transaction_date;

        if reference_key_match(txn, entry)
            || (amounts_equal && dates_equal && descriptions_equal(txn, entry))
        {
            return Some((MatchType::Exact, 1.0));
        }

        if amounts_equal && dates_equal && shares_description_token(txn, entry) {
            return Some((MatchType::Near, 0.9));
        }

        self.fuzzy_confidence(txn, entry)
            .map(|confidence| (MatchType::Fuzzy, confidence))
    }

    /// Confidence in [0.6, 0.9], scaled by how close the pair is to exact
    /// on each axis.
    fn fuzzy_confidence(&self, txn: &BankTransaction, entry: &LedgerEntry) -> Option<f64> {
        let tolerance =
            txn.amount.abs().max(entry.amount.abs()) * self.config.amount_tolerance_ratio;
        let amount_diff = (txn.amount - entry.amount).abs();
        if amount_diff > tolerance {
            return None;
        }

        let day_gap = (txn.date - entry.transaction_date).num_days().abs();
        if day_gap > self.config.date_window_days {
            return None;
        }

        let similarity = strsim::normalized_levenshtein(
            &txn.description.to_lowercase(),
            &entry.description.to_lowercase(),
        );
        let threshold = self.config.description_similarity_threshold;
        if similarity < threshold {
            return None;
        }

        let amount_closeness = if tolerance.is_zero() {
            1.0
        } else {
            1.0 - (amount_diff / tolerance).to_f64().unwrap_or(1.0)
        };
        let date_closeness = if self.config.date_window_days == 0 {
            1.0
        } else {
            1.0 - day_gap as f64 / self.config.date_window_days as f64
        };
        let description_closeness = if threshold >= 1.0 {
            1.0
        } else {
            (similarity - threshold) / (1.0 - threshold)
        };

        let closeness = (amount_closeness + date_closeness + description_closeness) / 3.0;
        Some(0.6 + 0.3 * closeness.clamp(0.0, 1.0))
    }
}

fn amounts_equal_at_precision(txn: &BankTransaction, entry: &LedgerEntry) -> bool {
    txn.currency == entry.currency
        && Money::new(txn.amount, txn.currency.clone()).rounded().amount
            == Money::new(entry.amount, entry.currency.clone()).rounded().amount
}

/// The two records share a cross-reference key: the feed's explicit
/// reference equals the entry's, or the entry's key (invoice number)
/// appears in the bank description or external id.
fn reference_key_match(txn: &BankTransaction, entry: &LedgerEntry) -> bool {
    let Some(reference) = entry.reference.as_deref().map(str::trim).filter(|r| !r.is_empty())
    else {
        return false;
    };
    if txn
        .reference
        .as_deref()
        .map(str::trim)
        .is_some_and(|r| r.eq_ignore_ascii_case(reference))
    {
        return true;
    }
    let reference_lower = reference.to_lowercase();
    txn.description.to_lowercase().contains(&reference_lower)
        || txn.external_transaction_id.to_lowercase() == reference_lower
}

fn descriptions_equal(txn: &BankTransaction, entry: &LedgerEntry) -> bool {
    txn.description.trim().to_lowercase() == entry.description.trim().to_lowercase()
}

fn shares_description_token(txn: &BankTransaction, entry: &LedgerEntry) -> bool {
    let bank_tokens = tokens(&txn.description);
    !bank_tokens.is_empty() && tokens(&entry.description).intersection(&bank_tokens).count() > 0
}

/// Counterparty-ish tokens: lowercase alphanumeric runs of 3+ chars.
fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::InMemoryBankStore;
    use crate::report::ReconciliationStatus;
    use keel_core::{CurrencyCode, DocumentId, UserId};
    use keel_ledger::{InMemoryLedgerStore, TransactionGroup};
    use rust_decimal_macros::dec;

    struct Harness {
        tenant: TenantId,
        account: BankAccountId,
        bank: Arc<InMemoryBankStore>,
        ledger: Arc<InMemoryLedgerStore>,
        matches: Arc<InMemoryMatchStore>,
        reconciler: Reconciler,
        next_external: std::cell::Cell<u32>,
    }

    impl Harness {
        fn new() -> Self {
            let bank = Arc::new(InMemoryBankStore::new());
            let ledger = Arc::new(InMemoryLedgerStore::new());
            let matches = Arc::new(InMemoryMatchStore::new());
            let reconciler = Reconciler::new(
                bank.clone(),
                ledger.clone(),
                matches.clone(),
                MatcherConfig::default(),
            );
            Self {
                tenant: TenantId::new(),
                account: BankAccountId::new(),
                bank,
                ledger,
                matches,
                reconciler,
                next_external: std::cell::Cell::new(0),
            }
        }

        fn bank_txn(&self, amount: Decimal, date: NaiveDate, description: &str) -> BankTransactionId {
            let n = self.next_external.get();
            self.next_external.set(n + 1);
            let txn = BankTransaction::new(
                self.tenant,
                self.account,
                format!("stmt-{n}"),
                date,
                amount,
                CurrencyCode::new("GBP").unwrap(),
                description,
            );
            let id = txn.id;
            self.bank.insert(txn).unwrap();
            id
        }

        /// Posts a balanced group and returns the id of its bank-side
        /// (credit) leg.
        fn ledger_entry(
            &self,
            amount: Decimal,
            date: NaiveDate,
            description: &str,
            reference: Option<&str>,
        ) -> EntryId {
            let group = TransactionGroup::builder(
                self.tenant,
                DocumentId::new(),
                UserId::new(),
                CurrencyCode::new("GBP").unwrap(),
                date,
            )
            .reference(reference.map(str::to_string))
            .debit("6000", "General Expenses", amount, None, "expense side")
            .credit("1100", "Bank", amount, None, description)
            .build()
            .unwrap();
            let id = group
                .entries()
                .iter()
                .find(|e| e.side == EntrySide::Credit)
                .unwrap()
                .id;
            self.ledger.append_transaction(&group).unwrap();
            id
        }

        fn run(&self) -> ReconciliationReport {
            self.reconciler
                .reconcile(self.tenant, start(), end(), Some(self.account))
                .unwrap()
        }
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn end() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
    }

    fn mid() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn identical_amount_date_and_description_reconcile_exactly() {
        let h = Harness::new();
        let txn = h.bank_txn(dec!(1000.00), mid(), "Invoice Payment");
        let entry = h.ledger_entry(dec!(1000.00), mid(), "Invoice Payment", None);

        let report = h.run();

        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 0);
        assert_eq!(report.difference, Decimal::ZERO);
        assert_eq!(report.status, ReconciliationStatus::Reconciled);

        assert_eq!(report.matches.len(), 1);
        let m = &report.matches[0];
        assert_eq!(m.bank_transaction_id, txn);
        assert_eq!(m.ledger_entry_id, Some(entry));
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.confidence, 1.0);
        assert_eq!(m.status, MatchStatus::Matched);

        let reconciled = h
            .bank
            .transactions_in_period(h.tenant, start(), end(), None)
            .unwrap();
        assert!(reconciled[0].reconciled);
    }

    #[test]
    fn tolerant_amount_date_and_description_reconcile_fuzzily() {
        let h = Harness::new();
        h.bank_txn(
            dec!(1000.02),
            NaiveDate::from_ymd_opt(2024, 1, 16).unwrap(),
            "Payment Acme Ltd",
        );
        h.ledger_entry(dec!(1000.00), mid(), "Payment to Acme Ltd", None);

        let report = h.run();

        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 0);
        let m = &report.matches[0];
        assert_eq!(m.match_type, MatchType::Fuzzy);
        assert!(m.confidence >= 0.6 && m.confidence < 0.95, "got {}", m.confidence);
        // Balances still disagree by the amount delta.
        assert_eq!(report.difference, dec!(0.02));
        assert_eq!(report.status, ReconciliationStatus::Unreconciled);
    }

    #[test]
    fn reference_key_matches_outrank_triple_matches() {
        let h = Harness::new();
        h.bank_txn(dec!(500.00), mid(), "BACS INV-7 Acme");
        let referenced = h.ledger_entry(dec!(500.00), mid(), "Acme payment", Some("INV-7"));
        h.ledger_entry(dec!(500.00), mid(), "BACS Acme", None);

        let report = h.run();

        let m = &report.matches[0];
        assert_eq!(m.ledger_entry_id, Some(referenced));
        assert_eq!(m.match_type, MatchType::Exact);
        // The decoy entry stays unmatched.
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 1);
    }

    #[test]
    fn an_explicit_feed_reference_matches_without_description_overlap() {
        let h = Harness::new();
        let txn = BankTransaction::new(
            h.tenant,
            h.account,
            "stmt-ref",
            mid(),
            dec!(499.00),
            CurrencyCode::new("GBP").unwrap(),
            "Incoming transfer",
        )
        .with_reference("INV-9");
        h.bank.insert(txn).unwrap();
        let entry = h.ledger_entry(dec!(500.00), mid(), "Acme payment", Some("INV-9"));

        let report = h.run();

        let m = &report.matches[0];
        assert_eq!(m.ledger_entry_id, Some(entry));
        assert_eq!(m.match_type, MatchType::Exact);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn each_record_participates_in_at_most_one_match() {
        let h = Harness::new();
        h.bank_txn(dec!(75.00), mid(), "Globex subscription");
        h.bank_txn(dec!(75.00), mid(), "Globex subscription");
        h.ledger_entry(dec!(75.00), mid(), "Globex subscription", None);
        h.ledger_entry(dec!(75.00), mid(), "Globex subscription", None);

        let report = h.run();

        assert_eq!(report.matched, 4);
        assert_eq!(report.unmatched, 0);
        let claimed: HashSet<_> = report
            .matches
            .iter()
            .filter_map(|m| m.ledger_entry_id)
            .collect();
        assert_eq!(claimed.len(), 2);
    }

    #[test]
    fn unmatched_counts_both_sides_directly() {
        let h = Harness::new();
        h.bank_txn(dec!(100.00), mid(), "Invoice Payment");
        h.bank_txn(dec!(9999.00), mid(), "Unknown counterparty");
        h.ledger_entry(dec!(100.00), mid(), "Invoice Payment", None);
        h.ledger_entry(dec!(42.00), mid(), "Petty cash top-up", None);

        let report = h.run();

        // One matched pair, one stray bank transaction, one stray entry.
        assert_eq!(report.matched, 2);
        assert_eq!(report.unmatched, 2);
        assert_eq!(report.status, ReconciliationStatus::Unreconciled);

        let stray = report
            .matches
            .iter()
            .find(|m| m.ledger_entry_id.is_none())
            .unwrap();
        assert_eq!(stray.match_type, MatchType::Unmatched);
        assert_eq!(stray.confidence, 0.0);
        assert_eq!(stray.status, MatchStatus::Unmatched);
    }

    #[test]
    fn reruns_are_idempotent_and_replace_the_stored_run() {
        let h = Harness::new();
        h.bank_txn(dec!(1000.00), mid(), "Invoice Payment");
        h.bank_txn(dec!(55.00), mid(), "Card fee");
        h.ledger_entry(dec!(1000.00), mid(), "Invoice Payment", None);

        let first = h.run();
        let second = h.run();

        assert_eq!(first.matches, second.matches);
        assert_eq!(first.matched, second.matched);
        assert_eq!(first.unmatched, second.unmatched);

        let key = RunKey {
            tenant_id: h.tenant,
            period_start: start(),
            period_end: end(),
            account_id: Some(h.account),
        };
        let stored = h.matches.get_run(&key).unwrap().unwrap();
        assert_eq!(stored, second.matches);
    }

    #[test]
    fn an_inverted_period_is_a_validation_error() {
        let h = Harness::new();
        let err = h
            .reconciler
            .reconcile(h.tenant, end(), start(), None)
            .unwrap_err();
        assert_eq!(err.class, keel_core::ErrorClass::Validation);
    }
}
