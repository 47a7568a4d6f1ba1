//! Duplicate-document detection.
//!
//! Scores a candidate against the tenant's document history with a fixed,
//! deterministic weighting; consulted by the posting worker before any
//! ledger write. Exact filename matches and exact (total, date, vendor)
//! triples are surfaced regardless of the weighted score.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use keel_core::{DocumentId, EngineError, EngineResult, TenantId};
use keel_ledger::{Document, DocumentStatus, DocumentStore, ExtractedFields};

const WEIGHT_FILENAME: f64 = 0.2;
const WEIGHT_FIELDS: f64 = 0.5;
const WEIGHT_TEMPORAL: f64 = 0.2;
const WEIGHT_SIZE: f64 = 0.1;

/// Minimum weighted score for a candidate to be reported.
const REPORT_THRESHOLD: f64 = 0.7;
const EXACT_THRESHOLD: f64 = 0.95;
const NEAR_THRESHOLD: f64 = 0.85;

/// Tolerance when comparing extracted amounts.
fn amount_epsilon() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateClass {
    Exact,
    Near,
    Fuzzy,
}

/// Per-signal contribution, before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalScores {
    pub filename: f64,
    pub fields: f64,
    pub temporal: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateMatch {
    pub document_id: DocumentId,
    pub document_status: DocumentStatus,
    pub confidence: f64,
    pub class: DuplicateClass,
    pub signals: SignalScores,
    /// Identical filename, surfaced independently of the weighted score.
    pub exact_filename: bool,
    /// Identical (total, date, vendor) triple, surfaced independently.
    pub exact_triple: bool,
}

pub struct DuplicateDetector {
    docs: Arc<dyn DocumentStore>,
}

impl DuplicateDetector {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    /// Rank the tenant's other documents against `document_id`, descending
    /// by confidence.
    pub fn find_duplicates(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> EngineResult<Vec<DuplicateMatch>> {
        let target = self
            .docs
            .get(tenant_id, document_id)?
            .ok_or_else(|| EngineError::validation(format!("document not found: {document_id}")))?;

        let mut matches: Vec<DuplicateMatch> = self
            .docs
            .list(tenant_id)?
            .iter()
            .filter(|candidate| candidate.id != target.id)
            .filter_map(|candidate| score_pair(&target, candidate))
            .collect();

        matches.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.document_id.as_uuid().cmp(b.document_id.as_uuid()))
        });
        Ok(matches)
    }
}

/// Score one candidate; `None` when below threshold with no exact signal.
fn score_pair(target: &Document, candidate: &Document) -> Option<DuplicateMatch> {
    let signals = SignalScores {
        filename: filename_similarity(&target.filename, &candidate.filename),
        fields: field_agreement(target.extracted.as_ref(), candidate.extracted.as_ref()),
        temporal: temporal_proximity(target, candidate),
        size: size_proximity(target.file_size, candidate.file_size),
    };

    let confidence = WEIGHT_FILENAME * signals.filename
        + WEIGHT_FIELDS * signals.fields
        + WEIGHT_TEMPORAL * signals.temporal
        + WEIGHT_SIZE * signals.size;

    let exact_filename = !target.filename.is_empty()
        && target.filename.eq_ignore_ascii_case(&candidate.filename);
    let exact_triple = exact_amount_date_vendor(
        target.extracted.as_ref(),
        candidate.extracted.as_ref(),
    );

    if confidence <= REPORT_THRESHOLD && !exact_filename && !exact_triple {
        return None;
    }

    let class = if confidence > EXACT_THRESHOLD {
        DuplicateClass::Exact
    } else if confidence > NEAR_THRESHOLD {
        DuplicateClass::Near
    } else {
        DuplicateClass::Fuzzy
    };

    Some(DuplicateMatch {
        document_id: candidate.id,
        document_status: candidate.status,
        confidence,
        class,
        signals,
        exact_filename,
        exact_triple,
    })
}

/// Edit-distance similarity normalized by the longer name.
fn filename_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    let distance = strsim::levenshtein(&a, &b);
    1.0 - (distance as f64 / max_len as f64)
}

/// Fraction of {total, date, vendor, invoice_number} that agree.
fn field_agreement(a: Option<&ExtractedFields>, b: Option<&ExtractedFields>) -> f64 {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return 0.0,
    };

    let mut agreeing = 0u32;
    if (a.total - b.total).abs() <= amount_epsilon() {
        agreeing += 1;
    }
    if a.transaction_date == b.transaction_date {
        agreeing += 1;
    }
    if a.vendor.trim().eq_ignore_ascii_case(b.vendor.trim()) {
        agreeing += 1;
    }
    let invoices_agree = match (&a.invoice_number, &b.invoice_number) {
        (Some(x), Some(y)) => x.trim().eq_ignore_ascii_case(y.trim()),
        (None, None) => true,
        _ => false,
    };
    if invoices_agree {
        agreeing += 1;
    }
    f64::from(agreeing) / 4.0
}

/// Closeness of upload times.
fn temporal_proximity(a: &Document, b: &Document) -> f64 {
    let gap = (a.uploaded_at - b.uploaded_at).abs();
    if gap.is_zero() {
        1.0
    } else if gap <= chrono::Duration::days(1) {
        0.9
    } else if gap <= chrono::Duration::days(7) {
        0.7
    } else {
        0.3
    }
}

/// Closeness of file sizes, relative to the larger file.
fn size_proximity(a: u64, b: u64) -> f64 {
    if a == b {
        return 1.0;
    }
    let larger = a.max(b) as f64;
    let diff = a.abs_diff(b) as f64;
    if diff <= larger * 0.01 { 0.9 } else { 0.5 }
}

fn exact_amount_date_vendor(a: Option<&ExtractedFields>, b: Option<&ExtractedFields>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            a.total == b.total
                && a.transaction_date == b.transaction_date
                && a.vendor.trim().eq_ignore_ascii_case(b.vendor.trim())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use keel_core::{CurrencyCode, UserId};
    use keel_ledger::InMemoryDocumentStore;
    use rust_decimal_macros::dec;

    fn fields(total: Decimal, vendor: &str, invoice: Option<&str>) -> ExtractedFields {
        ExtractedFields {
            total,
            currency: CurrencyCode::new("GBP").unwrap(),
            transaction_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            vendor: vendor.to_string(),
            invoice_number: invoice.map(str::to_string),
            tax_amount: None,
            debit_account: None,
            credit_account: None,
        }
    }

    fn document(
        tenant: TenantId,
        filename: &str,
        size: u64,
        extracted: ExtractedFields,
    ) -> Document {
        Document::new(tenant, UserId::new(), filename, size).with_extracted(extracted)
    }

    fn detector_with(docs: Vec<Document>) -> (DuplicateDetector, Vec<DocumentId>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ids = docs.iter().map(|d| d.id).collect();
        for d in docs {
            store.insert(d).unwrap();
        }
        (DuplicateDetector::new(store), ids)
    }

    #[test]
    fn identical_documents_score_exact() {
        let tenant = TenantId::new();
        let a = document(tenant, "acme-jan.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let b = document(tenant, "acme-jan.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let (detector, ids) = detector_with(vec![a, b]);

        let matches = detector.find_duplicates(tenant, ids[0]).unwrap();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert!(m.confidence >= 0.95, "got {}", m.confidence);
        assert_eq!(m.class, DuplicateClass::Exact);
        assert!(m.exact_filename);
        assert!(m.exact_triple);
    }

    #[test]
    fn unrelated_documents_are_not_reported() {
        let tenant = TenantId::new();
        let a = document(tenant, "acme-jan.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let mut b = document(tenant, "globex-receipt.png", 90_000, fields(dec!(45.50), "Globex", Some("R-77")));
        b.extracted.as_mut().unwrap().transaction_date =
            NaiveDate::from_ymd_opt(2023, 6, 2).unwrap();
        b.uploaded_at -= chrono::Duration::days(30);
        let (detector, ids) = detector_with(vec![a, b]);

        assert!(detector.find_duplicates(tenant, ids[0]).unwrap().is_empty());
    }

    #[test]
    fn exact_triple_is_surfaced_even_below_the_weighted_threshold() {
        let tenant = TenantId::new();
        // Same amount/date/vendor but different filename, invoice number,
        // upload time and size: weighted score lands well below 0.7.
        let a = document(tenant, "acme-jan.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let mut b = document(tenant, "zz-0199.tiff", 900_000, fields(dec!(120.00), "Acme Ltd", Some("INV-2")));
        b.uploaded_at -= chrono::Duration::days(30);
        let (detector, ids) = detector_with(vec![a, b]);

        let matches = detector.find_duplicates(tenant, ids[0]).unwrap();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert!(m.confidence < REPORT_THRESHOLD, "got {}", m.confidence);
        assert!(m.exact_triple);
        assert_eq!(m.class, DuplicateClass::Fuzzy);
    }

    #[test]
    fn amounts_within_epsilon_count_as_agreeing_fields() {
        let a = fields(dec!(120.00), "Acme Ltd", Some("INV-1"));
        let b = fields(dec!(120.01), "acme ltd", Some("inv-1"));
        assert_eq!(field_agreement(Some(&a), Some(&b)), 1.0);

        let c = fields(dec!(120.02), "Acme Ltd", Some("INV-1"));
        assert_eq!(field_agreement(Some(&a), Some(&c)), 0.75);
    }

    #[test]
    fn filename_similarity_is_normalized_edit_distance() {
        assert_eq!(filename_similarity("invoice.pdf", "invoice.pdf"), 1.0);
        // One substitution over 11 characters.
        let sim = filename_similarity("invoice.pdf", "invoica.pdf");
        assert!((sim - (1.0 - 1.0 / 11.0)).abs() < 1e-9);
        assert_eq!(filename_similarity("", ""), 1.0);
    }

    #[test]
    fn size_proximity_bands() {
        assert_eq!(size_proximity(1000, 1000), 1.0);
        assert_eq!(size_proximity(1000, 995), 0.9);
        assert_eq!(size_proximity(1000, 500), 0.5);
    }

    #[test]
    fn matches_are_sorted_by_descending_confidence() {
        let tenant = TenantId::new();
        let a = document(tenant, "acme-jan.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let near = document(tenant, "acme-jan-copy.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let exact = document(tenant, "acme-jan.pdf", 4096, fields(dec!(120.00), "Acme Ltd", Some("INV-1")));
        let (detector, ids) = detector_with(vec![a, near, exact]);

        let matches = detector.find_duplicates(tenant, ids[0]).unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].confidence >= matches[1].confidence);
        assert_eq!(matches[0].document_id, ids[2]);
    }
}
