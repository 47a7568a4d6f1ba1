//! Source documents and their typed extracted fields.
//!
//! Upstream classification hands us loosely-typed JSON;
//! [`ExtractedFields::from_json`] is the single conversion point into the
//! typed schema, so malformed payloads surface as validation errors before
//! any posting transaction begins.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, RwLock};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use keel_core::{CurrencyCode, DocumentId, EngineError, EngineResult, TenantId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Posted,
    /// A high-confidence duplicate of an already-posted document; not an
    /// error.
    DuplicateSkipped,
    /// Validation-class failure parked for a human; never retried.
    ManualReview,
    Error,
}

impl DocumentStatus {
    /// Terminal states after which posting is a no-op.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Posted | DocumentStatus::DuplicateSkipped)
    }
}

/// Classification output, validated into the typed schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub total: Decimal,
    pub currency: CurrencyCode,
    pub transaction_date: NaiveDate,
    pub vendor: String,
    pub invoice_number: Option<String>,
    pub tax_amount: Option<Decimal>,
    /// Account hints from the classifier; posting falls back to defaults.
    pub debit_account: Option<String>,
    pub credit_account: Option<String>,
}

impl ExtractedFields {
    /// Parse and validate a raw classification payload.
    ///
    /// This is the only place raw JSON crosses into the domain; every
    /// failure here is `ErrorClass::Validation` and names the field.
    pub fn from_json(payload: &JsonValue) -> EngineResult<Self> {
        let obj = payload
            .as_object()
            .ok_or_else(|| EngineError::validation("extracted payload is not an object"))?;

        let total = required_decimal(obj, "total")?;
        if total <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "field 'total' must be positive, got {total}"
            )));
        }

        let currency = CurrencyCode::new(required_str(obj, "currency")?)?;
        let transaction_date = parse_date(required_str(obj, "transaction_date")?)?;

        let vendor = required_str(obj, "vendor")?.trim().to_string();
        if vendor.is_empty() {
            return Err(EngineError::validation("field 'vendor' is empty"));
        }

        let invoice_number = optional_str(obj, "invoice_number");
        let tax_amount = optional_decimal(obj, "tax_amount")?;
        if let Some(tax) = tax_amount {
            if tax < Decimal::ZERO || tax >= total {
                return Err(EngineError::validation(format!(
                    "field 'tax_amount' must be within [0, total), got {tax}"
                )));
            }
        }

        Ok(Self {
            total,
            currency,
            transaction_date,
            vendor,
            invoice_number,
            tax_amount,
            debit_account: optional_str(obj, "debit_account"),
            credit_account: optional_str(obj, "credit_account"),
        })
    }
}

fn required_str<'a>(
    obj: &'a serde_json::Map<String, JsonValue>,
    field: &str,
) -> EngineResult<&'a str> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::validation(format!("missing or non-string field '{field}'")))
}

fn optional_str(obj: &serde_json::Map<String, JsonValue>, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn required_decimal(obj: &serde_json::Map<String, JsonValue>, field: &str) -> EngineResult<Decimal> {
    match obj.get(field) {
        Some(v) => decimal_from_value(v, field),
        None => Err(EngineError::validation(format!("missing field '{field}'"))),
    }
}

fn optional_decimal(
    obj: &serde_json::Map<String, JsonValue>,
    field: &str,
) -> EngineResult<Option<Decimal>> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => decimal_from_value(v, field).map(Some),
    }
}

fn decimal_from_value(value: &JsonValue, field: &str) -> EngineResult<Decimal> {
    // Numbers go through their exact string form; floats never touch Decimal
    // construction directly.
    let text = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.trim().to_string(),
        _ => {
            return Err(EngineError::validation(format!(
                "field '{field}' must be a number or numeric string"
            )));
        }
    };
    text.parse::<Decimal>().map_err(|e| {
        EngineError::validation(format!("field '{field}' is not a valid amount: {e}"))
    })
}

fn parse_date(s: &str) -> EngineResult<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| {
        EngineError::validation(format!("field 'transaction_date' is not an ISO date: {e}"))
    })
}

/// A classified financial document owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub uploaded_by: UserId,
    pub filename: String,
    pub file_size: u64,
    pub status: DocumentStatus,
    pub extracted: Option<ExtractedFields>,
    pub error_message: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        tenant_id: TenantId,
        uploaded_by: UserId,
        filename: impl Into<String>,
        file_size: u64,
    ) -> Self {
        Self {
            id: DocumentId::new(),
            tenant_id,
            uploaded_by,
            filename: filename.into(),
            file_size,
            status: DocumentStatus::Uploaded,
            extracted: None,
            error_message: None,
            uploaded_at: Utc::now(),
        }
    }

    pub fn with_extracted(mut self, extracted: ExtractedFields) -> Self {
        self.extracted = Some(extracted);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentStoreError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("document already exists: {0}")]
    AlreadyExists(DocumentId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("document storage failure: {0}")]
    Storage(String),
}

impl From<DocumentStoreError> for EngineError {
    fn from(err: DocumentStoreError) -> Self {
        match err {
            // A job referencing a missing or foreign document cannot succeed
            // on retry.
            DocumentStoreError::NotFound(_) | DocumentStoreError::TenantIsolation => {
                EngineError::validation(err.to_string())
            }
            DocumentStoreError::AlreadyExists(_) => EngineError::processing(err.to_string()),
            DocumentStoreError::Storage(_) => EngineError::infrastructure(err.to_string()),
        }
    }
}

pub trait DocumentStore: Send + Sync {
    fn insert(&self, document: Document) -> Result<(), DocumentStoreError>;

    fn get(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>, DocumentStoreError>;

    fn list(&self, tenant_id: TenantId) -> Result<Vec<Document>, DocumentStoreError>;

    /// Update status and error message; returns the updated document.
    fn set_status(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Document, DocumentStoreError>;
}

impl<S> DocumentStore for std::sync::Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn insert(&self, document: Document) -> Result<(), DocumentStoreError> {
        (**self).insert(document)
    }

    fn get(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>, DocumentStoreError> {
        (**self).get(tenant_id, document_id)
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<Document>, DocumentStoreError> {
        (**self).list(tenant_id)
    }

    fn set_status(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Document, DocumentStoreError> {
        (**self).set_status(tenant_id, document_id, status, error_message)
    }
}

/// In-memory document store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn insert(&self, document: Document) -> Result<(), DocumentStoreError> {
        let mut docs = self
            .documents
            .write()
            .map_err(|_| DocumentStoreError::Storage("lock poisoned".to_string()))?;
        if docs.contains_key(&document.id) {
            return Err(DocumentStoreError::AlreadyExists(document.id));
        }
        docs.insert(document.id, document);
        Ok(())
    }

    fn get(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Option<Document>, DocumentStoreError> {
        let docs = self
            .documents
            .read()
            .map_err(|_| DocumentStoreError::Storage("lock poisoned".to_string()))?;
        match docs.get(&document_id) {
            Some(d) if d.tenant_id == tenant_id => Ok(Some(d.clone())),
            Some(_) => Err(DocumentStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<Document>, DocumentStoreError> {
        let docs = self
            .documents
            .read()
            .map_err(|_| DocumentStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<_> = docs
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        result.sort_by_key(|d| d.uploaded_at);
        Ok(result)
    }

    fn set_status(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Document, DocumentStoreError> {
        let mut docs = self
            .documents
            .write()
            .map_err(|_| DocumentStoreError::Storage("lock poisoned".to_string()))?;
        let doc = docs
            .get_mut(&document_id)
            .ok_or(DocumentStoreError::NotFound(document_id))?;
        if doc.tenant_id != tenant_id {
            return Err(DocumentStoreError::TenantIsolation);
        }
        doc.status = status;
        doc.error_message = error_message;
        Ok(doc.clone())
    }
}

/// Per-document exclusive locks — the posting idempotency boundary.
///
/// Two concurrent attempts to post the same document serialize here; the
/// second proceeds only after the first released the lock, then observes
/// its terminal status. A database-backed deployment replaces this with a
/// row lock (`SELECT ... FOR UPDATE`) on the document row.
#[derive(Debug, Default)]
pub struct DocumentLocks {
    held: Mutex<HashSet<DocumentId>>,
    released: Condvar,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the document lock is available, then hold it until the
    /// guard drops.
    pub fn acquire(&self, document_id: DocumentId) -> DocumentLockGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while held.contains(&document_id) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.insert(document_id);
        DocumentLockGuard {
            locks: self,
            document_id,
        }
    }
}

pub struct DocumentLockGuard<'a> {
    locks: &'a DocumentLocks,
    document_id: DocumentId,
}

impl Drop for DocumentLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.document_id);
        self.locks.released.notify_all();
    }
}
