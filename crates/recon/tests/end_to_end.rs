//! Black-box run of the whole engine: documents in, posted ledger entries
//! out, then a reconciliation pass against the bank feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal_macros::dec;
use serde_json::json;

use keel_core::{BankAccountId, CurrencyCode, DocumentId, TenantId, UserId};
use keel_ledger::{
    Document, DocumentLocks, DocumentStore, ExtractedFields, FixedRateSource, FxResolver,
    InMemoryDocumentStore, InMemoryLedgerStore, InMemoryTenantDirectory, LedgerStore,
};
use keel_posting::{
    ConsumerConfig, InMemoryJobQueue, JobQueue, JobStatus, PostingConsumer, PostingJob,
    PostingWorker,
};
use keel_recon::{
    BankStore, BankTransaction, InMemoryBankStore, InMemoryMatchStore, MatchType, MatcherConfig,
    ReconciliationStatus, Reconciler,
};
use keel_resilience::{InMemoryDeadLetterQueue, RetryPolicies};

fn insert_document(
    documents: &InMemoryDocumentStore,
    tenant: TenantId,
    actor: UserId,
    filename: &str,
    payload: serde_json::Value,
) -> DocumentId {
    let fields = ExtractedFields::from_json(&payload).expect("valid payload");
    let doc = Document::new(tenant, actor, filename, 4096).with_extracted(fields);
    let id = doc.id;
    documents.insert(doc).expect("insert document");
    id
}

#[test]
fn documents_flow_through_posting_into_a_reconciled_period() {
    keel_observability::init();

    let tenant = TenantId::new();
    let actor = UserId::new();
    let account = BankAccountId::new();
    let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();

    let documents = Arc::new(InMemoryDocumentStore::new());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let tenants = Arc::new(InMemoryTenantDirectory::new());
    tenants.register(tenant, CurrencyCode::new("GBP").unwrap());

    let worker = Arc::new(PostingWorker::new(
        documents.clone(),
        ledger.clone(),
        tenants,
        FxResolver::new(Arc::new(FixedRateSource::new())),
        Arc::new(DocumentLocks::new()),
    ));
    let queue = Arc::new(InMemoryJobQueue::new());
    let consumer = PostingConsumer::new(
        queue.clone(),
        worker,
        documents.clone(),
        Arc::new(InMemoryDeadLetterQueue::new()),
        RetryPolicies::default(),
        ConsumerConfig {
            poll_interval: Duration::from_millis(5),
            tenant: Some(tenant),
        },
    );

    let invoice = insert_document(
        &documents,
        tenant,
        actor,
        "acme-jan.pdf",
        json!({
            "total": "1000.00",
            "currency": "GBP",
            "transaction_date": "2024-01-15",
            "vendor": "Acme Ltd",
            "invoice_number": "INV-1001",
        }),
    );
    let receipt = insert_document(
        &documents,
        tenant,
        actor,
        "globex.pdf",
        json!({
            "total": "55.00",
            "currency": "GBP",
            "transaction_date": "2024-01-15",
            "vendor": "Globex",
        }),
    );
    queue
        .enqueue(PostingJob::new(tenant, invoice, actor))
        .expect("enqueue");
    queue
        .enqueue(PostingJob::new(tenant, receipt, actor))
        .expect("enqueue");

    for _ in 0..2 {
        let status = consumer.run_once().expect("run job").expect("job due");
        assert!(matches!(status, JobStatus::Completed { .. }), "got {status:?}");
    }
    assert!(consumer.run_once().expect("poll").is_none());
    assert_eq!(ledger.entries_for_document(tenant, invoice).unwrap().len(), 2);

    let bank = Arc::new(InMemoryBankStore::new());
    let gbp = CurrencyCode::new("GBP").unwrap();
    bank.insert(BankTransaction::new(
        tenant,
        account,
        "stmt-1",
        date,
        dec!(1000.00),
        gbp.clone(),
        "BACS Acme INV-1001",
    ))
    .expect("insert bank txn");
    bank.insert(BankTransaction::new(
        tenant,
        account,
        "stmt-2",
        date,
        dec!(55.00),
        gbp,
        "Globex payment",
    ))
    .expect("insert bank txn");

    let reconciler = Reconciler::new(
        bank,
        ledger.clone(),
        Arc::new(InMemoryMatchStore::new()),
        MatcherConfig::default(),
    );
    let report = reconciler
        .reconcile(
            tenant,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            Some(account),
        )
        .expect("reconcile");

    assert_eq!(report.matched, 4);
    assert_eq!(report.unmatched, 0);
    assert_eq!(report.status, ReconciliationStatus::Reconciled);
    // The invoice settles on its cross-reference, the receipt on the
    // deterministic triple.
    let types: Vec<MatchType> = report.matches.iter().map(|m| m.match_type).collect();
    assert!(types.contains(&MatchType::Exact));
    assert!(types.contains(&MatchType::Near));

    // The book as a whole still balances.
    let total: rust_decimal::Decimal = ledger
        .trial_balance(tenant)
        .unwrap()
        .iter()
        .map(|b| b.balance)
        .sum();
    assert_eq!(total, rust_decimal::Decimal::ZERO);
}
