use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use keel_core::{BankAccountId, CurrencyCode, DocumentId, TenantId, UserId};
use keel_ledger::{InMemoryLedgerStore, LedgerStore, TransactionGroup};
use keel_recon::{
    BankStore, BankTransaction, InMemoryBankStore, InMemoryMatchStore, MatcherConfig, Reconciler,
};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).expect("valid day")
}

/// A month of activity: `n` bank transactions against `n` candidate ledger
/// entries, a third of which only match fuzzily.
fn setup(n: usize) -> (Reconciler, TenantId, BankAccountId) {
    let tenant = TenantId::new();
    let account = BankAccountId::new();
    let actor = UserId::new();
    let gbp = CurrencyCode::new("GBP").expect("valid code");

    let bank = Arc::new(InMemoryBankStore::new());
    let ledger = Arc::new(InMemoryLedgerStore::new());

    for i in 0..n {
        let day = (i % 28) as u32 + 1;
        let amount = Decimal::new(1_000 + i as i64 * 137, 2);
        let vendor = format!("Vendor {:03}", i % 40);

        bank.insert(BankTransaction::new(
            tenant,
            account,
            format!("stmt-{i}"),
            date(day),
            amount,
            gbp.clone(),
            format!("Payment {vendor}"),
        ))
        .expect("insert bank txn");

        // Every third entry drifts by a day and a penny: fuzzy territory.
        let (entry_day, entry_amount) = if i % 3 == 0 {
            (day.min(27) + 1, amount + Decimal::new(1, 2))
        } else {
            (day, amount)
        };
        let group = TransactionGroup::builder(tenant, DocumentId::new(), actor, gbp.clone(), date(entry_day))
            .debit("6000", "General Expenses", entry_amount, None, "expense side")
            .credit("1100", "Bank", entry_amount, None, format!("Payment to {vendor}"))
            .build()
            .expect("balanced group");
        ledger.append_transaction(&group).expect("append group");
    }

    let reconciler = Reconciler::new(
        bank,
        ledger,
        Arc::new(InMemoryMatchStore::new()),
        MatcherConfig::default(),
    );
    (reconciler, tenant, account)
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile_period");
    for n in [50usize, 200, 500] {
        let (reconciler, tenant, account) = setup(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                let report = reconciler
                    .reconcile(tenant, date(1), date(28), Some(account))
                    .expect("reconcile");
                black_box(report.matched)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reconcile);
criterion_main!(benches);
