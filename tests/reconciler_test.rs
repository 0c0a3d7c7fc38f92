//! Status reconciler cycles over the in-memory store

mod support;

use matchpay::database::transaction::TransactionStatus;
use matchpay::payments::types::{PaymentState, ProviderName};
use matchpay::services::{Product, PurchaseRequest};
use matchpay::workers::status_reconciler::{ReconcilerConfig, StatusReconcilerWorker};
use std::sync::atomic::Ordering;
use std::time::Duration;
use support::*;
use tokio::sync::watch;

async fn pending_purchase(h: &Harness) -> i64 {
    h.payments
        .purchase(
            BUYER,
            PurchaseRequest {
                product: Product::ServicePackage {
                    package_id: SERVICE_PACKAGE,
                },
                banner_id: None,
                provider: None,
                customer_ip: None,
            },
        )
        .await
        .expect("purchase")
        .invoice_id
}

fn worker(h: &Harness) -> StatusReconcilerWorker {
    StatusReconcilerWorker::new(h.payments.clone(), ReconcilerConfig::default())
}

#[tokio::test]
async fn cycle_completes_confirmed_payments_once() {
    let h = Harness::new(ProviderName::Unitpay);
    let id = pending_purchase(&h).await;
    h.store.backdate(id, chrono::Duration::minutes(10));
    h.scripted.report(PaymentState::Success, Some("100.00"));

    let worker = worker(&h);
    let first = worker.run_cycle().await.expect("cycle runs");
    assert_eq!(first.examined, 1);
    assert_eq!(first.completed, 1);

    let second = worker.run_cycle().await.expect("cycle runs");
    assert_eq!(second.examined, 0);
    assert_eq!(h.store.get(id).status(), TransactionStatus::Succeeded);
    assert_eq!(h.store.fulfillments(), 1);
}

#[tokio::test]
async fn cycle_ignores_transactions_younger_than_min_age() {
    let h = Harness::new(ProviderName::Unitpay);
    pending_purchase(&h).await;
    h.scripted.report(PaymentState::Success, Some("100.00"));

    let report = worker(&h).run_cycle().await.expect("cycle runs");

    assert_eq!(report.examined, 0);
    assert_eq!(h.scripted.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cycle_cancels_failed_and_timed_out_transactions() {
    let h = Harness::new(ProviderName::Unitpay);
    let recent = pending_purchase(&h).await;
    let stale = pending_purchase(&h).await;
    h.store.backdate(recent, chrono::Duration::minutes(30));
    h.store.backdate(stale, chrono::Duration::hours(30));
    h.scripted.report(PaymentState::Pending, None);

    let report = worker(&h).run_cycle().await.expect("cycle runs");

    assert_eq!(report.examined, 2);
    assert_eq!(report.still_pending, 1);
    assert_eq!(report.canceled, 1);
    assert_eq!(h.store.get(recent).status(), TransactionStatus::Pending);
    assert_eq!(h.store.get(stale).status(), TransactionStatus::Canceled);

    h.scripted.report(PaymentState::Failed, None);
    let report = worker(&h).run_cycle().await.expect("cycle runs");
    assert_eq!(report.canceled, 1);
    assert_eq!(h.store.get(recent).status(), TransactionStatus::Canceled);
}

#[tokio::test]
async fn cycle_leaves_transactions_outside_the_window() {
    let h = Harness::new(ProviderName::Unitpay);
    let ancient = pending_purchase(&h).await;
    h.store.backdate(ancient, chrono::Duration::hours(100));

    let report = worker(&h).run_cycle().await.expect("cycle runs");

    assert_eq!(report.examined, 0);
    assert_eq!(h.store.get(ancient).status(), TransactionStatus::Pending);
}

#[tokio::test]
async fn worker_stops_on_shutdown_signal() {
    let h = Harness::new(ProviderName::Unitpay);
    let worker = StatusReconcilerWorker::new(
        h.payments.clone(),
        ReconcilerConfig {
            poll_interval: Duration::from_secs(3600),
            ..ReconcilerConfig::default()
        },
    );
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));

    tx.send(true).expect("worker is listening");
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker stops promptly")
        .expect("worker does not panic");
}
