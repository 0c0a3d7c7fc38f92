//! Periodic reconciliation of pending transactions
//!
//! A callback can be lost or never sent (user closed the payment page). Every
//! cycle asks the provider about pending transactions that are old enough to
//! no longer have a user on the payment page and applies the answer through
//! [`PaymentsService::reconcile`]. All transitions are conditional on the row
//! still being pending, so a transaction is settled at most once even when a
//! late callback races the worker.

use crate::database::transaction_repository::TransactionStore;
use crate::services::payments::{PaymentsService, ReconcileOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("database error: {0}")]
    Database(#[from] crate::database::error::DatabaseError),

    #[error("invalid reconciler configuration: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Only one replica should run the worker.
    pub enabled: bool,
    /// Run a single cycle and exit instead of looping.
    pub run_once: bool,
    pub poll_interval: Duration,
    /// Transactions younger than this are left alone.
    pub min_age: Duration,
    /// How far back (in hours) to look for pending transactions.
    pub window_hours: i64,
    pub batch_size: i64,
    /// Age after which a transaction the provider still reports as pending is canceled.
    pub pending_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_once: false,
            poll_interval: Duration::from_secs(60),
            min_age: Duration::from_secs(5 * 60),
            window_hours: 72,
            batch_size: 100,
            pending_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.enabled = std::env::var("RECONCILER_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(cfg.enabled);
        cfg.run_once = std::env::var("RECONCILER_RUN_ONCE")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(cfg.run_once);
        cfg.poll_interval = Duration::from_secs(
            std::env::var("RECONCILER_POLL_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.min_age = Duration::from_secs(
            std::env::var("RECONCILER_MIN_AGE_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.min_age.as_secs()),
        );
        cfg.window_hours = std::env::var("RECONCILER_WINDOW_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.window_hours);
        cfg.batch_size = std::env::var("RECONCILER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(cfg.batch_size);
        cfg.pending_timeout = Duration::from_secs(
            std::env::var("RECONCILER_PENDING_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.pending_timeout.as_secs()),
        );
        cfg
    }

    pub fn validate(&self) -> Result<(), ReconcilerError> {
        if self.poll_interval.is_zero() {
            return Err(ReconcilerError::Config(
                "RECONCILER_POLL_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(ReconcilerError::Config(
                "RECONCILER_BATCH_SIZE must be positive".to_string(),
            ));
        }
        if self.window_hours <= 0 {
            return Err(ReconcilerError::Config(
                "RECONCILER_WINDOW_HOURS must be positive".to_string(),
            ));
        }
        if self.pending_timeout < self.min_age {
            return Err(ReconcilerError::Config(
                "RECONCILER_PENDING_TIMEOUT_SECONDS must not be shorter than the minimum age"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Tally of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub examined: usize,
    pub completed: usize,
    pub canceled: usize,
    pub still_pending: usize,
    pub skipped: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct StatusReconcilerWorker {
    payments: Arc<PaymentsService>,
    store: Arc<dyn TransactionStore>,
    config: ReconcilerConfig,
}

impl StatusReconcilerWorker {
    pub fn new(payments: Arc<PaymentsService>, config: ReconcilerConfig) -> Self {
        let store = payments.store();
        Self {
            payments,
            store,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            min_age_secs = self.config.min_age.as_secs(),
            pending_timeout_secs = self.config.pending_timeout.as_secs(),
            window_hours = self.config.window_hours,
            batch_size = self.config.batch_size,
            "status reconciler worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("status reconciler worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "reconciliation cycle failed");
                    }
                }
            }
        }

        info!("status reconciler worker stopped");
    }

    /// One pass over the pending backlog. Per-transaction failures are
    /// logged and counted; only the initial query can fail the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, ReconcilerError> {
        let now = Utc::now();
        let created_before = now - to_chrono(self.config.min_age);
        let created_after = now - chrono::Duration::hours(self.config.window_hours);
        let pending_timeout = to_chrono(self.config.pending_timeout);

        let pending = self
            .store
            .find_pending(created_before, created_after, self.config.batch_size)
            .await?;

        let mut report = CycleReport {
            examined: pending.len(),
            ..CycleReport::default()
        };

        for tx in &pending {
            match self.payments.reconcile(tx, Some(pending_timeout)).await {
                Ok(ReconcileOutcome::Completed) => report.completed += 1,
                Ok(ReconcileOutcome::Canceled) => report.canceled += 1,
                Ok(ReconcileOutcome::StillPending) => report.still_pending += 1,
                Ok(ReconcileOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        invoice_id = tx.id,
                        provider = %tx.provider,
                        error = %e,
                        "failed to reconcile transaction"
                    );
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                completed = report.completed,
                canceled = report.canceled,
                still_pending = report.still_pending,
                skipped = report.skipped,
                failed = report.failed,
                "reconciliation cycle finished"
            );
        }
        Ok(report)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
