//! Payment orchestration
//!
//! [`PaymentsService`] ties pricing, persistence and provider drivers together:
//! it creates the pending transaction before any provider call, drives the
//! provider, and applies verified callbacks and reconciliation results through
//! the store's conditional `pending -> terminal` transitions.

use crate::database::error::DatabaseError;
use crate::database::transaction::{
    NewTransaction, Transaction, TransactionStatus, TransitionOutcome,
};
use crate::database::transaction_repository::TransactionStore;
use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::types::{
    CallbackEvent, CallbackOutcome, CallbackParams, CallbackReply, Money, PaymentRequest,
    PaymentResponse, PaymentState, ProviderName, RecurringRequest, StatusRequest,
};
use crate::payments::{PaymentError, PaymentProvider, PaymentProviderFactory};
use crate::services::pricing::{PricingError, PricingService, Product, Quote};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PaymentsError {
    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("transaction {0} not found")]
    TransactionNotFound(i64),

    #[error("payment provider '{0}' is not available")]
    ProviderNotFound(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },
}

impl From<PaymentsError> for AppError {
    fn from(err: PaymentsError) -> Self {
        match err {
            PaymentsError::Pricing(e) => e.into(),
            PaymentsError::Payment(e) => e.into(),
            PaymentsError::Database(e) => e.into(),
            PaymentsError::TransactionNotFound(invoice_id) => AppError::new(AppErrorKind::Domain(
                DomainError::TransactionNotFound { invoice_id },
            )),
            PaymentsError::ProviderNotFound(provider) => AppError::new(AppErrorKind::Domain(
                DomainError::ProviderNotFound { provider },
            )),
            PaymentsError::Validation { field, reason } => AppError::validation(field, reason),
        }
    }
}

pub type PaymentsResult<T> = Result<T, PaymentsError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub product: Product,
    pub banner_id: Option<i64>,
    /// Explicit provider name; the registry default is used when absent.
    pub provider: Option<String>,
    pub customer_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PurchaseReceipt {
    pub invoice_id: i64,
    pub payment_id: Option<String>,
    pub confirmation_url: Option<String>,
    pub provider: ProviderName,
    pub amount: String,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Owner-facing view of a transaction
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransactionView {
    pub invoice_id: i64,
    pub status: TransactionStatus,
    pub product_type: String,
    pub product_id: i64,
    pub recipient_id: Option<i64>,
    pub amount: String,
    pub currency: String,
    pub provider: String,
    pub payment_id: Option<String>,
    pub recurring: bool,
    pub created_at: DateTime<Utc>,
    pub purchased_at: Option<DateTime<Utc>>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            invoice_id: tx.id,
            status: tx.status(),
            product_type: tx.product_type.clone(),
            product_id: tx.product_id,
            recipient_id: tx.recipient_id,
            amount: Money::from_decimal(&tx.price, tx.currency.clone()).amount,
            currency: tx.currency.clone(),
            provider: tx.provider.clone(),
            payment_id: tx.payment_id.clone(),
            recurring: tx.recurring,
            created_at: tx.created_at,
            purchased_at: tx.purchased_at,
        }
    }
}

/// Result of a user returning from the provider's payment page
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PageResult {
    pub invoice_id: i64,
    pub status: TransactionStatus,
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Provider confirmed the payment and the transaction succeeded.
    Completed,
    /// Provider reported a failure, or the pending timeout elapsed.
    Canceled,
    StillPending,
    /// Transaction was already terminal or needs manual review.
    Skipped,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct PaymentsService {
    store: Arc<dyn TransactionStore>,
    pricing: Arc<PricingService>,
    providers: Arc<PaymentProviderFactory>,
    currency: String,
}

impl PaymentsService {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        pricing: Arc<PricingService>,
        providers: Arc<PaymentProviderFactory>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pricing,
            providers,
            currency: currency.into(),
        }
    }

    pub fn providers(&self) -> &PaymentProviderFactory {
        &self.providers
    }

    pub fn store(&self) -> Arc<dyn TransactionStore> {
        Arc::clone(&self.store)
    }

    /// Prices the product, persists a pending transaction, then asks the
    /// provider for a confirmation URL (or charges the recurring agreement).
    pub async fn purchase(
        &self,
        user_id: i64,
        request: PurchaseRequest,
    ) -> PaymentsResult<PurchaseReceipt> {
        if let Product::Gift { recipient_id, .. } = request.product {
            if recipient_id == user_id {
                return Err(PaymentsError::Validation {
                    field: "recipient_id".to_string(),
                    reason: "cannot send a gift to yourself".to_string(),
                });
            }
        }

        let provider = self.providers.resolve(request.provider.as_deref())?;
        let quote = self
            .pricing
            .quote(user_id, &request.product, request.banner_id)
            .await?;

        let parent = if request.product.is_recurring() {
            self.store
                .find_recurring_parent(
                    user_id,
                    request.product.product_id(),
                    provider.name().as_str(),
                )
                .await?
        } else {
            None
        };

        let transaction = self
            .store
            .create(NewTransaction {
                user_id,
                product_type: request.product.product_type(),
                product_id: request.product.product_id(),
                recipient_id: request.product.recipient_id(),
                price: quote.amount.clone(),
                currency: self.currency.clone(),
                provider: provider.name().as_str().to_string(),
                recurring: request.product.is_recurring(),
                parent_id: parent.as_ref().map(|p| p.id),
                metadata: quote_metadata(&quote, request.customer_ip.as_deref()),
            })
            .await?;

        info!(
            invoice_id = transaction.id,
            user_id,
            provider = %provider.name(),
            product_type = %transaction.product_type,
            amount = %quote.amount,
            recurring = transaction.recurring,
            "pending transaction created"
        );

        let amount = Money::from_decimal(&quote.amount, self.currency.clone());
        let description = describe(&request.product);
        let initiated = match &parent {
            Some(parent) => {
                provider
                    .recurrent(RecurringRequest {
                        invoice_id: transaction.id,
                        parent_invoice_id: parent.id,
                        parent_payment_id: parent.payment_id.clone(),
                        recurring_token: parent.recurring_token().map(str::to_string),
                        amount: amount.clone(),
                        description,
                        customer_ip: request
                            .customer_ip
                            .clone()
                            .or_else(|| parent.customer_ip().map(str::to_string)),
                    })
                    .await
            }
            None => {
                provider
                    .payment(PaymentRequest {
                        invoice_id: transaction.id,
                        amount: amount.clone(),
                        description,
                        recurring: request.product.is_recurring(),
                        customer_ip: request.customer_ip.clone(),
                        custom_fields: BTreeMap::new(),
                    })
                    .await
            }
        };

        let response = match initiated {
            Ok(response) => response,
            Err(e) => return Err(self.initiation_failed(&transaction, e).await),
        };

        if let Some(payment_id) = response.payment_id.as_deref() {
            self.store.set_payment_id(transaction.id, payment_id).await?;
        }

        Ok(receipt(&transaction, provider.name(), &amount, response))
    }

    /// Non-retryable failures cancel the transaction; retryable ones leave it
    /// pending for the reconciler.
    async fn initiation_failed(&self, transaction: &Transaction, err: PaymentError) -> PaymentsError {
        let patch = json!({
            "initiation_error": err.to_string(),
            "initiation_failed_at": Utc::now().to_rfc3339(),
        });

        if err.is_retryable() {
            warn!(
                invoice_id = transaction.id,
                provider = %transaction.provider,
                error = %err,
                "payment initiation failed, leaving transaction pending"
            );
            if let Err(e) = self.store.merge_metadata(transaction.id, patch).await {
                error!(invoice_id = transaction.id, error = %e, "failed to record initiation error");
            }
        } else {
            warn!(
                invoice_id = transaction.id,
                provider = %transaction.provider,
                error = %err,
                "payment initiation rejected, canceling transaction"
            );
            let mut patch = patch;
            patch["cancel_reason"] = json!("initiation_failed");
            if let Err(e) = self.store.cancel(transaction.id, patch).await {
                error!(invoice_id = transaction.id, error = %e, "failed to cancel transaction");
            }
        }
        PaymentsError::Payment(err)
    }

    /// Owner-only status lookup; other users get not-found.
    pub async fn status(&self, user_id: i64, invoice_id: i64) -> PaymentsResult<TransactionView> {
        match self.store.find_by_id(invoice_id).await? {
            Some(tx) if tx.user_id == user_id => Ok(TransactionView::from(&tx)),
            _ => Err(PaymentsError::TransactionNotFound(invoice_id)),
        }
    }

    /// Server-to-server result callback. Always answers with the provider's
    /// own reply format; only infrastructure failures surface as errors so
    /// the provider redelivers.
    pub async fn handle_result(
        &self,
        provider_name: &str,
        params: &CallbackParams,
    ) -> PaymentsResult<CallbackReply> {
        let provider = self.provider_by_name(provider_name)?;

        match provider.validate(params) {
            Ok(verification) if verification.valid => {}
            Ok(verification) => {
                let reason = verification.reason.unwrap_or_else(|| "bad sign".to_string());
                warn!(provider = %provider.name(), reason = %reason, "callback signature rejected");
                return Ok(provider.reject(&reason));
            }
            Err(e) => {
                warn!(provider = %provider.name(), error = %e, "malformed callback");
                return Ok(provider.reject(&e.user_message()));
            }
        }

        let event = match provider.parse_callback(params) {
            Ok(event) => event,
            Err(e) => {
                warn!(provider = %provider.name(), error = %e, "unparseable callback");
                return Ok(provider.reject(&e.user_message()));
            }
        };

        let Some(tx) = self.store.find_by_id(event.invoice_id).await? else {
            warn!(invoice_id = event.invoice_id, provider = %provider.name(), "callback for unknown invoice");
            return Ok(provider.reject("unknown invoice"));
        };

        if tx.provider != provider.name().as_str() {
            warn!(
                invoice_id = tx.id,
                expected = %tx.provider,
                received = %provider.name(),
                "callback from a different provider"
            );
            return Ok(provider.reject("provider mismatch"));
        }

        if let Some(amount) = &event.amount {
            if !amount.matches(&tx.price) {
                warn!(
                    invoice_id = tx.id,
                    expected = %tx.price,
                    received = %amount.amount,
                    "callback amount mismatch"
                );
                return Ok(provider.reject("amount mismatch"));
            }
        }

        match event.outcome {
            CallbackOutcome::Check => {
                if tx.is_pending() {
                    // hosted-form payments learn the provider id only here
                    if let (None, Some(payment_id)) = (&tx.payment_id, &event.payment_id) {
                        self.store.set_payment_id(tx.id, payment_id).await?;
                        info!(invoice_id = tx.id, payment_id = %payment_id, "provider payment id recorded");
                    }
                    Ok(provider.acknowledge(&event))
                } else {
                    Ok(provider.reject("transaction is not pending"))
                }
            }
            CallbackOutcome::Paid => {
                let outcome = self
                    .store
                    .complete(
                        tx.id,
                        event.payment_id.as_deref(),
                        paid_metadata(&tx, &event),
                    )
                    .await?;
                log_paid(&tx, &outcome);
                Ok(provider.acknowledge(&event))
            }
            CallbackOutcome::Failed => {
                let outcome = self
                    .store
                    .cancel(
                        tx.id,
                        json!({
                            "cancel_reason": "provider_failed",
                            "callback": event.payload,
                        }),
                    )
                    .await?;
                if outcome == TransitionOutcome::Applied {
                    info!(invoice_id = tx.id, provider = %tx.provider, "transaction canceled by provider callback");
                }
                Ok(provider.acknowledge(&event))
            }
            CallbackOutcome::Ignored => Ok(provider.acknowledge(&event)),
        }
    }

    /// The user landed on the success page. The result callback is
    /// authoritative, so this only reports the current state.
    pub async fn handle_success_page(
        &self,
        provider_name: &str,
        params: &CallbackParams,
    ) -> PaymentsResult<PageResult> {
        let provider = self.provider_by_name(provider_name)?;
        let redirect = provider.success_page(params)?;
        let tx = self
            .store
            .find_by_id(redirect.invoice_id)
            .await?
            .ok_or(PaymentsError::TransactionNotFound(redirect.invoice_id))?;

        Ok(PageResult {
            invoice_id: tx.id,
            status: tx.status(),
            verified: redirect.verified,
        })
    }

    /// The user landed on the fail page. Asks the provider about this one
    /// transaction and cancels only if the provider confirms the failure.
    pub async fn handle_fail_page(
        &self,
        provider_name: &str,
        params: &CallbackParams,
    ) -> PaymentsResult<PageResult> {
        let provider = self.provider_by_name(provider_name)?;
        let redirect = provider.error_page(params)?;
        let tx = self
            .store
            .find_by_id(redirect.invoice_id)
            .await?
            .ok_or(PaymentsError::TransactionNotFound(redirect.invoice_id))?;

        let mut status = tx.status();
        if tx.is_pending() {
            match self.reconcile(&tx, None).await {
                Ok(ReconcileOutcome::Completed) => status = TransactionStatus::Succeeded,
                Ok(ReconcileOutcome::Canceled) => status = TransactionStatus::Canceled,
                Ok(_) => {}
                Err(e) => {
                    warn!(invoice_id = tx.id, error = %e, "fail page reconciliation failed");
                }
            }
        }

        Ok(PageResult {
            invoice_id: tx.id,
            status,
            verified: redirect.verified,
        })
    }

    /// Asks the provider for the state of a pending transaction and applies it.
    ///
    /// With `pending_timeout`, a transaction the provider still reports as
    /// pending (or cannot find) is canceled once it is older than the timeout.
    /// A transaction the provider cannot be asked about is skipped.
    pub async fn reconcile(
        &self,
        tx: &Transaction,
        pending_timeout: Option<chrono::Duration>,
    ) -> PaymentsResult<ReconcileOutcome> {
        if !tx.is_pending() {
            return Ok(ReconcileOutcome::Skipped);
        }

        let provider = self.provider_by_name(&tx.provider)?;
        let status = provider
            .payment_status(StatusRequest {
                invoice_id: tx.id,
                payment_id: tx.payment_id.clone(),
            })
            .await;

        let (state, payment_id, amount, provider_code, recurring_token) = match status {
            Ok(status) => (
                status.status,
                status.payment_id,
                status.amount,
                status.provider_code,
                status.recurring_token,
            ),
            Err(e) if !e.is_retryable() => {
                // the provider was never asked, so the pending timeout does not apply
                error!(
                    invoice_id = tx.id,
                    provider = %tx.provider,
                    error = %e,
                    "status lookup impossible, manual review required"
                );
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        match state {
            PaymentState::Success => {
                if let Some(amount) = &amount {
                    if !amount.matches(&tx.price) {
                        error!(
                            invoice_id = tx.id,
                            expected = %tx.price,
                            reported = %amount.amount,
                            "provider reports a different amount, manual review required"
                        );
                        return Ok(ReconcileOutcome::Skipped);
                    }
                }

                let mut patch = json!({
                    "reconciled_at": Utc::now().to_rfc3339(),
                    "provider_code": provider_code,
                });
                if let Some(token) = recurring_token.filter(|_| starts_chain(tx)) {
                    patch["recurring_token"] = json!(token);
                }

                let outcome = self
                    .store
                    .complete(tx.id, payment_id.as_deref(), patch)
                    .await?;
                log_paid(tx, &outcome);
                Ok(match outcome {
                    TransitionOutcome::Applied => ReconcileOutcome::Completed,
                    TransitionOutcome::Unchanged(_) => ReconcileOutcome::Skipped,
                })
            }
            state if state.is_final_failure() => {
                self.cancel_reconciled(tx, "provider_status", provider_code)
                    .await
            }
            _ => {
                let expired = pending_timeout
                    .map(|timeout| Utc::now() - tx.created_at >= timeout)
                    .unwrap_or(false);
                if expired {
                    self.cancel_reconciled(tx, "pending_timeout", provider_code)
                        .await
                } else {
                    Ok(ReconcileOutcome::StillPending)
                }
            }
        }
    }

    async fn cancel_reconciled(
        &self,
        tx: &Transaction,
        reason: &str,
        provider_code: Option<String>,
    ) -> PaymentsResult<ReconcileOutcome> {
        let outcome = self
            .store
            .cancel(
                tx.id,
                json!({
                    "cancel_reason": reason,
                    "provider_code": provider_code,
                    "reconciled_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;

        Ok(match outcome {
            TransitionOutcome::Applied => {
                info!(invoice_id = tx.id, provider = %tx.provider, reason, "transaction canceled by reconciliation");
                ReconcileOutcome::Canceled
            }
            TransitionOutcome::Unchanged(_) => ReconcileOutcome::Skipped,
        })
    }

    fn provider_by_name(&self, name: &str) -> PaymentsResult<Arc<dyn PaymentProvider>> {
        ProviderName::from_str(name)
            .and_then(|provider| self.providers.get_provider(provider))
            .map_err(|_| PaymentsError::ProviderNotFound(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// First payment of a recurring chain; its token funds later charges.
fn starts_chain(tx: &Transaction) -> bool {
    tx.recurring && tx.parent_id.is_none()
}

fn quote_metadata(quote: &Quote, customer_ip: Option<&str>) -> serde_json::Value {
    let mut metadata = json!({
        "base_price": quote.base_price.to_string(),
        "banner_id": quote.banner_id,
        "discount_percent": quote.discount_percent,
        "gender": quote.gender,
    });
    if let Some(ip) = customer_ip.filter(|ip| !ip.trim().is_empty()) {
        metadata["customer_ip"] = json!(ip);
    }
    metadata
}

fn paid_metadata(tx: &Transaction, event: &CallbackEvent) -> serde_json::Value {
    let mut metadata = json!({
        "callback": event.payload,
        "paid_at": event.received_at,
    });
    if let Some(token) = event.recurring_token.as_deref().filter(|_| starts_chain(tx)) {
        metadata["recurring_token"] = json!(token);
    }
    metadata
}

fn log_paid(tx: &Transaction, outcome: &TransitionOutcome) {
    match outcome {
        TransitionOutcome::Applied => {
            info!(invoice_id = tx.id, provider = %tx.provider, user_id = tx.user_id, "transaction succeeded");
        }
        TransitionOutcome::Unchanged(TransactionStatus::Succeeded) => {
            info!(invoice_id = tx.id, "duplicate payment confirmation ignored");
        }
        TransitionOutcome::Unchanged(status) => {
            error!(
                invoice_id = tx.id,
                provider = %tx.provider,
                status = %status,
                "payment confirmed for a transaction that is no longer pending, manual review required"
            );
        }
    }
}

fn describe(product: &Product) -> String {
    match product {
        Product::Subscription {
            package_id,
            recurring: true,
        } => format!("Recurring subscription, package #{}", package_id),
        Product::Subscription { package_id, .. } => format!("Subscription, package #{}", package_id),
        Product::ServicePackage { package_id } => format!("Service package #{}", package_id),
        Product::Gift { gift_id, .. } => format!("Gift #{}", gift_id),
    }
}

fn receipt(
    tx: &Transaction,
    provider: ProviderName,
    amount: &Money,
    response: PaymentResponse,
) -> PurchaseReceipt {
    PurchaseReceipt {
        invoice_id: tx.id,
        payment_id: response.payment_id,
        confirmation_url: response.confirmation_url,
        provider,
        amount: amount.amount.clone(),
        currency: amount.currency.clone(),
        created_at: tx.created_at,
    }
}
