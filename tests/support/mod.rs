//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use matchpay::database::catalog_repository::{Banner, Gender, PriceCatalog};
use matchpay::database::error::DatabaseError;
use matchpay::database::transaction::{
    NewTransaction, Transaction, TransactionStatus, TransitionOutcome,
};
use matchpay::database::transaction_repository::TransactionStore;
use matchpay::payments::providers::{
    RobokassaConfig, RobokassaProvider, UnitpayConfig, UnitpayProvider,
};
use matchpay::payments::types::{
    params_to_json, required_invoice_id, CallbackEvent, CallbackOutcome, CallbackParams,
    CallbackReply, CallbackVerification, Money, PaymentRequest, PaymentResponse, PaymentState,
    ProviderName, RecurringRequest, RedirectResult, StatusRequest, StatusResponse,
};
use matchpay::payments::{PaymentError, PaymentProvider, PaymentProviderFactory, PaymentResult};
use matchpay::services::{PaymentsService, PricingService};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BUYER: i64 = 1;
pub const OTHER_USER: i64 = 2;
pub const SUBSCRIPTION_PACKAGE: i64 = 10;
pub const SERVICE_PACKAGE: i64 = 20;
pub const GIFT: i64 = 30;

pub fn decimal(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).expect("valid decimal")
}

// ---------------------------------------------------------------------------
// Transaction store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<i64, Transaction>>,
    next_id: AtomicUsize,
    fulfillments: AtomicUsize,
}

impl MemoryStore {
    pub fn get(&self, id: i64) -> Transaction {
        self.rows
            .lock()
            .expect("store lock")
            .get(&id)
            .cloned()
            .expect("transaction exists")
    }

    pub fn count(&self) -> usize {
        self.rows.lock().expect("store lock").len()
    }

    /// Times a product was granted to a user.
    pub fn fulfillments(&self) -> usize {
        self.fulfillments.load(Ordering::SeqCst)
    }

    pub fn backdate(&self, id: i64, age: chrono::Duration) {
        let mut rows = self.rows.lock().expect("store lock");
        if let Some(tx) = rows.get_mut(&id) {
            tx.created_at = Utc::now() - age;
        }
    }

    fn transition(
        &self,
        id: i64,
        to: TransactionStatus,
        payment_id: Option<&str>,
        patch: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let mut rows = self.rows.lock().expect("store lock");
        let tx = rows
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("transaction", id.to_string()))?;

        if tx.status() != TransactionStatus::Pending {
            return Ok(TransitionOutcome::Unchanged(tx.status()));
        }

        tx.status = to.as_str().to_string();
        tx.updated_at = Utc::now();
        if let Some(payment_id) = payment_id {
            tx.payment_id = Some(payment_id.to_string());
        }
        merge(&mut tx.metadata, patch);
        if to == TransactionStatus::Succeeded {
            tx.purchased_at = Some(Utc::now());
            self.fulfillments.fetch_add(1, Ordering::SeqCst);
        }
        Ok(TransitionOutcome::Applied)
    }
}

fn merge(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target.as_object_mut(), patch) {
        (Some(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (_, patch) => *target = patch,
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, DatabaseError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let now = Utc::now();
        let tx = Transaction {
            id,
            user_id: new.user_id,
            product_type: new.product_type.as_str().to_string(),
            product_id: new.product_id,
            recipient_id: new.recipient_id,
            price: new.price,
            currency: new.currency,
            status: TransactionStatus::Pending.as_str().to_string(),
            provider: new.provider,
            payment_id: None,
            recurring: new.recurring,
            parent_id: new.parent_id,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
            purchased_at: None,
        };
        self.rows
            .lock()
            .expect("store lock")
            .insert(id, tx.clone());
        Ok(tx)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self.rows.lock().expect("store lock").get(&id).cloned())
    }

    async fn set_payment_id(&self, id: i64, payment_id: &str) -> Result<(), DatabaseError> {
        if let Some(tx) = self.rows.lock().expect("store lock").get_mut(&id) {
            tx.payment_id = Some(payment_id.to_string());
        }
        Ok(())
    }

    async fn merge_metadata(
        &self,
        id: i64,
        patch: serde_json::Value,
    ) -> Result<(), DatabaseError> {
        if let Some(tx) = self.rows.lock().expect("store lock").get_mut(&id) {
            merge(&mut tx.metadata, patch);
        }
        Ok(())
    }

    async fn complete(
        &self,
        id: i64,
        payment_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError> {
        self.transition(id, TransactionStatus::Succeeded, payment_id, metadata)
    }

    async fn cancel(
        &self,
        id: i64,
        metadata: serde_json::Value,
    ) -> Result<TransitionOutcome, DatabaseError> {
        self.transition(id, TransactionStatus::Canceled, None, metadata)
    }

    async fn find_pending(
        &self,
        created_before: DateTime<Utc>,
        created_after: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, DatabaseError> {
        let mut pending: Vec<Transaction> = self
            .rows
            .lock()
            .expect("store lock")
            .values()
            .filter(|tx| tx.is_pending())
            .filter(|tx| tx.created_at <= created_before && tx.created_at > created_after)
            .cloned()
            .collect();
        pending.sort_by_key(|tx| tx.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn find_recurring_parent(
        &self,
        user_id: i64,
        package_id: i64,
        provider: &str,
    ) -> Result<Option<Transaction>, DatabaseError> {
        Ok(self
            .rows
            .lock()
            .expect("store lock")
            .values()
            .filter(|tx| {
                tx.user_id == user_id
                    && tx.product_id == package_id
                    && tx.provider == provider
                    && tx.recurring
                    && tx.parent_id.is_none()
                    && tx.status() == TransactionStatus::Succeeded
            })
            .max_by_key(|tx| tx.id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Price catalog
// ---------------------------------------------------------------------------

/// One buyer and one other user, a price for each product kind and a 10% banner.
pub struct MemoryCatalog {
    pub banners: HashMap<i64, Banner>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        let mut banners = HashMap::new();
        banners.insert(
            5,
            Banner {
                id: 5,
                discount_percent: 10,
                starts_at: None,
                ends_at: None,
            },
        );
        Self { banners }
    }
}

#[async_trait]
impl PriceCatalog for MemoryCatalog {
    async fn user_gender(&self, user_id: i64) -> Result<Option<Gender>, DatabaseError> {
        Ok(match user_id {
            BUYER => Some(Gender::Male),
            OTHER_USER => Some(Gender::Female),
            _ => None,
        })
    }

    async fn subscription_price(
        &self,
        package_id: i64,
        gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        Ok((package_id == SUBSCRIPTION_PACKAGE).then(|| match gender {
            Gender::Male => decimal("499.00"),
            Gender::Female => decimal("299.00"),
        }))
    }

    async fn recurring_price(
        &self,
        package_id: i64,
        _gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        Ok((package_id == SUBSCRIPTION_PACKAGE).then(|| decimal("399.00")))
    }

    async fn service_package_price(
        &self,
        package_id: i64,
        _gender: Gender,
    ) -> Result<Option<BigDecimal>, DatabaseError> {
        Ok((package_id == SERVICE_PACKAGE).then(|| decimal("100.00")))
    }

    async fn gift_price(&self, gift_id: i64) -> Result<Option<BigDecimal>, DatabaseError> {
        Ok((gift_id == GIFT).then(|| decimal("50.00")))
    }

    async fn banner(&self, banner_id: i64) -> Result<Option<Banner>, DatabaseError> {
        Ok(self.banners.get(&banner_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitFailure {
    Retryable,
    Fatal,
}

/// Provider double whose status answers and initiation failures are set by the test.
pub struct ScriptedProvider {
    name: ProviderName,
    state: Mutex<PaymentState>,
    reported_amount: Mutex<Option<String>>,
    init_failure: Mutex<Option<InitFailure>>,
    renewal_ip: Mutex<Option<String>>,
    pub payment_calls: AtomicUsize,
    pub recurrent_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: ProviderName) -> Self {
        Self {
            name,
            state: Mutex::new(PaymentState::Pending),
            reported_amount: Mutex::new(None),
            init_failure: Mutex::new(None),
            renewal_ip: Mutex::new(None),
            payment_calls: AtomicUsize::new(0),
            recurrent_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn report(&self, state: PaymentState, amount: Option<&str>) {
        *self.state.lock().expect("state lock") = state;
        *self.reported_amount.lock().expect("amount lock") = amount.map(str::to_string);
    }

    pub fn fail_initiation(&self, failure: InitFailure) {
        *self.init_failure.lock().expect("failure lock") = Some(failure);
    }

    /// Buyer IP the last recurring charge was sent with.
    pub fn renewal_ip(&self) -> Option<String> {
        self.renewal_ip.lock().expect("ip lock").clone()
    }

    pub fn initiations(&self) -> usize {
        self.payment_calls.load(Ordering::SeqCst) + self.recurrent_calls.load(Ordering::SeqCst)
    }

    fn initiation_error(&self) -> Option<PaymentError> {
        self.init_failure
            .lock()
            .expect("failure lock")
            .map(|failure| match failure {
                InitFailure::Retryable => PaymentError::NetworkError {
                    message: "connection reset".to_string(),
                },
                InitFailure::Fatal => {
                    PaymentError::provider(self.name.as_str(), "merchant disabled", false)
                }
            })
    }

    fn response(&self, invoice_id: i64) -> PaymentResponse {
        PaymentResponse {
            status: PaymentState::Pending,
            invoice_id,
            payment_id: Some(format!("pay-{}", invoice_id)),
            confirmation_url: Some(format!("https://pay.example.com/{}", invoice_id)),
            created_at: Utc::now(),
            provider_data: None,
        }
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn name(&self) -> ProviderName {
        self.name
    }

    async fn payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        self.payment_calls.fetch_add(1, Ordering::SeqCst);
        match self.initiation_error() {
            Some(err) => Err(err),
            None => Ok(self.response(request.invoice_id)),
        }
    }

    async fn recurrent(&self, request: RecurringRequest) -> PaymentResult<PaymentResponse> {
        self.recurrent_calls.fetch_add(1, Ordering::SeqCst);
        *self.renewal_ip.lock().expect("ip lock") = request.customer_ip.clone();
        match self.initiation_error() {
            Some(err) => Err(err),
            None => Ok(self.response(request.invoice_id)),
        }
    }

    async fn payment_status(&self, request: StatusRequest) -> PaymentResult<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("state lock").clone();
        let amount = self
            .reported_amount
            .lock()
            .expect("amount lock")
            .clone()
            .map(|amount| Money {
                amount,
                currency: "RUB".to_string(),
            });
        Ok(StatusResponse {
            status: state,
            invoice_id: request.invoice_id,
            payment_id: request.payment_id,
            amount,
            provider_code: None,
            recurring_token: Some(format!("sub-{}", request.invoice_id)),
            provider_data: None,
        })
    }

    fn validate(&self, params: &CallbackParams) -> PaymentResult<CallbackVerification> {
        if params.get("sign").map(String::as_str) == Some("good") {
            Ok(CallbackVerification::valid())
        } else {
            Ok(CallbackVerification::invalid("bad sign"))
        }
    }

    fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackEvent> {
        let outcome = match params.get("method").map(String::as_str) {
            Some("check") => CallbackOutcome::Check,
            Some("error") => CallbackOutcome::Failed,
            _ => CallbackOutcome::Paid,
        };
        Ok(CallbackEvent {
            provider: self.name,
            outcome,
            invoice_id: required_invoice_id(params, "account")?,
            payment_id: params.get("paymentId").cloned(),
            amount: params.get("sum").map(|sum| Money {
                amount: sum.clone(),
                currency: "RUB".to_string(),
            }),
            recurring_token: params.get("subscriptionId").cloned(),
            payload: params_to_json(params),
            received_at: Utc::now().to_rfc3339(),
        })
    }

    fn success_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        Ok(RedirectResult {
            provider: self.name,
            invoice_id: required_invoice_id(params, "account")?,
            verified: false,
        })
    }

    fn error_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        self.success_page(params)
    }

    fn acknowledge(&self, _event: &CallbackEvent) -> CallbackReply {
        CallbackReply::Json {
            status: 200,
            body: serde_json::json!({"result": {"message": "ok"}}),
        }
    }

    fn reject(&self, reason: &str) -> CallbackReply {
        CallbackReply::Json {
            status: 200,
            body: serde_json::json!({"error": {"message": reason}}),
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn robokassa() -> RobokassaProvider {
    RobokassaProvider::new(RobokassaConfig {
        merchant_login: "merchant".to_string(),
        password1: "pass1".to_string(),
        password2: "pass2".to_string(),
        ..RobokassaConfig::default()
    })
    .expect("robokassa provider builds")
}

/// Robokassa result callback signed with password2.
pub fn robokassa_result(invoice_id: i64, out_sum: &str) -> CallbackParams {
    let provider = robokassa();
    let inv = invoice_id.to_string();
    let signature = provider.result_signature(out_sum, &inv, &Default::default());
    let mut params = CallbackParams::new();
    params.insert("OutSum".to_string(), out_sum.to_string());
    params.insert("InvId".to_string(), inv);
    params.insert("SignatureValue".to_string(), signature);
    params
}

pub fn unitpay() -> UnitpayProvider {
    UnitpayProvider::new(UnitpayConfig {
        public_key: "12345-abcde".to_string(),
        project_id: "12345".to_string(),
        secret_key: "secret".to_string(),
        ..UnitpayConfig::default()
    })
    .expect("unitpay provider builds")
}

/// Unitpay handler call signed with the secret key, as Unitpay sends it.
pub fn unitpay_signed(method: &str, invoice_id: i64, sum: &str, unitpay_id: &str) -> CallbackParams {
    let mut params = CallbackParams::new();
    params.insert("method".to_string(), method.to_string());
    params.insert("params[account]".to_string(), invoice_id.to_string());
    params.insert("params[orderSum]".to_string(), sum.to_string());
    params.insert("params[sum]".to_string(), sum.to_string());
    params.insert("params[unitpayId]".to_string(), unitpay_id.to_string());
    let signature = unitpay().callback_signature(method, &params);
    params.insert("params[signature]".to_string(), signature);
    params
}

pub fn unitpay_callback(method: &str, invoice_id: i64, sum: &str) -> CallbackParams {
    let mut params = CallbackParams::new();
    params.insert("method".to_string(), method.to_string());
    params.insert("account".to_string(), invoice_id.to_string());
    params.insert("sum".to_string(), sum.to_string());
    params.insert("paymentId".to_string(), format!("up-{}", invoice_id));
    params.insert("sign".to_string(), "good".to_string());
    params
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    /// Registered under the `unitpay` name next to a real Robokassa driver.
    pub scripted: Arc<ScriptedProvider>,
    pub payments: Arc<PaymentsService>,
}

impl Harness {
    pub fn new(default_provider: ProviderName) -> Self {
        let scripted = Arc::new(ScriptedProvider::new(ProviderName::Unitpay));
        Self::wire(default_provider, scripted.clone(), scripted)
    }

    /// Real Unitpay driver in place of the scripted one, Unitpay by default.
    /// `scripted` is left unregistered.
    pub fn with_unitpay_driver() -> Self {
        let scripted = Arc::new(ScriptedProvider::new(ProviderName::Unitpay));
        Self::wire(ProviderName::Unitpay, Arc::new(unitpay()), scripted)
    }

    fn wire(
        default_provider: ProviderName,
        unitpay: Arc<dyn PaymentProvider>,
        scripted: Arc<ScriptedProvider>,
    ) -> Self {
        let store = Arc::new(MemoryStore::default());
        let providers: Vec<Arc<dyn PaymentProvider>> = vec![Arc::new(robokassa()), unitpay];
        let factory = PaymentProviderFactory::with_providers(default_provider, providers)
            .expect("providers register");
        let pricing = PricingService::new(Arc::new(MemoryCatalog::default()));
        let payments = Arc::new(PaymentsService::new(
            store.clone(),
            Arc::new(pricing),
            Arc::new(factory),
            "RUB",
        ));
        Self {
            store,
            scripted,
            payments,
        }
    }
}
