use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    params_to_json, required_invoice_id, CallbackEvent, CallbackOutcome, CallbackParams,
    CallbackReply, CallbackVerification, Money, PaymentRequest, PaymentResponse, PaymentState,
    ProviderName, RecurringRequest, RedirectResult, StatusRequest, StatusResponse,
};
use crate::payments::utils::{
    build_url, verify_hex_signature, PaymentHttpClient, SignatureAlgorithm,
};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const PROVIDER: &str = "robokassa";
const CURRENCY: &str = "RUB";
const SHP_PREFIX: &str = "shp_";

#[derive(Debug, Clone)]
pub struct RobokassaConfig {
    pub merchant_login: String,
    /// Signs payment initiation, recurring charges and the success redirect.
    pub password1: String,
    /// Signs result callbacks and status API requests.
    pub password2: String,
    pub test_mode: bool,
    pub hash_algorithm: SignatureAlgorithm,
    pub payment_url: String,
    pub recurring_url: String,
    pub status_url: String,
    pub culture: String,
    pub timeout_secs: u64,
}

impl Default for RobokassaConfig {
    fn default() -> Self {
        Self {
            merchant_login: String::new(),
            password1: String::new(),
            password2: String::new(),
            test_mode: false,
            hash_algorithm: SignatureAlgorithm::Md5,
            payment_url: "https://auth.robokassa.ru/Merchant/Index.aspx".to_string(),
            recurring_url: "https://auth.robokassa.ru/Merchant/Recurring".to_string(),
            status_url:
                "https://auth.robokassa.ru/Merchant/WebService/Service.asmx/OpStateExt".to_string(),
            culture: "ru".to_string(),
            timeout_secs: 30,
        }
    }
}

impl RobokassaConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            merchant_login: required_env("ROBOKASSA_MERCHANT_LOGIN")?,
            password1: required_env("ROBOKASSA_PASSWORD1")?,
            password2: required_env("ROBOKASSA_PASSWORD2")?,
            test_mode: std::env::var("ROBOKASSA_TEST_MODE")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(defaults.test_mode),
            hash_algorithm: match std::env::var("ROBOKASSA_HASH_ALGORITHM") {
                Ok(v) => SignatureAlgorithm::from_str(&v)?,
                Err(_) => defaults.hash_algorithm,
            },
            payment_url: std::env::var("ROBOKASSA_PAYMENT_URL").unwrap_or(defaults.payment_url),
            recurring_url: std::env::var("ROBOKASSA_RECURRING_URL")
                .unwrap_or(defaults.recurring_url),
            status_url: std::env::var("ROBOKASSA_STATUS_URL").unwrap_or(defaults.status_url),
            culture: std::env::var("ROBOKASSA_CULTURE").unwrap_or(defaults.culture),
            timeout_secs: std::env::var("ROBOKASSA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
        })
    }
}

fn required_env(key: &str) -> PaymentResult<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| PaymentError::ValidationError {
            message: format!("{} environment variable is required", key),
            field: Some(key.to_string()),
        })
}

pub struct RobokassaProvider {
    config: RobokassaConfig,
    http: PaymentHttpClient,
}

impl RobokassaProvider {
    pub fn new(config: RobokassaConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(PROVIDER, Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    /// Joins `parts` with `:` and appends sorted `Shp_key=value` pairs before hashing.
    fn sign(&self, parts: &[&str], shp: &BTreeMap<String, String>) -> String {
        let mut base = parts.join(":");
        for (key, value) in shp {
            base.push(':');
            base.push_str(key);
            base.push('=');
            base.push_str(value);
        }
        self.config.hash_algorithm.hex_digest(&base)
    }

    pub fn payment_signature(
        &self,
        out_sum: &str,
        invoice_id: i64,
        shp: &BTreeMap<String, String>,
    ) -> String {
        let inv = invoice_id.to_string();
        self.sign(
            &[
                self.config.merchant_login.as_str(),
                out_sum,
                inv.as_str(),
                self.config.password1.as_str(),
            ],
            shp,
        )
    }

    pub fn result_signature(
        &self,
        out_sum: &str,
        inv_id: &str,
        shp: &BTreeMap<String, String>,
    ) -> String {
        self.sign(&[out_sum, inv_id, self.config.password2.as_str()], shp)
    }

    pub fn success_signature(
        &self,
        out_sum: &str,
        inv_id: &str,
        shp: &BTreeMap<String, String>,
    ) -> String {
        self.sign(&[out_sum, inv_id, self.config.password1.as_str()], shp)
    }

    pub fn recurring_signature(&self, out_sum: &str, invoice_id: i64) -> String {
        let inv = invoice_id.to_string();
        self.sign(
            &[
                self.config.merchant_login.as_str(),
                out_sum,
                inv.as_str(),
                self.config.password1.as_str(),
            ],
            &BTreeMap::new(),
        )
    }

    pub fn status_signature(&self, invoice_id: i64) -> String {
        let inv = invoice_id.to_string();
        self.sign(
            &[
                self.config.merchant_login.as_str(),
                inv.as_str(),
                self.config.password2.as_str(),
            ],
            &BTreeMap::new(),
        )
    }

    /// Builds the signed redirect URL for the Robokassa payment page.
    pub fn payment_url(&self, request: &PaymentRequest) -> PaymentResult<String> {
        let shp = shp_fields(&request.custom_fields);
        let signature = self.payment_signature(&request.amount.amount, request.invoice_id, &shp);

        let mut query = vec![
            (
                "MerchantLogin".to_string(),
                self.config.merchant_login.clone(),
            ),
            ("OutSum".to_string(), request.amount.amount.clone()),
            ("InvId".to_string(), request.invoice_id.to_string()),
            ("Description".to_string(), request.description.clone()),
            ("SignatureValue".to_string(), signature),
            ("Culture".to_string(), self.config.culture.clone()),
        ];
        if request.recurring {
            query.push(("Recurring".to_string(), "true".to_string()));
        }
        if self.config.test_mode {
            query.push(("IsTest".to_string(), "1".to_string()));
        }
        query.extend(shp);

        Ok(build_url(&self.config.payment_url, &query)?.to_string())
    }

    fn redirect(&self, params: &CallbackParams, signed: bool) -> PaymentResult<RedirectResult> {
        let invoice_id = required_invoice_id(params, "InvId")?;
        let verified = signed
            && match (params.get("OutSum"), params.get("InvId"), signature_of(params)) {
                (Some(out_sum), Some(inv_id), Some(provided)) => verify_hex_signature(
                    &self.success_signature(out_sum, inv_id, &shp_fields(params)),
                    provided,
                ),
                _ => false,
            };

        Ok(RedirectResult {
            provider: ProviderName::Robokassa,
            invoice_id,
            verified,
        })
    }
}

#[async_trait]
impl PaymentProvider for RobokassaProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Robokassa
    }

    async fn payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        request.amount.validate_positive("amount")?;
        let confirmation_url = self.payment_url(&request)?;
        info!(
            invoice_id = request.invoice_id,
            recurring = request.recurring,
            "robokassa payment url issued"
        );

        Ok(PaymentResponse {
            status: PaymentState::Pending,
            invoice_id: request.invoice_id,
            payment_id: Some(request.invoice_id.to_string()),
            confirmation_url: Some(confirmation_url),
            created_at: chrono::Utc::now(),
            provider_data: None,
        })
    }

    async fn recurrent(&self, request: RecurringRequest) -> PaymentResult<PaymentResponse> {
        request.amount.validate_positive("amount")?;
        let signature = self.recurring_signature(&request.amount.amount, request.invoice_id);
        let form = vec![
            (
                "MerchantLogin".to_string(),
                self.config.merchant_login.clone(),
            ),
            ("InvoiceID".to_string(), request.invoice_id.to_string()),
            (
                "PreviousInvoiceID".to_string(),
                request.parent_invoice_id.to_string(),
            ),
            ("OutSum".to_string(), request.amount.amount.clone()),
            ("Description".to_string(), request.description.clone()),
            ("SignatureValue".to_string(), signature),
        ];

        let body = self
            .http
            .post_form_text(&self.config.recurring_url, &form)
            .await?;
        if !body.trim_start().starts_with("OK") {
            return Err(PaymentError::PaymentDeclinedError {
                message: format!("robokassa refused recurring charge: {}", body.trim()),
                provider_code: None,
            });
        }
        info!(
            invoice_id = request.invoice_id,
            parent_invoice_id = request.parent_invoice_id,
            "robokassa recurring charge accepted"
        );

        Ok(PaymentResponse {
            status: PaymentState::Processing,
            invoice_id: request.invoice_id,
            payment_id: Some(request.invoice_id.to_string()),
            confirmation_url: None,
            created_at: chrono::Utc::now(),
            provider_data: Some(serde_json::json!({ "response": body.trim() })),
        })
    }

    async fn payment_status(&self, request: StatusRequest) -> PaymentResult<StatusResponse> {
        let query = vec![
            (
                "MerchantLogin".to_string(),
                self.config.merchant_login.clone(),
            ),
            ("InvoiceID".to_string(), request.invoice_id.to_string()),
            (
                "Signature".to_string(),
                self.status_signature(request.invoice_id),
            ),
        ];
        let xml = self.http.get_text(&self.config.status_url, &query).await?;
        let state = parse_operation_state(&xml)?;

        let status = match state.result_code {
            0 => map_state_code(state.state_code),
            3 => PaymentState::Unknown,
            code => {
                warn!(invoice_id = request.invoice_id, code, "robokassa status request failed");
                return Err(PaymentError::ProviderError {
                    provider: PROVIDER.to_string(),
                    message: state
                        .description
                        .unwrap_or_else(|| format!("status request failed with code {}", code)),
                    provider_code: Some(code.to_string()),
                    retryable: false,
                });
            }
        };

        Ok(StatusResponse {
            status,
            invoice_id: request.invoice_id,
            payment_id: Some(request.invoice_id.to_string()),
            amount: state.out_sum.map(|amount| Money {
                amount,
                currency: CURRENCY.to_string(),
            }),
            provider_code: state
                .state_code
                .map(|c| c.to_string())
                .or_else(|| Some(state.result_code.to_string())),
            // the invoice itself is the handle for future PreviousInvoiceID charges
            recurring_token: Some(request.invoice_id.to_string()),
            provider_data: None,
        })
    }

    fn validate(&self, params: &CallbackParams) -> PaymentResult<CallbackVerification> {
        let (out_sum, inv_id, provided) =
            match (params.get("OutSum"), params.get("InvId"), signature_of(params)) {
                (Some(o), Some(i), Some(s)) => (o, i, s),
                _ => {
                    return Ok(CallbackVerification::invalid(
                        "OutSum, InvId and SignatureValue are required",
                    ))
                }
            };

        let expected = self.result_signature(out_sum, inv_id, &shp_fields(params));
        if verify_hex_signature(&expected, provided) {
            Ok(CallbackVerification::valid())
        } else {
            Ok(CallbackVerification::invalid("invalid robokassa signature"))
        }
    }

    fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackEvent> {
        let invoice_id = required_invoice_id(params, "InvId")?;
        let amount = params
            .get("OutSum")
            .map(|v| Money {
                amount: v.trim().to_string(),
                currency: CURRENCY.to_string(),
            })
            .ok_or_else(|| PaymentError::ValidationError {
                message: "OutSum is required".to_string(),
                field: Some("OutSum".to_string()),
            })?;

        Ok(CallbackEvent {
            provider: ProviderName::Robokassa,
            outcome: CallbackOutcome::Paid,
            invoice_id,
            payment_id: Some(invoice_id.to_string()),
            amount: Some(amount),
            recurring_token: Some(invoice_id.to_string()),
            payload: params_to_json(params),
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    fn success_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        self.redirect(params, true)
    }

    fn error_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        self.redirect(params, false)
    }

    fn acknowledge(&self, event: &CallbackEvent) -> CallbackReply {
        CallbackReply::Text {
            status: 200,
            body: format!("OK{}", event.invoice_id),
        }
    }

    fn reject(&self, _reason: &str) -> CallbackReply {
        CallbackReply::Text {
            status: 400,
            body: "bad sign".to_string(),
        }
    }
}

fn signature_of(params: &CallbackParams) -> Option<&String> {
    params
        .get("SignatureValue")
        .or_else(|| params.get("signatureValue"))
}

/// Custom `Shp_` parameters, sorted by key as Robokassa requires.
fn shp_fields(params: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    params
        .iter()
        .filter(|(k, _)| k.to_ascii_lowercase().starts_with(SHP_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Fields of an `OpStateExt` XML response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationState {
    pub result_code: u32,
    pub description: Option<String>,
    pub state_code: Option<u32>,
    pub out_sum: Option<String>,
}

pub fn parse_operation_state(xml: &str) -> PaymentResult<OperationState> {
    let result_code = capture(xml, r"(?s)<Result>\s*<Code>\s*(\d+)\s*</Code>")?
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| {
            PaymentError::provider(PROVIDER, "status response has no Result/Code", false)
        })?;

    Ok(OperationState {
        result_code,
        description: capture(xml, r"(?s)<Result>.*?<Description>([^<]*)</Description>")?,
        state_code: capture(xml, r"(?s)<State>\s*<Code>\s*(\d+)\s*</Code>")?
            .and_then(|v| v.parse::<u32>().ok()),
        out_sum: capture(xml, r"(?s)<Info>.*?<OutSum>\s*([^<\s]+)\s*</OutSum>")?,
    })
}

fn capture(xml: &str, pattern: &str) -> PaymentResult<Option<String>> {
    let re = Regex::new(pattern).map_err(|e| {
        PaymentError::provider(PROVIDER, format!("invalid status pattern: {}", e), false)
    })?;
    Ok(re
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string()))
}

pub fn map_state_code(code: Option<u32>) -> PaymentState {
    match code {
        Some(5) => PaymentState::Pending,
        Some(10) => PaymentState::Cancelled,
        Some(50) | Some(80) => PaymentState::Processing,
        Some(60) => PaymentState::Reversed,
        Some(100) => PaymentState::Success,
        _ => PaymentState::Unknown,
    }
}
