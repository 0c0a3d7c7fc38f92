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
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

const PROVIDER: &str = "unitpay";
const SEPARATOR: &str = "{up}";

#[derive(Debug, Clone)]
pub struct UnitpayConfig {
    pub public_key: String,
    pub project_id: String,
    pub secret_key: String,
    pub api_url: String,
    /// Hosted form used when the buyer IP is unknown and `initPayment` cannot be called.
    pub payment_url: String,
    pub result_url: Option<String>,
    pub payment_type: String,
    pub currency: String,
    pub locale: String,
    pub test_mode: bool,
    pub timeout_secs: u64,
}

impl Default for UnitpayConfig {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            project_id: String::new(),
            secret_key: String::new(),
            api_url: "https://unitpay.ru/api".to_string(),
            payment_url: "https://unitpay.ru/pay".to_string(),
            result_url: None,
            payment_type: "card".to_string(),
            currency: "RUB".to_string(),
            locale: "ru".to_string(),
            test_mode: false,
            timeout_secs: 30,
        }
    }
}

impl UnitpayConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            public_key: required_env("UNITPAY_PUBLIC_KEY")?,
            project_id: required_env("UNITPAY_PROJECT_ID")?,
            secret_key: required_env("UNITPAY_SECRET_KEY")?,
            api_url: std::env::var("UNITPAY_API_URL").unwrap_or(defaults.api_url),
            payment_url: std::env::var("UNITPAY_PAYMENT_URL").unwrap_or(defaults.payment_url),
            result_url: std::env::var("UNITPAY_RESULT_URL").ok(),
            payment_type: std::env::var("UNITPAY_PAYMENT_TYPE").unwrap_or(defaults.payment_type),
            currency: std::env::var("UNITPAY_CURRENCY").unwrap_or(defaults.currency),
            locale: std::env::var("UNITPAY_LOCALE").unwrap_or(defaults.locale),
            test_mode: std::env::var("UNITPAY_TEST_MODE")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(defaults.test_mode),
            timeout_secs: std::env::var("UNITPAY_TIMEOUT_SECS")
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

pub struct UnitpayProvider {
    config: UnitpayConfig,
    http: PaymentHttpClient,
}

impl UnitpayProvider {
    pub fn new(config: UnitpayConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(PROVIDER, Duration::from_secs(config.timeout_secs))?;
        Ok(Self { config, http })
    }

    /// `sha256(account{up}currency{up}desc{up}sum{up}secretKey)`
    pub fn form_signature(&self, account: &str, currency: &str, desc: &str, sum: &str) -> String {
        let base = [account, currency, desc, sum, self.config.secret_key.as_str()].join(SEPARATOR);
        SignatureAlgorithm::Sha256.hex_digest(&base)
    }

    /// `sha256(method{up}v1{up}...{up}vn{up}secretKey)` over `params[...]` values sorted by key.
    pub fn callback_signature(&self, method: &str, params: &CallbackParams) -> String {
        let mut parts = vec![method.to_string()];
        parts.extend(nested_params(params).into_values());
        parts.push(self.config.secret_key.clone());
        SignatureAlgorithm::Sha256.hex_digest(&parts.join(SEPARATOR))
    }

    fn api_query(&self, method: &str, params: Vec<(&str, String)>) -> Vec<(String, String)> {
        let mut query = vec![("method".to_string(), method.to_string())];
        query.extend(
            params
                .into_iter()
                .map(|(key, value)| (format!("params[{}]", key), value)),
        );
        query
    }

    async fn call(&self, method: &str, params: Vec<(&str, String)>) -> PaymentResult<JsonValue> {
        let query = self.api_query(method, params);
        let envelope: UnitpayEnvelope = self.http.get_json(&self.config.api_url, &query).await?;
        envelope.into_result()
    }

    fn init_params(
        &self,
        invoice_id: i64,
        amount: &Money,
        description: &str,
        customer_ip: &str,
    ) -> Vec<(&'static str, String)> {
        let account = invoice_id.to_string();
        let signature =
            self.form_signature(&account, &amount.currency, description, &amount.amount);
        let mut params = vec![
            ("paymentType", self.config.payment_type.clone()),
            ("account", account),
            ("sum", amount.amount.clone()),
            ("projectId", self.config.project_id.clone()),
            ("desc", description.to_string()),
            ("currency", amount.currency.clone()),
            ("locale", self.config.locale.clone()),
            ("ip", customer_ip.to_string()),
            ("secretKey", self.config.secret_key.clone()),
            ("signature", signature),
        ];
        if let Some(result_url) = &self.config.result_url {
            params.push(("resultUrl", result_url.clone()));
        }
        if self.config.test_mode {
            params.push(("test", "1".to_string()));
        }
        params
    }

    /// Hosted payment form URL, signed the same way as `initPayment`.
    pub fn form_url(&self, request: &PaymentRequest) -> PaymentResult<String> {
        let account = request.invoice_id.to_string();
        let signature = self.form_signature(
            &account,
            &request.amount.currency,
            &request.description,
            &request.amount.amount,
        );
        let mut query = vec![
            ("sum".to_string(), request.amount.amount.clone()),
            ("account".to_string(), account),
            ("desc".to_string(), request.description.clone()),
            ("currency".to_string(), request.amount.currency.clone()),
            ("locale".to_string(), self.config.locale.clone()),
            ("signature".to_string(), signature),
        ];
        if request.recurring {
            query.push(("subscription".to_string(), "true".to_string()));
        }
        let base = format!(
            "{}/{}",
            self.config.payment_url.trim_end_matches('/'),
            self.config.public_key
        );
        Ok(build_url(&base, &query)?.to_string())
    }

    fn page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        let key = if params.contains_key("account") {
            "account"
        } else {
            "params[account]"
        };
        Ok(RedirectResult {
            provider: ProviderName::Unitpay,
            invoice_id: required_invoice_id(params, key)?,
            verified: false,
        })
    }
}

#[async_trait]
impl PaymentProvider for UnitpayProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Unitpay
    }

    async fn payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
        request.amount.validate_positive("amount")?;

        let customer_ip = match request.customer_ip.as_deref() {
            Some(ip) if !ip.trim().is_empty() => ip.to_string(),
            _ => {
                let confirmation_url = self.form_url(&request)?;
                info!(invoice_id = request.invoice_id, "unitpay form url issued");
                return Ok(PaymentResponse {
                    status: PaymentState::Pending,
                    invoice_id: request.invoice_id,
                    payment_id: None,
                    confirmation_url: Some(confirmation_url),
                    created_at: chrono::Utc::now(),
                    provider_data: None,
                });
            }
        };

        let mut params = self.init_params(
            request.invoice_id,
            &request.amount,
            &request.description,
            &customer_ip,
        );
        if request.recurring {
            params.push(("subscription", "true".to_string()));
        }

        let result = self.call("initPayment", params).await?;
        let payment_id = result.get("paymentId").and_then(json_string);
        let confirmation_url = result.get("redirectUrl").and_then(json_string);
        info!(
            invoice_id = request.invoice_id,
            payment_id = ?payment_id,
            "unitpay payment initiated"
        );

        Ok(PaymentResponse {
            status: PaymentState::Pending,
            invoice_id: request.invoice_id,
            payment_id,
            confirmation_url,
            created_at: chrono::Utc::now(),
            provider_data: Some(result),
        })
    }

    async fn recurrent(&self, request: RecurringRequest) -> PaymentResult<PaymentResponse> {
        request.amount.validate_positive("amount")?;
        let subscription_id = request
            .recurring_token
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PaymentError::ValidationError {
                message: "subscriptionId of the parent payment is required".to_string(),
                field: Some("recurring_token".to_string()),
            })?;
        let customer_ip = match request.customer_ip.as_deref() {
            Some(ip) if !ip.trim().is_empty() => ip.to_string(),
            _ => {
                // initPayment needs the buyer IP; send the buyer through the form instead
                let confirmation_url = self.form_url(&PaymentRequest {
                    invoice_id: request.invoice_id,
                    amount: request.amount.clone(),
                    description: request.description.clone(),
                    recurring: true,
                    customer_ip: None,
                    custom_fields: BTreeMap::new(),
                })?;
                info!(
                    invoice_id = request.invoice_id,
                    parent_invoice_id = request.parent_invoice_id,
                    "unitpay renewal needs the buyer, form url issued"
                );
                return Ok(PaymentResponse {
                    status: PaymentState::Pending,
                    invoice_id: request.invoice_id,
                    payment_id: None,
                    confirmation_url: Some(confirmation_url),
                    created_at: chrono::Utc::now(),
                    provider_data: None,
                });
            }
        };

        let mut params = self.init_params(
            request.invoice_id,
            &request.amount,
            &request.description,
            &customer_ip,
        );
        params.push(("subscriptionId", subscription_id));

        let result = self.call("initPayment", params).await?;
        let payment_id = result.get("paymentId").and_then(json_string);
        info!(
            invoice_id = request.invoice_id,
            parent_invoice_id = request.parent_invoice_id,
            payment_id = ?payment_id,
            "unitpay recurring charge accepted"
        );

        Ok(PaymentResponse {
            status: PaymentState::Processing,
            invoice_id: request.invoice_id,
            payment_id,
            confirmation_url: result.get("redirectUrl").and_then(json_string),
            created_at: chrono::Utc::now(),
            provider_data: Some(result),
        })
    }

    async fn payment_status(&self, request: StatusRequest) -> PaymentResult<StatusResponse> {
        let payment_id = request
            .payment_id
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(PaymentError::ValidationError {
                message: "unitpay status requires the provider payment id".to_string(),
                field: Some("payment_id".to_string()),
            })?;

        let result = self
            .call(
                "getPayment",
                vec![
                    ("paymentId", payment_id.clone()),
                    ("secretKey", self.config.secret_key.clone()),
                ],
            )
            .await?;

        let raw_status = result
            .get("status")
            .and_then(json_string)
            .unwrap_or_default();
        let status = map_payment_status(&raw_status);
        if status == PaymentState::Unknown {
            warn!(payment_id = %payment_id, status = %raw_status, "unrecognized unitpay status");
        }

        let amount = result.get("orderSum").and_then(json_string).map(|amount| Money {
            amount,
            currency: result
                .get("orderCurrency")
                .and_then(json_string)
                .unwrap_or_else(|| self.config.currency.clone()),
        });

        Ok(StatusResponse {
            status,
            invoice_id: request.invoice_id,
            payment_id: Some(payment_id),
            amount,
            provider_code: Some(raw_status),
            recurring_token: result.get("subscriptionId").and_then(json_string),
            provider_data: Some(result),
        })
    }

    fn validate(&self, params: &CallbackParams) -> PaymentResult<CallbackVerification> {
        let method = match params.get("method").filter(|m| !m.trim().is_empty()) {
            Some(method) => method,
            None => return Ok(CallbackVerification::invalid("method is required")),
        };
        let provided = match params.get("params[signature]") {
            Some(signature) => signature,
            None => return Ok(CallbackVerification::invalid("signature is required")),
        };

        let expected = self.callback_signature(method, params);
        if verify_hex_signature(&expected, provided) {
            Ok(CallbackVerification::valid())
        } else {
            Ok(CallbackVerification::invalid("invalid unitpay signature"))
        }
    }

    fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackEvent> {
        let outcome = match params.get("method").map(|m| m.trim()) {
            Some("check") => CallbackOutcome::Check,
            Some("pay") => CallbackOutcome::Paid,
            Some("error") => CallbackOutcome::Failed,
            Some(_) => CallbackOutcome::Ignored,
            None => {
                return Err(PaymentError::ValidationError {
                    message: "method is required".to_string(),
                    field: Some("method".to_string()),
                })
            }
        };
        let invoice_id = required_invoice_id(params, "params[account]")?;
        let amount = params
            .get("params[orderSum]")
            .or_else(|| params.get("params[sum]"))
            .map(|amount| Money {
                amount: amount.trim().to_string(),
                currency: params
                    .get("params[orderCurrency]")
                    .cloned()
                    .unwrap_or_else(|| self.config.currency.clone()),
            });

        Ok(CallbackEvent {
            provider: ProviderName::Unitpay,
            outcome,
            invoice_id,
            payment_id: params.get("params[unitpayId]").cloned(),
            amount,
            recurring_token: params.get("params[subscriptionId]").cloned(),
            payload: params_to_json(params),
            received_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    fn success_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        self.page(params)
    }

    fn error_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
        self.page(params)
    }

    fn acknowledge(&self, event: &CallbackEvent) -> CallbackReply {
        let message = match event.outcome {
            CallbackOutcome::Check => "Check Success. Ready to pay.",
            _ => "Request successfully processed",
        };
        CallbackReply::Json {
            status: 200,
            body: serde_json::json!({ "result": { "message": message } }),
        }
    }

    fn reject(&self, reason: &str) -> CallbackReply {
        CallbackReply::Json {
            status: 200,
            body: serde_json::json!({ "error": { "message": reason } }),
        }
    }
}

/// `params[key]` entries keyed by the inner name, without the signature fields.
fn nested_params(params: &CallbackParams) -> BTreeMap<String, String> {
    params
        .iter()
        .filter_map(|(key, value)| {
            let inner = key.strip_prefix("params[")?.strip_suffix(']')?;
            if inner == "signature" || inner == "sign" {
                return None;
            }
            Some((inner.to_string(), value.clone()))
        })
        .collect()
}

pub fn map_payment_status(status: &str) -> PaymentState {
    match status {
        "success" => PaymentState::Success,
        "wait" | "secure" => PaymentState::Pending,
        "error" | "error_pay" | "error_check" => PaymentState::Failed,
        "refund" => PaymentState::Reversed,
        _ => PaymentState::Unknown,
    }
}

fn json_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct UnitpayEnvelope {
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<UnitpayApiError>,
}

#[derive(Debug, Deserialize)]
struct UnitpayApiError {
    message: String,
    #[serde(default)]
    code: Option<JsonValue>,
}

impl UnitpayEnvelope {
    fn into_result(self) -> PaymentResult<JsonValue> {
        if let Some(error) = self.error {
            return Err(PaymentError::ProviderError {
                provider: PROVIDER.to_string(),
                message: error.message,
                provider_code: error.code.as_ref().and_then(json_string),
                retryable: false,
            });
        }
        self.result
            .ok_or_else(|| PaymentError::provider(PROVIDER, "response has no result", false))
    }
}
