use crate::payments::error::PaymentError;
use bigdecimal::{BigDecimal, RoundingMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Raw key/value pairs received from a provider (query string or form body).
pub type CallbackParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Robokassa,
    Unitpay,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Robokassa => "robokassa",
            ProviderName::Unitpay => "unitpay",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "robokassa" => Ok(ProviderName::Robokassa),
            "unitpay" => Ok(ProviderName::Unitpay),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

/// Amount in major currency units, always rendered with two decimals.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: String,
    pub currency: String,
}

impl Money {
    pub fn from_decimal(amount: &BigDecimal, currency: impl Into<String>) -> Self {
        Self {
            amount: amount.with_scale_round(2, RoundingMode::HalfUp).to_string(),
            currency: currency.into(),
        }
    }

    pub fn to_decimal(&self) -> Result<BigDecimal, PaymentError> {
        BigDecimal::from_str(self.amount.trim()).map_err(|_| PaymentError::ValidationError {
            message: format!("invalid decimal amount: {}", self.amount),
            field: Some("amount".to_string()),
        })
    }

    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        let parsed = self.to_decimal().map_err(|_| PaymentError::ValidationError {
            message: format!("invalid decimal amount: {}", self.amount),
            field: Some(field.to_string()),
        })?;
        if parsed <= BigDecimal::from(0) {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        if self.currency.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "currency is required".to_string(),
                field: Some("currency".to_string()),
            });
        }
        Ok(())
    }

    /// Compares by value, so `100`, `100.0` and `100.00` are the same amount.
    pub fn matches(&self, other: &BigDecimal) -> bool {
        self.to_decimal().map(|v| &v == other).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Processing,
    Success,
    Failed,
    Cancelled,
    Reversed,
    Unknown,
}

impl PaymentState {
    pub fn is_final_failure(&self) -> bool {
        matches!(
            self,
            PaymentState::Failed | PaymentState::Cancelled | PaymentState::Reversed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub invoice_id: i64,
    pub amount: Money,
    pub description: String,
    /// Asks the provider to set up a recurring agreement with this first charge.
    pub recurring: bool,
    pub customer_ip: Option<String>,
    /// Extra pass-through fields (`Shp_*` for Robokassa).
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringRequest {
    pub invoice_id: i64,
    pub parent_invoice_id: i64,
    pub parent_payment_id: Option<String>,
    /// Provider-side agreement handle captured when the parent was paid.
    pub recurring_token: Option<String>,
    pub amount: Money,
    pub description: String,
    pub customer_ip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub status: PaymentState,
    pub invoice_id: i64,
    pub payment_id: Option<String>,
    pub confirmation_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequest {
    pub invoice_id: i64,
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: PaymentState,
    pub invoice_id: i64,
    pub payment_id: Option<String>,
    pub amount: Option<Money>,
    pub provider_code: Option<String>,
    pub recurring_token: Option<String>,
    pub provider_data: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackVerification {
    pub valid: bool,
    pub reason: Option<String>,
}

impl CallbackVerification {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    /// Pre-payment check: the provider asks whether the invoice may be paid.
    Check,
    Paid,
    Failed,
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub provider: ProviderName,
    pub outcome: CallbackOutcome,
    pub invoice_id: i64,
    pub payment_id: Option<String>,
    pub amount: Option<Money>,
    pub recurring_token: Option<String>,
    pub payload: JsonValue,
    pub received_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectResult {
    pub provider: ProviderName,
    pub invoice_id: i64,
    /// Whether the redirect parameters carried a valid signature.
    pub verified: bool,
}

/// Provider specific response to a server-to-server callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackReply {
    Text { status: u16, body: String },
    Json { status: u16, body: JsonValue },
}

impl CallbackReply {
    pub fn status(&self) -> u16 {
        match self {
            CallbackReply::Text { status, .. } | CallbackReply::Json { status, .. } => *status,
        }
    }
}

/// Converts a callback map into a JSON object for storage in transaction metadata.
pub fn params_to_json(params: &CallbackParams) -> JsonValue {
    JsonValue::Object(
        params
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    )
}

/// Reads a required integer invoice id from the callback map.
pub fn required_invoice_id(params: &CallbackParams, key: &str) -> Result<i64, PaymentError> {
    let raw = params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::ValidationError {
            message: format!("{} is required", key),
            field: Some(key.to_string()),
        })?;
    raw.parse::<i64>().map_err(|_| PaymentError::ValidationError {
        message: format!("{} must be an integer invoice id", key),
        field: Some(key.to_string()),
    })
}
