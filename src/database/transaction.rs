//! Purchase transaction entity

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a purchase. Only `Pending -> Succeeded` and
/// `Pending -> Canceled` exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Canceled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown transaction status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductType {
    Subscription,
    ServicePackage,
    Gift,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::ServicePackage => "service_package",
            Self::Gift => "gift",
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProductType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "service_package" => Ok(Self::ServicePackage),
            "gift" => Ok(Self::Gift),
            other => Err(format!("unknown product type '{}'", other)),
        }
    }
}

/// Row of the `transactions` table. `id` doubles as the provider invoice id.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub product_type: String,
    pub product_id: i64,
    pub recipient_id: Option<i64>,
    pub price: BigDecimal,
    pub currency: String,
    pub status: String,
    pub provider: String,
    pub payment_id: Option<String>,
    pub recurring: bool,
    pub parent_id: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub purchased_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Parsed status; unknown values read as pending so they stay visible to reconciliation.
    pub fn status(&self) -> TransactionStatus {
        self.status.parse().unwrap_or(TransactionStatus::Pending)
    }

    pub fn product_type(&self) -> Option<ProductType> {
        self.product_type.parse().ok()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TransactionStatus::Pending
    }

    /// Provider-side recurring token recorded by a callback, if any.
    pub fn recurring_token(&self) -> Option<&str> {
        self.metadata.get("recurring_token").and_then(|v| v.as_str())
    }

    /// Buyer IP recorded at purchase time.
    pub fn customer_ip(&self) -> Option<&str> {
        self.metadata.get("customer_ip").and_then(|v| v.as_str())
    }
}

/// Values for a new pending transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: i64,
    pub product_type: ProductType,
    pub product_id: i64,
    pub recipient_id: Option<i64>,
    pub price: BigDecimal,
    pub currency: String,
    pub provider: String,
    pub recurring: bool,
    pub parent_id: Option<i64>,
    pub metadata: serde_json::Value,
}

/// Result of a conditional `pending -> terminal` update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row was pending and now carries the target status.
    Applied,
    /// The row was already terminal; the current status is reported back.
    Unchanged(TransactionStatus),
}
