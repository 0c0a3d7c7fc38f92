//! Unified error handling for the payments backend
//!
//! Module errors (payments, pricing, database) convert into [`AppError`],
//! which carries the HTTP status mapping, a machine-readable [`ErrorCode`] and
//! a user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "TRANSACTION_NOT_FOUND")]
    TransactionNotFound,
    #[serde(rename = "PRICE_NOT_FOUND")]
    PriceNotFound,
    #[serde(rename = "USER_NOT_FOUND")]
    UserNotFound,
    #[serde(rename = "PROVIDER_NOT_FOUND")]
    ProviderNotFound,
    #[serde(rename = "INVALID_AMOUNT")]
    InvalidAmount,

    // Authentication (401)
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimitError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// No transaction with this invoice id is visible to the caller
    TransactionNotFound { invoice_id: i64 },
    /// No price configured for the requested package or gift
    PriceNotFound { product: String },
    UserNotFound { user_id: i64 },
    /// Callback route named a provider that is unknown or disabled
    ProviderNotFound { provider: String },
    /// Computed price is not a positive amount
    InvalidAmount { amount: String, reason: String },
}

/// Infrastructure-level errors
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
}

/// External service errors (payment providers)
#[derive(Debug, Clone)]
pub enum ExternalError {
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidField { field: String, reason: String },
    MissingField { field: String },
}

#[derive(Debug, Clone)]
pub enum AuthenticationError {
    MissingToken,
    InvalidToken { reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
    Authentication(AuthenticationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Authentication(
            AuthenticationError::InvalidToken {
                reason: reason.into(),
            },
        ))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => 404,
                DomainError::PriceNotFound { .. } => 404,
                DomainError::UserNotFound { .. } => 404,
                DomainError::ProviderNotFound { .. } => 404,
                DomainError::InvalidAmount { .. } => 422,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => {
                    if *is_retryable {
                        503
                    } else {
                        502
                    }
                }
                ExternalError::RateLimit { .. } => 429,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
            AppErrorKind::Authentication(_) => 401,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
                DomainError::PriceNotFound { .. } => ErrorCode::PriceNotFound,
                DomainError::UserNotFound { .. } => ErrorCode::UserNotFound,
                DomainError::ProviderNotFound { .. } => ErrorCode::ProviderNotFound,
                DomainError::InvalidAmount { .. } => ErrorCode::InvalidAmount,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::RateLimit { .. } => ErrorCode::RateLimitError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
            AppErrorKind::Authentication(_) => ErrorCode::Unauthorized,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::TransactionNotFound { invoice_id } => {
                    format!("Transaction '{}' not found", invoice_id)
                }
                DomainError::PriceNotFound { product } => {
                    format!("No price is configured for {}", product)
                }
                DomainError::UserNotFound { user_id } => format!("User '{}' not found", user_id),
                DomainError::ProviderNotFound { provider } => {
                    format!("Payment provider '{}' is not available", provider)
                }
                DomainError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider {
                    provider,
                    is_retryable,
                    ..
                } => {
                    if *is_retryable {
                        format!(
                            "Payment provider ({}) is temporarily unavailable. Please try again",
                            provider
                        )
                    } else {
                        "Payment processing failed. Please contact support".to_string()
                    }
                }
                ExternalError::RateLimit {
                    service,
                    retry_after,
                } => match retry_after {
                    Some(secs) => format!(
                        "Rate limit exceeded for {}. Please try again in {} seconds",
                        service, secs
                    ),
                    None => format!("Rate limit exceeded for {}. Please try again later", service),
                },
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
            },
            AppErrorKind::Authentication(err) => match err {
                AuthenticationError::MissingToken => "Authentication required".to_string(),
                AuthenticationError::InvalidToken { .. } => {
                    "Invalid or expired access token".to_string()
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::RateLimit { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
            AppErrorKind::Authentication(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// Conversions from module errors live next to those errors
// (payments/error.rs, database/error.rs, services/*).

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
