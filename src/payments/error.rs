use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Payment declined: {message}")]
    PaymentDeclinedError {
        message: String,
        provider_code: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Timeout: {provider} did not answer within {timeout_secs}s")]
    TimeoutError { provider: String, timeout_secs: u64 },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn provider(provider: &str, message: impl Into<String>, retryable: bool) -> Self {
        PaymentError::ProviderError {
            provider: provider.to_string(),
            message: message.into(),
            provider_code: None,
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::PaymentDeclinedError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::TimeoutError { .. } => true,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            PaymentError::ValidationError { .. } => 400,
            PaymentError::PaymentDeclinedError { .. } => 402,
            PaymentError::NetworkError { .. } => 503,
            PaymentError::RateLimitError { .. } => 429,
            PaymentError::TimeoutError { .. } => 504,
            PaymentError::ProviderError { .. } => 502,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::PaymentDeclinedError { .. } => {
                "Payment was declined by the provider".to_string()
            }
            PaymentError::NetworkError { .. } => {
                "Payment provider is temporarily unavailable".to_string()
            }
            PaymentError::RateLimitError { .. } => {
                "Too many requests to payment provider. Please retry shortly".to_string()
            }
            PaymentError::TimeoutError { .. } => {
                "Payment provider did not respond in time".to_string()
            }
            PaymentError::ProviderError { .. } => "Payment provider returned an error".to_string(),
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match err {
            PaymentError::ValidationError { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            PaymentError::RateLimitError {
                retry_after_seconds,
                ..
            } => AppErrorKind::External(ExternalError::RateLimit {
                service: "payment provider".to_string(),
                retry_after: retry_after_seconds,
            }),
            PaymentError::TimeoutError {
                provider,
                timeout_secs,
            } => AppErrorKind::External(ExternalError::Timeout {
                service: provider,
                timeout_secs,
            }),
            PaymentError::ProviderError {
                provider,
                message,
                retryable,
                ..
            } => AppErrorKind::External(ExternalError::PaymentProvider {
                provider,
                message,
                is_retryable: retryable,
            }),
            other => AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "payments".to_string(),
                is_retryable: other.is_retryable(),
                message: other.to_string(),
            }),
        };

        AppError::new(kind)
    }
}
