use crate::middleware::logging::log_external_call;
use crate::payments::error::{PaymentError, PaymentResult};
use md5::Md5;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256, Sha512};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Thin wrapper over `reqwest` shared by the provider drivers.
///
/// Requests are sent once. A failed call surfaces as a typed [`PaymentError`]
/// and recovery is left to the status reconciler.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: &'static str,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(provider: &'static str, timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider,
            timeout,
        })
    }

    /// GET `url` with `query` appended and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> PaymentResult<T> {
        let url = build_url(url, query)?;
        let operation = url.path().to_string();
        let text = self.send(&operation, self.client.get(url)).await?;
        serde_json::from_str::<T>(&text).map_err(|e| PaymentError::ProviderError {
            provider: self.provider.to_string(),
            message: format!("invalid provider JSON response: {}", e),
            provider_code: None,
            retryable: false,
        })
    }

    /// GET `url` with `query` appended and return the raw body.
    pub async fn get_text(&self, url: &str, query: &[(String, String)]) -> PaymentResult<String> {
        let url = build_url(url, query)?;
        let operation = url.path().to_string();
        self.send(&operation, self.client.get(url)).await
    }

    /// POST an `application/x-www-form-urlencoded` body and return the raw response.
    pub async fn post_form_text(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> PaymentResult<String> {
        let body = serde_urlencoded::to_string(form).map_err(|e| PaymentError::ValidationError {
            message: format!("failed to encode form body: {}", e),
            field: None,
        })?;
        let operation = build_url(url, &[])?.path().to_string();
        let request = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body);
        self.send(&operation, request).await
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> PaymentResult<String> {
        log_external_call(self.provider, operation, self.dispatch(request)).await
    }

    async fn dispatch(&self, request: reqwest::RequestBuilder) -> PaymentResult<String> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error("request failed", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error("response could not be read", e))?;
        debug!(provider = self.provider, status = %status, "provider responded");

        if status.is_success() {
            return Ok(text);
        }

        if status.as_u16() == 429 {
            return Err(PaymentError::RateLimitError {
                message: format!("{} rate limit exceeded", self.provider),
                retry_after_seconds: None,
            });
        }

        warn!(provider = self.provider, status = %status, "provider returned an error status");
        Err(PaymentError::ProviderError {
            provider: self.provider.to_string(),
            message: format!("HTTP {}: {}", status, text),
            provider_code: Some(status.as_u16().to_string()),
            retryable: status.is_server_error(),
        })
    }

    fn transport_error(&self, what: &str, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() {
            warn!(provider = self.provider, timeout = ?self.timeout, "provider call timed out");
            return PaymentError::TimeoutError {
                provider: self.provider.to_string(),
                timeout_secs: self.timeout.as_secs(),
            };
        }
        PaymentError::NetworkError {
            message: format!("{} {}: {}", self.provider, what, err),
        }
    }
}

pub fn build_url(base: &str, query: &[(String, String)]) -> PaymentResult<Url> {
    Url::parse_with_params(base, query).map_err(|e| PaymentError::ValidationError {
        message: format!("invalid provider URL {}: {}", base, e),
        field: Some("url".to_string()),
    })
}

/// Digest used for Robokassa signatures; Unitpay always uses SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Md5 => "md5",
            SignatureAlgorithm::Sha256 => "sha256",
            SignatureAlgorithm::Sha512 => "sha512",
        }
    }

    /// Lowercase hex digest of `input`.
    pub fn hex_digest(&self, input: &str) -> String {
        match self {
            SignatureAlgorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
            SignatureAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
            SignatureAlgorithm::Sha512 => hex::encode(Sha512::digest(input.as_bytes())),
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "md5" => Ok(SignatureAlgorithm::Md5),
            "sha256" => Ok(SignatureAlgorithm::Sha256),
            "sha512" => Ok(SignatureAlgorithm::Sha512),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported hash algorithm: {}", value),
                field: Some("hash_algorithm".to_string()),
            }),
        }
    }
}

/// Case-insensitive, constant-time comparison of two hex digests.
pub fn verify_hex_signature(expected: &str, provided: &str) -> bool {
    let expected = expected.trim().to_ascii_lowercase();
    let provided = provided.trim().to_ascii_lowercase();
    secure_eq(expected.as_bytes(), provided.as_bytes())
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
