//! Request logging middleware and request id generation

use axum::{extract::Request, middleware::Next, response::Response};
use http::HeaderValue;
use std::future::Future;
use std::time::Instant;
use tower_http::request_id::{MakeRequestId, RequestId};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Generates a UUID v4 `x-request-id` for requests that arrive without one.
#[derive(Clone, Copy, Default)]
pub struct UuidRequestId;

impl MakeRequestId for UuidRequestId {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Wraps each request in a span carrying the request id and logs its outcome.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
    );

    async move {
        let started = Instant::now();
        let response = next.run(request).await;
        let status = response.status().as_u16();
        let latency_ms = started.elapsed().as_millis() as u64;

        if response.status().is_server_error() {
            error!(status, latency_ms, "request failed");
        } else if response.status().is_client_error() {
            warn!(status, latency_ms, "request rejected");
        } else {
            info!(status, latency_ms, "request completed");
        }
        response
    }
    .instrument(span)
    .await
}

/// Times an outbound provider call and logs its outcome.
pub async fn log_external_call<F, T, E>(service: &str, operation: &str, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let result = call.await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(service, operation, latency_ms, "external call succeeded"),
        Err(e) => warn!(service, operation, latency_ms, error = %e, "external call failed"),
    }
    result
}
