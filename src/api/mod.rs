//! HTTP routes for purchases, status queries and provider callbacks

pub mod callbacks;
pub mod payments;

use crate::error::AppError;
use crate::middleware::auth::JwtKeys;
use crate::middleware::error::get_request_id_from_headers;
use crate::services::PaymentsService;
use axum::{
    extract::FromRef,
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub payments: Arc<PaymentsService>,
    pub jwt: JwtKeys,
}

impl FromRef<ApiState> for JwtKeys {
    fn from_ref(state: &ApiState) -> Self {
        state.jwt.clone()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/payment/subscription",
            post(payments::purchase_subscription),
        )
        .route(
            "/payment/service-package",
            post(payments::purchase_service_package),
        )
        .route("/payment/gift", post(payments::purchase_gift))
        .route("/payment/status/{id}", get(payments::payment_status))
        .route(
            "/{provider}/result",
            get(callbacks::provider_result).post(callbacks::provider_result),
        )
        .route(
            "/{provider}/success",
            get(callbacks::success_page).post(callbacks::success_page),
        )
        .route(
            "/{provider}/fail",
            get(callbacks::fail_page).post(callbacks::fail_page),
        )
        .with_state(state)
}

/// Tags an error with the caller's `x-request-id`, when present.
pub(crate) fn tag_request<E: Into<AppError>>(headers: &HeaderMap, err: E) -> AppError {
    let err = err.into();
    match get_request_id_from_headers(headers) {
        Some(request_id) => err.with_request_id(request_id),
        None => err,
    }
}
