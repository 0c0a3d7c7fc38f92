//! Provider-facing routes: result callbacks and user redirects
//!
//! Providers send parameters either in the query string or as a form body;
//! both are merged, with body values taking precedence.

use super::{tag_request, ApiState};
use crate::error::{AppError, AppResult};
use crate::payments::types::{CallbackParams, CallbackReply};
use crate::services::PageResult;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

impl IntoResponse for CallbackReply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::OK);
        match self {
            CallbackReply::Text { body, .. } => (status, body).into_response(),
            CallbackReply::Json { body, .. } => (status, Json(body)).into_response(),
        }
    }
}

/// GET|POST /{provider}/result
pub async fn provider_result(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackParams>,
    headers: HeaderMap,
    body: String,
) -> AppResult<CallbackReply> {
    let params = merge_params(query, &body).map_err(|e| tag_request(&headers, e))?;
    info!(provider = %provider, fields = params.len(), "result callback received");

    state
        .payments
        .handle_result(&provider, &params)
        .await
        .map_err(|e| tag_request(&headers, e))
}

/// GET|POST /{provider}/success
pub async fn success_page(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackParams>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<PageResult>> {
    let params = merge_params(query, &body).map_err(|e| tag_request(&headers, e))?;
    let page = state
        .payments
        .handle_success_page(&provider, &params)
        .await
        .map_err(|e| tag_request(&headers, e))?;
    Ok(Json(page))
}

/// GET|POST /{provider}/fail
pub async fn fail_page(
    State(state): State<ApiState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackParams>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<PageResult>> {
    let params = merge_params(query, &body).map_err(|e| tag_request(&headers, e))?;
    let page = state
        .payments
        .handle_fail_page(&provider, &params)
        .await
        .map_err(|e| tag_request(&headers, e))?;
    Ok(Json(page))
}

fn merge_params(mut params: CallbackParams, body: &str) -> AppResult<CallbackParams> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(params);
    }
    let form: Vec<(String, String)> = serde_urlencoded::from_str(body)
        .map_err(|e| AppError::validation("body", format!("malformed form body: {}", e)))?;
    params.extend(form);
    Ok(params)
}
