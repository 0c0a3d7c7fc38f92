//! Authenticated purchase and status endpoints

use super::{tag_request, ApiState};
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::services::{Product, PurchaseReceipt, PurchaseRequest, TransactionView};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SubscriptionPurchaseBody {
    pub package_id: i64,
    #[serde(default)]
    pub recurring: bool,
    pub banner_id: Option<i64>,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServicePackagePurchaseBody {
    pub package_id: i64,
    pub banner_id: Option<i64>,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GiftPurchaseBody {
    pub gift_id: i64,
    pub recipient_id: i64,
    pub banner_id: Option<i64>,
    pub provider: Option<String>,
}

/// POST /payment/subscription
pub async fn purchase_subscription(
    State(state): State<ApiState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(body): Json<SubscriptionPurchaseBody>,
) -> AppResult<Json<PurchaseReceipt>> {
    require_positive("package_id", body.package_id).map_err(|e| tag_request(&headers, e))?;
    let product = Product::Subscription {
        package_id: body.package_id,
        recurring: body.recurring,
    };
    purchase(&state, user, &headers, product, body.banner_id, body.provider).await
}

/// POST /payment/service-package
pub async fn purchase_service_package(
    State(state): State<ApiState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(body): Json<ServicePackagePurchaseBody>,
) -> AppResult<Json<PurchaseReceipt>> {
    require_positive("package_id", body.package_id).map_err(|e| tag_request(&headers, e))?;
    let product = Product::ServicePackage {
        package_id: body.package_id,
    };
    purchase(&state, user, &headers, product, body.banner_id, body.provider).await
}

/// POST /payment/gift
pub async fn purchase_gift(
    State(state): State<ApiState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(body): Json<GiftPurchaseBody>,
) -> AppResult<Json<PurchaseReceipt>> {
    require_positive("gift_id", body.gift_id).map_err(|e| tag_request(&headers, e))?;
    require_positive("recipient_id", body.recipient_id).map_err(|e| tag_request(&headers, e))?;
    let product = Product::Gift {
        gift_id: body.gift_id,
        recipient_id: body.recipient_id,
    };
    purchase(&state, user, &headers, product, body.banner_id, body.provider).await
}

/// GET /payment/status/{id}
pub async fn payment_status(
    State(state): State<ApiState>,
    user: AuthUser,
    headers: HeaderMap,
    Path(invoice_id): Path<i64>,
) -> AppResult<Json<TransactionView>> {
    let view = state
        .payments
        .status(user.user_id, invoice_id)
        .await
        .map_err(|e| tag_request(&headers, e))?;
    Ok(Json(view))
}

async fn purchase(
    state: &ApiState,
    user: AuthUser,
    headers: &HeaderMap,
    product: Product,
    banner_id: Option<i64>,
    provider: Option<String>,
) -> AppResult<Json<PurchaseReceipt>> {
    let receipt = state
        .payments
        .purchase(
            user.user_id,
            PurchaseRequest {
                product,
                banner_id,
                provider,
                customer_ip: client_ip(headers),
            },
        )
        .await
        .map_err(|e| tag_request(headers, e))?;

    info!(
        user_id = user.user_id,
        invoice_id = receipt.invoice_id,
        provider = %receipt.provider,
        "purchase initiated"
    );
    Ok(Json(receipt))
}

fn require_positive(field: &str, value: i64) -> AppResult<()> {
    if value <= 0 {
        return Err(AppError::validation(field, "must be a positive id"));
    }
    Ok(())
}

/// First hop of `x-forwarded-for`, else `x-real-ip`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}
