//! HTTP surface: authentication, purchase, status and provider callbacks

mod support;

use axum::body::{to_bytes, Body};
use axum::Router;
use http::{header, Request, StatusCode};
use matchpay::api::{router, ApiState};
use matchpay::database::transaction::TransactionStatus;
use matchpay::middleware::auth::JwtKeys;
use matchpay::payments::types::ProviderName;
use serde_json::{json, Value};
use support::*;
use tower::util::ServiceExt;

const SECRET: &str = "test-secret-with-at-least-32-bytes!!";

fn app(h: &Harness) -> (Router, JwtKeys) {
    let jwt = JwtKeys::from_secret(SECRET).expect("secret is long enough");
    let app = router(ApiState {
        payments: h.payments.clone(),
        jwt: jwt.clone(),
    });
    (app, jwt)
}

fn bearer(jwt: &JwtKeys, user_id: i64) -> String {
    format!("Bearer {}", jwt.issue(user_id, 3600).expect("token issued"))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

#[tokio::test]
async fn purchase_requires_a_bearer_token() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, _) = app(&h);

    let response = app
        .oneshot(post_json(
            "/payment/subscription",
            None,
            json!({"package_id": SUBSCRIPTION_PACKAGE}),
        ))
        .await
        .expect("request served");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "UNAUTHORIZED");
    assert_eq!(h.store.count(), 0);
}

#[tokio::test]
async fn purchase_then_status_round() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, jwt) = app(&h);
    let token = bearer(&jwt, BUYER);

    let response = app
        .clone()
        .oneshot(post_json(
            "/payment/service-package",
            Some(&token),
            json!({"package_id": SERVICE_PACKAGE, "banner_id": 5}),
        ))
        .await
        .expect("request served");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = body_json(response).await;
    assert_eq!(receipt["amount"], "90.00");
    assert_eq!(receipt["provider"], "robokassa");
    let invoice_id = receipt["invoice_id"].as_i64().expect("numeric invoice id");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/payment/status/{}", invoice_id))
                .header(header::AUTHORIZATION, &token)
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request served");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "pending");

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/payment/status/{}", invoice_id))
                .header(header::AUTHORIZATION, bearer(&jwt, OTHER_USER))
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request served");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_product_ids_are_bad_requests() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, jwt) = app(&h);

    let response = app
        .oneshot(post_json(
            "/payment/gift",
            Some(&bearer(&jwt, BUYER)),
            json!({"gift_id": 0, "recipient_id": OTHER_USER}),
        ))
        .await
        .expect("request served");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.store.count(), 0);
}

#[tokio::test]
async fn unpriced_package_is_not_found() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, jwt) = app(&h);

    let response = app
        .oneshot(post_json(
            "/payment/subscription",
            Some(&bearer(&jwt, BUYER)),
            json!({"package_id": 999}),
        ))
        .await
        .expect("request served");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "PRICE_NOT_FOUND");
}

#[tokio::test]
async fn robokassa_result_form_completes_the_purchase() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, jwt) = app(&h);

    let response = app
        .clone()
        .oneshot(post_json(
            "/payment/subscription",
            Some(&bearer(&jwt, BUYER)),
            json!({"package_id": SUBSCRIPTION_PACKAGE}),
        ))
        .await
        .expect("request served");
    let invoice_id = body_json(response).await["invoice_id"]
        .as_i64()
        .expect("numeric invoice id");

    let form = serde_urlencoded::to_string(robokassa_result(invoice_id, "499.00"))
        .expect("form encodes");
    let callback = || {
        Request::builder()
            .method("POST")
            .uri("/robokassa/result")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form.clone()))
            .expect("request builds")
    };

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(callback())
            .await
            .expect("request served");
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body readable");
        assert_eq!(body, format!("OK{}", invoice_id).as_bytes());
    }

    assert_eq!(
        h.store.get(invoice_id).status(),
        TransactionStatus::Succeeded
    );
    assert_eq!(h.store.fulfillments(), 1);
}

#[tokio::test]
async fn robokassa_result_with_query_params_and_bad_signature_is_refused() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, _) = app(&h);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/robokassa/result?OutSum=100.00&InvId=1&SignatureValue=deadbeef")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request served");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    assert_eq!(body, "bad sign".as_bytes());
}

#[tokio::test]
async fn callbacks_for_unknown_providers_are_not_found() {
    let h = Harness::new(ProviderName::Robokassa);
    let (app, _) = app(&h);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/paypal/result?foo=bar")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request served");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
