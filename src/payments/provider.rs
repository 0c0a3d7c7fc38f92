use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CallbackEvent, CallbackParams, CallbackReply, CallbackVerification, PaymentRequest,
    PaymentResponse, ProviderName, RecurringRequest, RedirectResult, StatusRequest,
    StatusResponse,
};
use async_trait::async_trait;

/// Contract every payment provider driver implements.
///
/// Drivers never touch storage: the caller persists the pending transaction
/// before `payment`/`recurrent` is invoked and applies state transitions after
/// a callback has been verified and parsed.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    /// Builds the confirmation (redirect) URL for a one-off or first recurring payment.
    async fn payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse>;

    /// Charges an existing recurring agreement without user interaction.
    async fn recurrent(&self, request: RecurringRequest) -> PaymentResult<PaymentResponse>;

    async fn payment_status(&self, request: StatusRequest) -> PaymentResult<StatusResponse>;

    /// Signature check of a server-to-server result callback.
    fn validate(&self, params: &CallbackParams) -> PaymentResult<CallbackVerification>;

    fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackEvent>;

    fn success_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult>;

    fn error_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult>;

    fn acknowledge(&self, event: &CallbackEvent) -> CallbackReply;

    fn reject(&self, reason: &str) -> CallbackReply;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{
        params_to_json, required_invoice_id, CallbackOutcome, Money, PaymentState,
    };

    struct MockProvider;

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn name(&self) -> ProviderName {
            ProviderName::Robokassa
        }

        async fn payment(&self, request: PaymentRequest) -> PaymentResult<PaymentResponse> {
            Ok(PaymentResponse {
                status: PaymentState::Pending,
                invoice_id: request.invoice_id,
                payment_id: Some(request.invoice_id.to_string()),
                confirmation_url: Some("https://example.com/pay".to_string()),
                created_at: chrono::Utc::now(),
                provider_data: None,
            })
        }

        async fn recurrent(&self, request: RecurringRequest) -> PaymentResult<PaymentResponse> {
            Ok(PaymentResponse {
                status: PaymentState::Processing,
                invoice_id: request.invoice_id,
                payment_id: None,
                confirmation_url: None,
                created_at: chrono::Utc::now(),
                provider_data: None,
            })
        }

        async fn payment_status(&self, request: StatusRequest) -> PaymentResult<StatusResponse> {
            Ok(StatusResponse {
                status: PaymentState::Success,
                invoice_id: request.invoice_id,
                payment_id: request.payment_id,
                amount: None,
                provider_code: Some("100".to_string()),
                recurring_token: None,
                provider_data: None,
            })
        }

        fn validate(&self, _params: &CallbackParams) -> PaymentResult<CallbackVerification> {
            Ok(CallbackVerification::valid())
        }

        fn parse_callback(&self, params: &CallbackParams) -> PaymentResult<CallbackEvent> {
            Ok(CallbackEvent {
                provider: self.name(),
                outcome: CallbackOutcome::Paid,
                invoice_id: required_invoice_id(params, "InvId")?,
                payment_id: None,
                amount: params.get("OutSum").map(|v| Money {
                    amount: v.clone(),
                    currency: "RUB".to_string(),
                }),
                recurring_token: None,
                payload: params_to_json(params),
                received_at: chrono::Utc::now().to_rfc3339(),
            })
        }

        fn success_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
            Ok(RedirectResult {
                provider: self.name(),
                invoice_id: required_invoice_id(params, "InvId")?,
                verified: false,
            })
        }

        fn error_page(&self, params: &CallbackParams) -> PaymentResult<RedirectResult> {
            self.success_page(params)
        }

        fn acknowledge(&self, event: &CallbackEvent) -> CallbackReply {
            CallbackReply::Text {
                status: 200,
                body: format!("OK{}", event.invoice_id),
            }
        }

        fn reject(&self, reason: &str) -> CallbackReply {
            CallbackReply::Text {
                status: 400,
                body: reason.to_string(),
            }
        }
    }

    #[tokio::test]
    async fn trait_objects_drive_a_full_payment_round() {
        let provider: Box<dyn PaymentProvider> = Box::new(MockProvider);
        let response = provider
            .payment(PaymentRequest {
                invoice_id: 7,
                amount: Money {
                    amount: "100.00".to_string(),
                    currency: "RUB".to_string(),
                },
                description: "Subscription".to_string(),
                recurring: false,
                customer_ip: None,
                custom_fields: Default::default(),
            })
            .await
            .expect("payment should succeed");
        assert_eq!(response.status, PaymentState::Pending);
        assert_eq!(response.payment_id.as_deref(), Some("7"));

        let mut params = CallbackParams::new();
        params.insert("InvId".to_string(), "7".to_string());
        params.insert("OutSum".to_string(), "100.00".to_string());
        let event = provider.parse_callback(&params).expect("callback parses");
        assert_eq!(
            provider.acknowledge(&event),
            CallbackReply::Text {
                status: 200,
                body: "OK7".to_string()
            }
        );
    }
}
