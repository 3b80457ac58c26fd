//! Backend confirmation of a store purchase: payment token, then activation.

use super::backend::BackendClient;
use crate::domain::classifier::classify;
use crate::domain::payment::{InAppPayload, Payment, PaymentTokenRequest, SubscriptionRequest};
use crate::domain::plan::micros_to_cents;
use crate::domain::processing::ProcessingEvent;
use crate::domain::purchase::{Product, PurchaseRecord};
use crate::error::BackendError;
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub purchase_token: String,
    pub token_request: PaymentTokenRequest,
    pub backend_plan_id: String,
}

impl VerificationRequest {
    /// Prices the purchase from the product's billing phase. A product without
    /// pricing bills zero in the default currency.
    pub fn new(
        purchase: &PurchaseRecord,
        product: &Product,
        customer_id: Option<&str>,
        payment_type: &str,
        backend_plan_id: &str,
    ) -> Self {
        let (micros, currency) = product
            .billing_phase()
            .map(|phase| (phase.price_amount_micros, phase.price_currency_code.clone()))
            .unwrap_or_else(|| (0, DEFAULT_CURRENCY.to_string()));

        let details = InAppPayload {
            purchase_token: purchase.purchase_token.clone(),
            customer_id: customer_id
                .or(purchase.obfuscated_account_id.as_deref())
                .unwrap_or_default()
                .to_string(),
            package_name: purchase.package_name.clone(),
            product_id: purchase.product_id.clone(),
            order_id: purchase.order_id.clone().unwrap_or_default(),
        };

        Self {
            purchase_token: purchase.purchase_token.clone(),
            token_request: PaymentTokenRequest {
                amount: micros_to_cents(micros),
                currency,
                payment_method_id: None,
                payment: Some(Payment {
                    kind: payment_type.to_string(),
                    details: Some(details),
                }),
            },
            backend_plan_id: backend_plan_id.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    #[error("network failure: {0}")]
    Network(String),
    #[error("{0}")]
    Rejected(String),
}

impl VerificationFailure {
    pub fn into_event(self) -> ProcessingEvent {
        match self {
            Self::Network(message) => ProcessingEvent::NetworkFailure(message),
            Self::Rejected(message) => ProcessingEvent::Rejected(message),
        }
    }

    fn from_token_error(err: &BackendError) -> Self {
        let info = classify(&err.cause());
        if info.is_network_error() {
            Self::Network(info.user_message().to_string())
        } else if let BackendError::Rejected(message) = err {
            Self::Rejected(message.clone())
        } else {
            Self::Rejected(info.user_message().to_string())
        }
    }

    fn from_activation_error(err: &BackendError) -> Self {
        let info = classify(&err.cause());
        if info.is_network_error() {
            Self::Network(info.user_message().to_string())
        } else {
            Self::Rejected(format!("Could not activate subscription: {err}"))
        }
    }
}

/// Runs both backend round-trips. Only a successful activation returns `Ok`.
pub async fn verify_purchase(
    backend: &BackendClient,
    request: &VerificationRequest,
) -> Result<(), VerificationFailure> {
    debug!(
        amount = request.token_request.amount,
        currency = %request.token_request.currency,
        "requesting payment token"
    );
    let response = backend
        .create_payment_token(&request.token_request)
        .await
        .map_err(|err| {
            warn!(error = %err, "payment token request failed");
            VerificationFailure::from_token_error(&err)
        })?;

    let Some(token) = response.extract_token() else {
        warn!("payment token missing from response");
        return Err(VerificationFailure::Rejected(
            "Payment token was not found in the server response".to_string(),
        ));
    };

    let subscription = SubscriptionRequest::new(
        token,
        &request.token_request.currency,
        &request.backend_plan_id,
    );
    backend
        .activate_subscription(&subscription)
        .await
        .map_err(|err| {
            warn!(error = %err, "subscription activation failed");
            VerificationFailure::from_activation_error(&err)
        })?;

    info!("subscription activated");
    Ok(())
}
