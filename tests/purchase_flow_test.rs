mod common;

use billing_core::application::manager::{MISSING_PRODUCT, NOT_CONNECTED, OFFER_UNAVAILABLE, PLAN_NOT_FOUND};
use billing_core::domain::classifier::FailureCause;
use billing_core::domain::payment::BackendFunction;
use billing_core::domain::ports::BillingGateway;
use billing_core::domain::processing::PaymentProcessingState;
use billing_core::domain::purchase::PurchaseState;
use billing_core::error::{StoreFailure, StoreResponseCode};
use billing_core::infrastructure::in_memory::SurfaceReply;
use common::*;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_purchase_is_verified_and_activated() {
    let harness = Harness::new();
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;

    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));
    assert_eq!(
        harness.surface.calls(),
        vec![BackendFunction::PaymentToken, BackendFunction::Subscription]
    );

    let token_request = &harness.surface.payloads(BackendFunction::PaymentToken)[0];
    assert_eq!(token_request["Amount"], json!(999));
    assert_eq!(token_request["Currency"], json!("USD"));
    assert_eq!(token_request["Payment"]["Type"], json!("google"));
    let details = &token_request["Payment"]["Details"];
    assert_eq!(details["purchaseToken"], json!("purchase-token-1"));
    assert_eq!(details["customerID"], json!(ACCOUNT));
    assert_eq!(details["productID"], json!(MONTHLY));

    let activation = &harness.surface.payloads(BackendFunction::Subscription)[0];
    assert_eq!(activation["PaymentToken"], json!("payment-token-1"));
    assert_eq!(activation["Plans"], json!({"plus2024": 1}));
    assert_eq!(activation["Cycle"], json!(1));

    assert_eq!(gateway.purchase_state(), PurchaseState::Purchased);
    let status = gateway.subscription_status();
    assert!(status.is_active);
    assert!(status.is_auto_renewing);
    eventually(|| harness.store.ack_count("purchase-token-1") == 1).await;
    assert_eq!(harness.backend.registry().pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_annual_plan_bills_in_cents() {
    let harness = Harness::new();
    let gateway = harness.connected().await;

    harness.buy(&gateway, ANNUAL).await;

    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));
    let token_request = &harness.surface.payloads(BackendFunction::PaymentToken)[0];
    assert_eq!(token_request["Amount"], json!(9999));
}

#[tokio::test(start_paused = true)]
async fn test_backend_rejection_keeps_message() {
    let harness = Harness::new();
    harness.surface.push_reply(
        BackendFunction::PaymentToken,
        SurfaceReply::Reject("Invalid purchase token".to_string()),
    );
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;

    assert_eq!(
        settled(&gateway).await,
        Some(PaymentProcessingState::Error("Invalid purchase token".to_string()))
    );
    assert_eq!(harness.surface.calls(), vec![BackendFunction::PaymentToken]);
    // The store purchase stays confirmed even though the backend refused it.
    assert_eq!(gateway.purchase_state(), PurchaseState::Purchased);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_rejection_reverifies() {
    let harness = Harness::new();
    harness.surface.push_reply(
        BackendFunction::PaymentToken,
        SurfaceReply::Reject("Invalid purchase token".to_string()),
    );
    let gateway = harness.connected().await;
    harness.buy(&gateway, MONTHLY).await;
    assert!(matches!(settled(&gateway).await, Some(PaymentProcessingState::Error(_))));

    gateway.retry_verification();
    gateway.flush().await.unwrap();

    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));
    assert_eq!(harness.surface.payloads(BackendFunction::PaymentToken).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_success_does_not_reactivate() {
    let harness = Harness::new();
    let gateway = harness.connected().await;
    harness.buy(&gateway, MONTHLY).await;
    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));

    gateway.retry_verification();
    gateway.flush().await.unwrap();
    wait_refreshed(&gateway).await;

    assert_eq!(*gateway.processing_state().borrow(), Some(PaymentProcessingState::Success));
    assert_eq!(
        harness.surface.calls(),
        vec![BackendFunction::PaymentToken, BackendFunction::Subscription]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_while_idle_is_ignored() {
    let harness = Harness::new();
    harness.store.set_purchases(vec![owned(MONTHLY, "owned-1")]);
    let gateway = harness.connected().await;

    gateway.retry_verification();
    gateway.flush().await.unwrap();

    assert_eq!(*gateway.processing_state().borrow(), None);
    assert_eq!(harness.store.query_count(), 1);
    assert!(harness.surface.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_backend_is_a_network_error() {
    let harness = Harness::new();
    harness.surface.push_reply(
        BackendFunction::PaymentToken,
        SurfaceReply::Fail(FailureCause::ConnectionRefused("connection refused".to_string())),
    );
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;

    assert_eq!(
        settled(&gateway).await,
        Some(PaymentProcessingState::NetworkError(
            "Could not connect to the server. Please try again.".to_string()
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn test_activation_failure_is_an_error() {
    let harness = Harness::new();
    harness.surface.push_reply(
        BackendFunction::Subscription,
        SurfaceReply::Reject("plan is closed".to_string()),
    );
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;

    assert_eq!(
        settled(&gateway).await,
        Some(PaymentProcessingState::Error(
            "Could not activate subscription: plan is closed".to_string()
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_backend_times_out_into_network_error() {
    let harness = Harness::new();
    harness
        .surface
        .push_reply(BackendFunction::PaymentToken, SurfaceReply::Silent);
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;
    wait_processing(&gateway, |state| *state == Some(PaymentProcessingState::Verifying)).await;

    // In flight: the close affordance stays blocked.
    assert!(!gateway.reset_processing_state());
    assert_eq!(
        *gateway.processing_state().borrow(),
        Some(PaymentProcessingState::Verifying)
    );

    assert_eq!(
        settled(&gateway).await,
        Some(PaymentProcessingState::NetworkError(
            "The request timed out. Please try again.".to_string()
        ))
    );
    assert_eq!(harness.backend.registry().pending_count().await, 0);

    assert!(gateway.reset_processing_state());
    gateway.flush().await.unwrap();
    assert_eq!(*gateway.processing_state().borrow(), None);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_callback_is_dropped() {
    let harness = Harness::new();
    harness
        .surface
        .push_reply(BackendFunction::PaymentToken, SurfaceReply::Duplicate);
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;

    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));
    eventually(|| harness.surface.dropped_callbacks() == 1).await;
    assert_eq!(harness.surface.payloads(BackendFunction::Subscription).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_purchase_is_acknowledged_once() {
    let harness = Harness::new();
    let gateway = harness.connected().await;
    harness.buy(&gateway, MONTHLY).await;
    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));
    eventually(|| harness.store.ack_count("purchase-token-1") == 1).await;

    let mut record = harness.store.purchases()[0].clone();
    record.acknowledged = false;
    assert!(harness.store.deliver_purchase(record));
    gateway.flush().await.unwrap();
    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));

    assert_eq!(harness.store.ack_count("purchase-token-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ack_failure_does_not_regress_purchase() {
    let harness = Harness::new();
    harness.store.fail_acknowledge(Some(StoreFailure::new(
        StoreResponseCode::Error,
        "acknowledge failed",
    )));
    let gateway = harness.connected().await;

    harness.buy(&gateway, MONTHLY).await;

    assert_eq!(settled(&gateway).await, Some(PaymentProcessingState::Success));
    assert_eq!(gateway.purchase_state(), PurchaseState::Purchased);
    assert!(gateway.subscription_status().is_active);
    assert!(harness.store.ack_count("purchase-token-1") >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_launch_preconditions() {
    let harness = Harness::new();
    let gateway = harness.connected().await;

    gateway.launch_purchase("plus_6_renewing", None, None);
    gateway.flush().await.unwrap();
    assert_eq!(gateway.purchase_state(), PurchaseState::Error(PLAN_NOT_FOUND.to_string()));

    gateway.launch_purchase(MONTHLY, Some("stale-offer"), None);
    gateway.flush().await.unwrap();
    assert_eq!(
        gateway.purchase_state(),
        PurchaseState::Error(OFFER_UNAVAILABLE.to_string())
    );
    assert!(harness.store.launches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_launch_requires_connection() {
    let harness = Harness::new();
    harness.store.push_connect_result(Err(StoreFailure::new(
        StoreResponseCode::BillingUnavailable,
        "billing unavailable",
    )));
    let gateway = harness.spawn();
    wait_purchase_state(&gateway, |state| matches!(state, PurchaseState::Error(_))).await;

    gateway.launch_purchase(MONTHLY, None, None);
    gateway.flush().await.unwrap();

    assert_eq!(gateway.purchase_state(), PurchaseState::Error(NOT_CONNECTED.to_string()));
    assert!(harness.store.launches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_and_already_owned() {
    let harness = Harness::new();
    let gateway = harness.connected().await;

    harness.store.deliver_failure(StoreFailure::new(StoreResponseCode::UserCanceled, "cancelled"));
    gateway.flush().await.unwrap();
    assert_eq!(gateway.purchase_state(), PurchaseState::Cancelled);

    harness.store.set_purchases(vec![owned(MONTHLY, "owned-1")]);
    harness
        .store
        .deliver_failure(StoreFailure::new(StoreResponseCode::ItemAlreadyOwned, "owned"));
    gateway.flush().await.unwrap();
    wait_refreshed(&gateway).await;
    assert_eq!(gateway.purchase_state(), PurchaseState::Purchased);
    assert!(gateway.subscription_status().is_active);
}

#[tokio::test(start_paused = true)]
async fn test_purchase_of_unknown_product_fails_verification() {
    let harness = Harness::new();
    let gateway = harness.connected().await;

    let mut record = owned("legacy_product", "legacy-1");
    record.acknowledged = false;
    harness.store.deliver_purchase(record);

    assert_eq!(
        settled(&gateway).await,
        Some(PaymentProcessingState::Error(MISSING_PRODUCT.to_string()))
    );
    assert!(harness.surface.calls().is_empty());
}
